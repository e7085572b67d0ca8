//! Task processing: parse, dispatch actions, collect the reply

use scanbridge_core::reply::ActionReply;
use scanbridge_core::task::{ActionKind, Task};
use scanbridge_core::{TaskBuilder, TaskError, TaskReply, VendorIdentity};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::capability::CapabilityDevice;
use crate::selector::{select_stream, Negotiated};

/// A task that was accepted
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub reply: TaskReply,
    /// Result of the last `configure` action, if any
    pub configured: Option<Negotiated>,
    /// The task asked for a scan
    pub scan_requested: bool,
}

/// A task that could not be honored, with the action it failed in
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{error}")]
pub struct TaskFailure {
    pub action: String,
    #[source]
    pub error: TaskError,
}

impl TaskFailure {
    /// Reply describing the failure
    pub fn reply(&self) -> TaskReply {
        TaskReply::failure(&self.action, &self.error)
    }
}

/// Turns tasks into device settings
#[derive(Debug, Clone, Default)]
pub struct NegotiationEngine {
    builder: TaskBuilder,
}

impl NegotiationEngine {
    pub fn new(identity: VendorIdentity) -> Self {
        Self {
            builder: TaskBuilder::new(identity),
        }
    }

    /// Negotiate task text
    pub fn process_str<D: CapabilityDevice + ?Sized>(
        &self,
        device: &mut D,
        text: &str,
    ) -> Result<TaskOutcome, TaskFailure> {
        let task = self.builder.parse(text).map_err(unparsed)?;
        self.process_task(device, &task)
    }

    /// Negotiate an already-parsed JSON task
    pub fn process<D: CapabilityDevice + ?Sized>(
        &self,
        device: &mut D,
        task: &JsonValue,
    ) -> Result<TaskOutcome, TaskFailure> {
        let task = self.builder.build(task).map_err(unparsed)?;
        self.process_task(device, &task)
    }

    pub fn process_task<D: CapabilityDevice + ?Sized>(
        &self,
        device: &mut D,
        task: &Task,
    ) -> Result<TaskOutcome, TaskFailure> {
        let mut outcome = TaskOutcome {
            reply: TaskReply::default(),
            configured: None,
            scan_requested: false,
        };

        if task.actions.is_empty() {
            debug!("Task has no actions, keeping device defaults");
        }

        for action in &task.actions {
            if action.node.is_foreign() {
                debug!(json_key = %action.node.json_key, "Skipping foreign action");
                continue;
            }

            let failed = |error| TaskFailure {
                action: action.kind.as_str().to_string(),
                error,
            };

            match &action.kind {
                ActionKind::Configure => {
                    let negotiated = select_stream(device, action).map_err(failed)?;
                    outcome.reply.actions.push(negotiated.reply.clone());
                    outcome.configured = Some(negotiated);
                }
                ActionKind::Scan => {
                    outcome.scan_requested = true;
                    outcome.reply.actions.push(ActionReply::new("scan"));
                }
                ActionKind::Other(name) if action.node.exception.is_fail() => {
                    warn!(action = %name, "Unsupported action with exception fail");
                    return Err(failed(TaskError::Rejected {
                        json_key: action.node.key("action"),
                        value: Some(name.clone()),
                    }));
                }
                ActionKind::Other(name) => {
                    debug!(action = %name, "Ignoring unsupported action");
                }
            }
        }

        info!(
            actions = outcome.reply.actions.len(),
            scan = outcome.scan_requested,
            "Task negotiated"
        );
        Ok(outcome)
    }
}

fn unparsed(error: TaskError) -> TaskFailure {
    TaskFailure {
        action: "configure".to_string(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{DeviceProfile, SimulatedDevice};
    use scanbridge_core::ApiStatus;
    use serde_json::json;

    fn engine() -> NegotiationEngine {
        NegotiationEngine::default()
    }

    #[test]
    fn test_empty_task_replies_empty_object() {
        let mut device = SimulatedDevice::new(DeviceProfile::default());
        let outcome = engine().process(&mut device, &json!({})).unwrap();

        assert_eq!(outcome.reply.to_json(), json!({}));
        assert!(outcome.configured.is_none());
        assert!(!outcome.scan_requested);
    }

    #[test]
    fn test_configure_then_scan() {
        let mut device = SimulatedDevice::new(DeviceProfile::default());
        let outcome = engine()
            .process(
                &mut device,
                &json!({"actions":[
                    {"action":"configure","streams":[{"sources":[{"source":"flatbed"}]}]},
                    {"action":"scan"}
                ]}),
            )
            .unwrap();

        assert!(outcome.scan_requested);
        assert_eq!(outcome.reply.actions.len(), 2);
        assert_eq!(outcome.reply.actions[1].action, "scan");
        assert!(outcome.configured.unwrap().flatbed);
    }

    #[test]
    fn test_unknown_action() {
        let mut device = SimulatedDevice::new(DeviceProfile::default());

        let outcome = engine()
            .process(&mut device, &json!({"actions":[{"action":"calibrate"}]}))
            .unwrap();
        assert!(outcome.reply.actions.is_empty());

        let failure = engine()
            .process(
                &mut device,
                &json!({"actions":[{"action":"calibrate","exception":"fail"}]}),
            )
            .unwrap_err();
        assert_eq!(failure.error.json_key(), Some("actions[0].action"));
        assert_eq!(
            failure.reply().to_json()["actions"][0]["results"]["jsonKey"],
            json!("actions[0].action")
        );
    }

    #[test]
    fn test_invalid_json() {
        let mut device = SimulatedDevice::new(DeviceProfile::default());
        let failure = engine().process_str(&mut device, "{not json").unwrap_err();

        assert_eq!(failure.error.status(), ApiStatus::InvalidJson);
        assert!(!failure.reply().is_success());
    }

    #[test]
    fn test_failure_reply_names_action() {
        let mut device = SimulatedDevice::new(DeviceProfile {
            flatbed: false,
            ..DeviceProfile::default()
        });
        let failure = engine()
            .process_str(
                &mut device,
                r#"{"actions":[{"action":"configure","exception":"fail",
                    "streams":[{"sources":[{"source":"flatbed"}]}]}]}"#,
            )
            .unwrap_err();

        assert_eq!(failure.action, "configure");
        assert_eq!(
            failure.reply().to_json()["actions"][0]["results"],
            json!({"success":false,"exception":"fail","jsonKey":"actions[0].streams[0].sources[0].source"})
        );
    }
}
