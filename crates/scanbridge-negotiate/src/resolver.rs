//! Candidate value resolution for a single capability

use scanbridge_core::task::Exception;
use scanbridge_core::{Owner, TaskError};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::capability::{CapValue, Capability, CapabilityDevice};

/// One value to try for a capability, with the policy that applies if the
/// device rejects it
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub value: CapValue,
    pub exception: Exception,
    pub owner: Owner,
    /// JSON path reported if this candidate ends the task
    pub json_key: String,
    /// The value as the task wrote it, echoed in the reply
    pub original: JsonValue,
}

/// Outcome of resolving one capability
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The device took the candidate at `index`
    Accepted {
        index: usize,
        value: CapValue,
        original: JsonValue,
    },
    /// Nothing was accepted; the device keeps its current value
    Unchanged,
    /// Nothing was accepted and the enclosing stream must be abandoned
    NextStream { json_key: String },
    /// Every candidate belonged to another vendor
    Skipped,
}

impl Resolution {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Resolution::Accepted { .. })
    }
}

/// Try candidates in order until the device accepts one.
///
/// If none is accepted, the exception of the last candidate actually tried
/// decides the outcome.
pub fn resolve<D: CapabilityDevice + ?Sized>(
    device: &mut D,
    cap: Capability,
    candidates: &[Candidate],
) -> Result<Resolution, TaskError> {
    let mut last_tried: Option<&Candidate> = None;

    for (index, candidate) in candidates.iter().enumerate() {
        if candidate.owner.is_foreign() {
            debug!(cap = %cap, json_key = %candidate.json_key, "Skipping foreign candidate");
            continue;
        }

        last_tried = Some(candidate);
        match device.set(cap, candidate.value) {
            Ok(()) => {
                debug!(cap = %cap, value = candidate.value, json_key = %candidate.json_key, "Candidate accepted");
                if let Some(companion) = cap.companion() {
                    if let Err(e) = device.set(companion, candidate.value) {
                        debug!(cap = %companion, error = %e, "Companion setting not applied");
                    }
                }
                return Ok(Resolution::Accepted {
                    index,
                    value: candidate.value,
                    original: candidate.original.clone(),
                });
            }
            Err(e) => {
                debug!(cap = %cap, value = candidate.value, json_key = %candidate.json_key, error = %e, "Candidate rejected");
            }
        }
    }

    let Some(last) = last_tried else {
        return Ok(if candidates.is_empty() {
            Resolution::Unchanged
        } else {
            Resolution::Skipped
        });
    };

    apply_policy(&last.exception, &last.json_key, &last.original)
}

/// Outcome of a node nothing could be set for
pub fn apply_policy(
    exception: &Exception,
    json_key: &str,
    original: &JsonValue,
) -> Result<Resolution, TaskError> {
    match exception {
        Exception::Fail => Err(TaskError::Rejected {
            json_key: json_key.to_string(),
            value: Some(display_value(original)),
        }),
        Exception::NextStream => Ok(Resolution::NextStream {
            json_key: json_key.to_string(),
        }),
        Exception::Ignore | Exception::Unrecognized(_) => Ok(Resolution::Unchanged),
    }
}

fn display_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityError;
    use crate::simulated::{DeviceProfile, SimulatedDevice};
    use serde_json::json;

    fn candidate(value: CapValue, exception: Exception, key: &str) -> Candidate {
        Candidate {
            value,
            exception,
            owner: Owner::Standard,
            json_key: key.to_string(),
            original: json!(value),
        }
    }

    #[test]
    fn test_stops_at_first_accepted() {
        let mut device = SimulatedDevice::new(DeviceProfile::default());
        let candidates = vec![
            candidate(1234, Exception::Ignore, "v0"),
            candidate(300, Exception::Ignore, "v1"),
            candidate(600, Exception::Ignore, "v2"),
        ];

        let resolution = resolve(&mut device, Capability::XResolution, &candidates).unwrap();
        assert_eq!(
            resolution,
            Resolution::Accepted {
                index: 1,
                value: 300,
                original: json!(300)
            }
        );

        let tried: Vec<_> = device
            .attempts()
            .iter()
            .filter(|a| a.cap == Capability::XResolution)
            .map(|a| a.value)
            .collect();
        assert_eq!(tried, vec![1234, 300]);
        assert_eq!(device.get(Capability::YResolution), Some(300));
    }

    #[test]
    fn test_last_candidate_decides() {
        let mut device = SimulatedDevice::new(DeviceProfile::default());

        let ignore_then_fail = vec![
            candidate(7, Exception::Ignore, "v0"),
            candidate(8, Exception::Fail, "v1"),
        ];
        let err = resolve(&mut device, Capability::XResolution, &ignore_then_fail).unwrap_err();
        assert_eq!(err.json_key(), Some("v1"));

        let fail_then_ignore = vec![
            candidate(7, Exception::Fail, "v0"),
            candidate(8, Exception::Ignore, "v1"),
        ];
        assert_eq!(
            resolve(&mut device, Capability::XResolution, &fail_then_ignore).unwrap(),
            Resolution::Unchanged
        );

        let next = vec![candidate(7, Exception::NextStream, "v0")];
        assert_eq!(
            resolve(&mut device, Capability::XResolution, &next).unwrap(),
            Resolution::NextStream {
                json_key: "v0".to_string()
            }
        );

        let odd = vec![candidate(7, Exception::Unrecognized("later".into()), "v0")];
        assert_eq!(
            resolve(&mut device, Capability::XResolution, &odd).unwrap(),
            Resolution::Unchanged
        );
    }

    #[test]
    fn test_foreign_candidates_are_skipped() {
        let mut device = SimulatedDevice::new(DeviceProfile::default());
        let mut foreign = candidate(300, Exception::Fail, "v0");
        foreign.owner = Owner::Foreign;

        assert_eq!(
            resolve(&mut device, Capability::XResolution, &[foreign.clone()]).unwrap(),
            Resolution::Skipped
        );
        assert!(device.attempts().is_empty());

        // The policy of a skipped candidate never applies
        let mixed = vec![candidate(7, Exception::Ignore, "v0"), foreign];
        assert_eq!(
            resolve(&mut device, Capability::XResolution, &mixed).unwrap(),
            Resolution::Unchanged
        );
        assert_eq!(
            resolve(&mut device, Capability::XResolution, &[]).unwrap(),
            Resolution::Unchanged
        );
    }

    /// Device whose Y axis refuses everything
    struct FixedY(SimulatedDevice);

    impl CapabilityDevice for FixedY {
        fn is_supported(&self, cap: Capability) -> bool {
            self.0.is_supported(cap)
        }

        fn get(&self, cap: Capability) -> Option<CapValue> {
            self.0.get(cap)
        }

        fn set(&mut self, cap: Capability, value: CapValue) -> Result<(), CapabilityError> {
            if cap == Capability::YResolution {
                return Err(CapabilityError::ReadOnly(cap));
            }
            self.0.set(cap, value)
        }

        fn reset_all(&mut self) {
            self.0.reset_all()
        }
    }

    #[test]
    fn test_companion_failure_is_tolerated() {
        let mut device = FixedY(SimulatedDevice::new(DeviceProfile::default()));

        let resolution = resolve(
            &mut device,
            Capability::XResolution,
            &[candidate(300, Exception::Fail, "v0")],
        )
        .unwrap();
        assert!(resolution.is_accepted());
        assert_eq!(device.get(Capability::XResolution), Some(300));
        assert_eq!(device.get(Capability::YResolution), Some(200));
    }
}
