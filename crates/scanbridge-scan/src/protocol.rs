//! Session command envelope
//!
//! Every command travels as
//! `{"kind":"twainlocalscanner","commandId":..,"method":..,"params":{..}}` and
//! comes back with the same kind, command id and method plus a `results`
//! object. Image bytes ride inside the JSON as base64.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use scanbridge_core::{ApiError, ApiStatus, Facility, ImageBlockMetadata, SessionSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::transport::{DeviceTransport, ImageTransfer, MetadataTransfer};

/// Envelope kind for session commands
pub const COMMAND_KIND: &str = "twainlocalscanner";

/// Path of the session endpoint
pub const SESSION_PATH: &str = "/privet/twaindirect/session";

/// Path of the device information endpoint
pub const INFO_PATH: &str = "/privet/info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Method {
    CreateSession,
    GetSession,
    WaitForEvents,
    SendTask,
    StartCapturing,
    StopCapturing,
    ReadImageBlockMetadata,
    ReadImageBlock,
    ReleaseImageBlocks,
    CloseSession,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::CreateSession => "createSession",
            Method::GetSession => "getSession",
            Method::WaitForEvents => "waitForEvents",
            Method::SendTask => "sendTask",
            Method::StartCapturing => "startCapturing",
            Method::StopCapturing => "stopCapturing",
            Method::ReadImageBlockMetadata => "readImageBlockMetadata",
            Method::ReadImageBlock => "readImageBlock",
            Method::ReleaseImageBlocks => "releaseImageBlocks",
            Method::CloseSession => "closeSession",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Last revision the caller has seen, for `waitForEvents`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_block_num: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub with_thumbnail: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub with_metadata: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_block_num_first: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_block_num_last: Option<u64>,
}

impl CommandParams {
    pub fn session(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub kind: String,
    pub command_id: String,
    pub method: Method,
    #[serde(default)]
    pub params: CommandParams,
}

impl CommandEnvelope {
    /// A command with a fresh command id
    pub fn new(method: Method, params: CommandParams) -> Self {
        Self {
            kind: COMMAND_KIND.to_string(),
            command_id: Uuid::new_v4().to_string(),
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResults {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ApiStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facility: Option<Facility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_key: Option<String>,
    /// Task value the device refused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ImageBlockMetadata>,
    /// Base64 image bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Base64 thumbnail bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
}

impl CommandResults {
    fn with_session(session: SessionSnapshot) -> Self {
        Self {
            success: true,
            session: Some(session),
            ..Self::default()
        }
    }

    fn from_error(err: &ApiError) -> Self {
        Self {
            success: false,
            code: Some(err.status),
            facility: Some(err.facility),
            description: Some(err.description.clone()),
            json_key: err.json_key.clone(),
            value: err.value.clone(),
            ..Self::default()
        }
    }

    /// The error a failed result describes
    pub fn to_error(&self) -> ApiError {
        let mut err = ApiError::new(
            self.facility.unwrap_or(Facility::Protocol),
            self.code.unwrap_or(ApiStatus::Critical),
            self.description.clone().unwrap_or_default(),
        );
        err.json_key = self.json_key.clone();
        err.value = self.value.clone();
        err
    }

    pub fn into_session(self) -> Result<SessionSnapshot, ApiError> {
        self.session
            .ok_or_else(|| ApiError::security("response carries no session"))
    }

    pub fn into_metadata_transfer(self) -> Result<MetadataTransfer, ApiError> {
        let thumbnail = decode(self.thumbnail.as_deref(), "thumbnail")?;
        let metadata = self
            .metadata
            .ok_or_else(|| ApiError::security("response carries no metadata"))?;
        let session = self
            .session
            .ok_or_else(|| ApiError::security("response carries no session"))?;
        Ok(MetadataTransfer {
            session,
            metadata,
            thumbnail,
        })
    }

    pub fn into_image_transfer(self) -> Result<ImageTransfer, ApiError> {
        let image = decode(self.image.as_deref(), "image")?
            .ok_or_else(|| ApiError::security("response carries no image"))?;
        let session = self
            .session
            .ok_or_else(|| ApiError::security("response carries no session"))?;
        Ok(ImageTransfer {
            session,
            image,
            metadata: self.metadata,
        })
    }
}

fn decode(field: Option<&str>, name: &str) -> Result<Option<Vec<u8>>, ApiError> {
    field
        .map(|b64| {
            STANDARD
                .decode(b64)
                .map_err(|e| ApiError::security(format!("{} is not valid base64: {}", name, e)))
        })
        .transpose()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub kind: String,
    pub command_id: String,
    pub method: Method,
    pub results: CommandResults,
}

impl ResponseEnvelope {
    fn answer(command: &CommandEnvelope, results: CommandResults) -> Self {
        Self {
            kind: command.kind.clone(),
            command_id: command.command_id.clone(),
            method: command.method,
            results,
        }
    }

    /// Check that this response answers `command`
    pub fn check(&self, command: &CommandEnvelope) -> Result<(), ApiError> {
        if self.kind != COMMAND_KIND {
            return Err(ApiError::security(format!("unexpected kind '{}'", self.kind)));
        }
        if self.command_id != command.command_id {
            return Err(ApiError::security(format!(
                "response commandId {} does not match request {}",
                self.command_id, command.command_id
            )));
        }
        if self.method != command.method {
            return Err(ApiError::security(format!(
                "response method {} does not match request {}",
                self.method, command.method
            )));
        }
        Ok(())
    }
}

/// Device identity served at [`INFO_PATH`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScannerInfo {
    pub version: String,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub manufacturer: String,
    pub model: String,
    pub vendor: Uuid,
    pub api: Vec<String>,
    /// How long the device holds a `waitForEvents` call, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_poll_ms: Option<u64>,
}

impl ScannerInfo {
    pub fn new(name: impl Into<String>, vendor: Uuid) -> Self {
        Self {
            version: "1.0".to_string(),
            name: name.into(),
            description: "Simulated document scanner".to_string(),
            device_type: "twaindirect".to_string(),
            manufacturer: "scanbridge".to_string(),
            model: env!("CARGO_PKG_VERSION").to_string(),
            vendor,
            api: vec![SESSION_PATH.to_string()],
            long_poll_ms: None,
        }
    }
}

/// Execute a command against a transport and wrap the outcome. Errors are
/// reported inside the results, never as a failed call.
pub async fn dispatch(transport: &dyn DeviceTransport, command: CommandEnvelope) -> ResponseEnvelope {
    trace!(method = %command.method, command_id = %command.command_id, "Dispatching command");

    if command.kind != COMMAND_KIND {
        let err = ApiError::security(format!("unexpected kind '{}'", command.kind));
        return ResponseEnvelope::answer(&command, CommandResults::from_error(&err));
    }

    let results = match execute(transport, &command).await {
        Ok(results) => results,
        Err(e) => {
            debug!(method = %command.method, error = %e, "Command failed");
            CommandResults::from_error(&e)
        }
    };
    ResponseEnvelope::answer(&command, results)
}

fn required(value: Option<u64>, name: &str) -> Result<u64, ApiError> {
    value.ok_or_else(|| {
        ApiError::protocol(ApiStatus::InvalidImageBlockNumber, format!("'{}' is required", name))
    })
}

fn session_id(params: &CommandParams) -> Result<&str, ApiError> {
    params.session_id.as_deref().ok_or_else(|| {
        ApiError::protocol(ApiStatus::InvalidSessionId, "'sessionId' is required")
    })
}

async fn execute(
    transport: &dyn DeviceTransport,
    command: &CommandEnvelope,
) -> Result<CommandResults, ApiError> {
    let params = &command.params;

    let session = match command.method {
        Method::CreateSession => transport.create_session().await?,
        Method::GetSession => transport.get_session(session_id(params)?).await?,
        Method::WaitForEvents => {
            transport
                .wait_for_events(session_id(params)?, params.revision.unwrap_or(0))
                .await?
        }
        Method::SendTask => {
            let task = params
                .task
                .clone()
                .unwrap_or_else(|| JsonValue::Object(Default::default()));
            transport.send_task(session_id(params)?, &task).await?
        }
        Method::StartCapturing => transport.start_capturing(session_id(params)?).await?,
        Method::StopCapturing => transport.stop_capturing(session_id(params)?).await?,
        Method::ReadImageBlockMetadata => {
            let number = required(params.image_block_num, "imageBlockNum")?;
            let transfer = transport
                .read_image_block_metadata(session_id(params)?, number, params.with_thumbnail)
                .await?;
            return Ok(CommandResults {
                metadata: Some(transfer.metadata),
                thumbnail: transfer.thumbnail.map(|t| STANDARD.encode(t)),
                ..CommandResults::with_session(transfer.session)
            });
        }
        Method::ReadImageBlock => {
            let number = required(params.image_block_num, "imageBlockNum")?;
            let transfer = transport
                .read_image_block(session_id(params)?, number, params.with_metadata)
                .await?;
            return Ok(CommandResults {
                metadata: transfer.metadata,
                image: Some(STANDARD.encode(&transfer.image)),
                ..CommandResults::with_session(transfer.session)
            });
        }
        Method::ReleaseImageBlocks => {
            let first = required(params.image_block_num_first, "imageBlockNumFirst")?;
            let last = required(params.image_block_num_last, "imageBlockNumLast")?;
            transport
                .release_image_blocks(session_id(params)?, first, last)
                .await?
        }
        Method::CloseSession => transport.close_session(session_id(params)?).await?,
    };

    Ok(CommandResults::with_session(session))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_wire_shape() {
        let command = CommandEnvelope::new(
            Method::ReleaseImageBlocks,
            CommandParams {
                image_block_num_first: Some(1),
                image_block_num_last: Some(3),
                ..CommandParams::session("abc")
            },
        );
        let value = serde_json::to_value(&command).unwrap();

        assert_eq!(value["kind"], json!("twainlocalscanner"));
        assert_eq!(value["method"], json!("releaseImageBlocks"));
        assert_eq!(
            value["params"],
            json!({"sessionId":"abc","imageBlockNumFirst":1,"imageBlockNumLast":3})
        );
    }

    #[test]
    fn test_response_check() {
        let command = CommandEnvelope::new(Method::GetSession, CommandParams::session("abc"));
        let mut response =
            ResponseEnvelope::answer(&command, CommandResults::with_session(SessionSnapshot::no_session()));
        assert!(response.check(&command).is_ok());

        response.command_id = Uuid::new_v4().to_string();
        let err = response.check(&command).unwrap_err();
        assert_eq!(err.facility, Facility::Security);
    }

    #[test]
    fn test_error_results_round_trip() {
        let err = ApiError::from(scanbridge_core::TaskError::Rejected {
            json_key: "actions[0].action".to_string(),
            value: Some("calibrate".to_string()),
        });
        let results = CommandResults::from_error(&err);
        let parsed: CommandResults =
            serde_json::from_value(serde_json::to_value(&results).unwrap()).unwrap();

        let back = parsed.to_error();
        assert_eq!(back.facility, Facility::Language);
        assert_eq!(back.status, ApiStatus::InvalidCapturingOptions);
        assert_eq!(back.json_key.as_deref(), Some("actions[0].action"));
        assert_eq!(back.value.as_deref(), Some("calibrate"));
    }

    #[test]
    fn test_info_long_poll_is_optional() {
        let mut info = ScannerInfo::new("desk", Uuid::nil());
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("longPollMs").is_none());

        let parsed: ScannerInfo = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.long_poll_ms, None);

        info.long_poll_ms = Some(30_000);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["longPollMs"], 30_000);
    }

    #[test]
    fn test_bad_base64_is_security_error() {
        let results = CommandResults {
            image: Some("***".to_string()),
            ..CommandResults::with_session(SessionSnapshot::no_session())
        };
        let err = results.into_image_transfer().unwrap_err();
        assert_eq!(err.facility, Facility::Security);
    }
}
