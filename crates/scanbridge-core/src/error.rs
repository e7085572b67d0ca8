//! Error taxonomy
//!
//! Errors are tagged with the facility that produced them. Task and session
//! errors convert into [`ApiError`], which is what crosses a transport and what
//! the scan loop records as its first failure.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::session::SessionState;

/// Where an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facility {
    /// Unexpected internal condition
    Undefined,
    /// Request-level failure: timeout, connection loss, non-2xx status
    HttpStatus,
    /// Malformed or untrusted response
    Security,
    /// Device protocol error code
    Protocol,
    /// The task itself was rejected
    Language,
}

impl Facility {
    pub fn as_str(self) -> &'static str {
        match self {
            Facility::Undefined => "undefined",
            Facility::HttpStatus => "httpstatus",
            Facility::Security => "security",
            Facility::Protocol => "protocol",
            Facility::Language => "language",
        }
    }
}

impl fmt::Display for Facility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status codes reported by the device protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApiStatus {
    Success,
    NewSessionNotAllowed,
    InvalidSessionId,
    ClosedSession,
    NotReady,
    NotCapturing,
    InvalidImageBlockNumber,
    InvalidCapturingOptions,
    InvalidState,
    Busy,
    InvalidJson,
    InvalidTask,
    SessionTimedOut,
    PaperJam,
    DoubleFeed,
    CoverOpen,
    NoMedia,
    FoldedCorner,
    Critical,
    ProtocolError,
    CommunicationError,
}

impl ApiStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiStatus::Success => "success",
            ApiStatus::NewSessionNotAllowed => "newSessionNotAllowed",
            ApiStatus::InvalidSessionId => "invalidSessionId",
            ApiStatus::ClosedSession => "closedSession",
            ApiStatus::NotReady => "notReady",
            ApiStatus::NotCapturing => "notCapturing",
            ApiStatus::InvalidImageBlockNumber => "invalidImageBlockNumber",
            ApiStatus::InvalidCapturingOptions => "invalidCapturingOptions",
            ApiStatus::InvalidState => "invalidState",
            ApiStatus::Busy => "busy",
            ApiStatus::InvalidJson => "invalidJson",
            ApiStatus::InvalidTask => "invalidTask",
            ApiStatus::SessionTimedOut => "sessionTimedOut",
            ApiStatus::PaperJam => "paperJam",
            ApiStatus::DoubleFeed => "doubleFeed",
            ApiStatus::CoverOpen => "coverOpen",
            ApiStatus::NoMedia => "noMedia",
            ApiStatus::FoldedCorner => "foldedCorner",
            ApiStatus::Critical => "critical",
            ApiStatus::ProtocolError => "protocolError",
            ApiStatus::CommunicationError => "communicationError",
        }
    }

    /// Human-facing remediation hint
    pub fn hint(self) -> &'static str {
        match self {
            ApiStatus::Success => "No action needed.",
            ApiStatus::NewSessionNotAllowed => {
                "The scanner is in use by another session. Try again after it is closed."
            }
            ApiStatus::InvalidSessionId => "The session is unknown to the scanner. Open a new session.",
            ApiStatus::ClosedSession => "The session was closed. Open a new session.",
            ApiStatus::NotReady => "The scanner is busy with another operation. Wait and retry.",
            ApiStatus::NotCapturing => "The scanner is not capturing. Start capturing first.",
            ApiStatus::InvalidImageBlockNumber => {
                "The requested image block does not exist or was already released."
            }
            ApiStatus::InvalidCapturingOptions => {
                "The scanner could not honor the task. Check the reported JSON key."
            }
            ApiStatus::InvalidState => "The command is not allowed in the current session state.",
            ApiStatus::Busy => "The scanner is busy. Wait and retry.",
            ApiStatus::InvalidJson => "The task is not valid JSON.",
            ApiStatus::InvalidTask => "The task structure is invalid. Check the reported JSON key.",
            ApiStatus::SessionTimedOut => "The session timed out. Open a new session.",
            ApiStatus::PaperJam => "Clear the paper jam and retry.",
            ApiStatus::DoubleFeed => "Two or more sheets were fed at once. Reload the feeder and retry.",
            ApiStatus::CoverOpen => "Close the scanner cover and retry.",
            ApiStatus::NoMedia => "Load paper into the feeder or onto the flatbed and retry.",
            ApiStatus::FoldedCorner => "A sheet has a folded corner. Straighten it and retry.",
            ApiStatus::Critical => "An unexpected error occurred. Check the logs.",
            ApiStatus::ProtocolError => "The scanner sent an unexpected response.",
            ApiStatus::CommunicationError => "Check the connection to the scanner.",
        }
    }
}

impl fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task that could not be parsed or could not be honored
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("Invalid task at '{json_key}': {reason}")]
    Invalid { json_key: String, reason: String },
    #[error("Task rejected at '{json_key}'")]
    Rejected {
        json_key: String,
        value: Option<String>,
    },
    #[error("No stream could be satisfied, last escalation at '{json_key}'")]
    Exhausted { json_key: String },
}

impl TaskError {
    pub fn json_key(&self) -> Option<&str> {
        match self {
            TaskError::InvalidJson(_) => None,
            TaskError::Invalid { json_key, .. }
            | TaskError::Rejected { json_key, .. }
            | TaskError::Exhausted { json_key } => Some(json_key),
        }
    }

    /// The task value the device refused, as written in the task
    pub fn value(&self) -> Option<&str> {
        match self {
            TaskError::Rejected { value, .. } => value.as_deref(),
            _ => None,
        }
    }

    /// Exception name reported back in a failed task reply
    pub fn exception(&self) -> &'static str {
        match self {
            TaskError::Exhausted { .. } => "nextStream",
            _ => "fail",
        }
    }

    pub fn status(&self) -> ApiStatus {
        match self {
            TaskError::InvalidJson(_) => ApiStatus::InvalidJson,
            TaskError::Invalid { .. } => ApiStatus::InvalidTask,
            TaskError::Rejected { .. } | TaskError::Exhausted { .. } => {
                ApiStatus::InvalidCapturingOptions
            }
        }
    }
}

/// Violations of the session state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("A session is already open")]
    NewSessionNotAllowed,
    #[error("Session id {0} does not match the open session")]
    InvalidSessionId(String),
    #[error("Session is closed")]
    Closed,
    #[error("Session timed out")]
    TimedOut,
    #[error("Session is not ready (state {0})")]
    NotReady(SessionState),
    #[error("Session is not capturing (state {0})")]
    NotCapturing(SessionState),
    #[error("Image block {0} is not available")]
    InvalidImageBlockNumber(u64),
    #[error("Invalid image block range {first}..={last}")]
    InvalidRange { first: u64, last: u64 },
}

impl SessionError {
    pub fn status(&self) -> ApiStatus {
        match self {
            SessionError::NewSessionNotAllowed => ApiStatus::NewSessionNotAllowed,
            SessionError::InvalidSessionId(_) => ApiStatus::InvalidSessionId,
            SessionError::Closed => ApiStatus::ClosedSession,
            SessionError::TimedOut => ApiStatus::SessionTimedOut,
            SessionError::NotReady(_) => ApiStatus::NotReady,
            SessionError::NotCapturing(_) => ApiStatus::NotCapturing,
            SessionError::InvalidImageBlockNumber(_) | SessionError::InvalidRange { .. } => {
                ApiStatus::InvalidImageBlockNumber
            }
        }
    }
}

/// Facility-tagged error with the full context of the failing operation
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{facility} error ({status}): {description}")]
pub struct ApiError {
    pub facility: Facility,
    pub status: ApiStatus,
    pub description: String,
    /// JSON path of the offending task node, for language errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_key: Option<String>,
    /// Task value the device refused, for language errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Raw response body, when the error came back over a transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl ApiError {
    pub fn new(facility: Facility, status: ApiStatus, description: impl Into<String>) -> Self {
        Self {
            facility,
            status,
            description: description.into(),
            json_key: None,
            value: None,
            http_status: None,
            response: None,
        }
    }

    pub fn protocol(status: ApiStatus, description: impl Into<String>) -> Self {
        Self::new(Facility::Protocol, status, description)
    }

    pub fn transport(description: impl Into<String>) -> Self {
        Self::new(Facility::HttpStatus, ApiStatus::CommunicationError, description)
    }

    pub fn security(description: impl Into<String>) -> Self {
        Self::new(Facility::Security, ApiStatus::ProtocolError, description)
    }

    pub fn undefined(description: impl Into<String>) -> Self {
        Self::new(Facility::Undefined, ApiStatus::Critical, description)
    }

    pub fn with_json_key(mut self, json_key: impl Into<String>) -> Self {
        self.json_key = Some(json_key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    pub fn hint(&self) -> &'static str {
        self.status.hint()
    }

    /// Whether the current run cannot continue after this error.
    /// Protocol and language errors leave the session usable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.facility, Facility::Protocol | Facility::Language)
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        let mut api = ApiError::new(Facility::Language, err.status(), err.to_string());
        api.json_key = err.json_key().map(str::to_string);
        api.value = err.value().map(str::to_string);
        api
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        ApiError::protocol(err.status(), err.to_string())
    }
}
