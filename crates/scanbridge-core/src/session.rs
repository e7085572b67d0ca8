//! Session state machine and image-block bookkeeping
//!
//! States: `noSession → ready → capturing → draining → (ready | closed)`.
//! `draining → ready` needs every block released and the client's
//! `stopCapturing` acknowledging the end of the capture.
//! The device role owns a [`Session`] and mutates it from a single driver;
//! every change bumps the revision so waiters can tell that something moved.
//! Clients only ever see [`SessionSnapshot`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ApiStatus, SessionError};
use crate::reply::TaskReply;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    NoSession,
    Ready,
    Capturing,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::NoSession => "noSession",
            SessionState::Ready => "ready",
            SessionState::Capturing => "capturing",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }

    /// Image blocks can only be listed, read and released in these states
    pub fn is_transferring(self) -> bool {
        matches!(self, SessionState::Capturing | SessionState::Draining)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition the device detected while capturing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Detected {
    #[default]
    Nominal,
    PaperJam,
    DoubleFeed,
    CoverOpen,
    NoMedia,
    FoldedCorner,
}

impl Detected {
    pub fn status(self) -> Option<ApiStatus> {
        match self {
            Detected::Nominal => None,
            Detected::PaperJam => Some(ApiStatus::PaperJam),
            Detected::DoubleFeed => Some(ApiStatus::DoubleFeed),
            Detected::CoverOpen => Some(ApiStatus::CoverOpen),
            Detected::NoMedia => Some(ApiStatus::NoMedia),
            Detected::FoldedCorner => Some(ApiStatus::FoldedCorner),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub success: bool,
    pub detected: Detected,
}

impl DeviceStatus {
    fn from_detected(detected: Detected) -> Self {
        Self {
            success: detected == Detected::Nominal,
            detected,
        }
    }
}

/// Point-in-time view of a session, returned by every transport call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub revision: u64,
    pub state: SessionState,
    #[serde(default)]
    pub image_blocks: Vec<u64>,
    #[serde(default)]
    pub image_blocks_drained: bool,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskReply>,
}

impl SessionSnapshot {
    /// Snapshot reported when no session exists
    pub fn no_session() -> Self {
        Self {
            session_id: String::new(),
            revision: 0,
            state: SessionState::NoSession,
            image_blocks: Vec::new(),
            image_blocks_drained: false,
            status: DeviceStatus::from_detected(Detected::Nominal),
            task: None,
        }
    }
}

/// Authoritative session owned by the device role
#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    state: SessionState,
    revision: u64,
    created_at: DateTime<Utc>,
    pending: BTreeSet<u64>,
    read: BTreeSet<u64>,
    next_block: u64,
    drained: bool,
    stop_requested: bool,
    abort_requested: bool,
    timed_out: bool,
    detected: Detected,
    task: Option<TaskReply>,
}

impl Session {
    /// Open a session; the device is ready with an empty image-block set
    pub fn open() -> Self {
        let session = Self {
            id: Uuid::new_v4(),
            state: SessionState::Ready,
            revision: 1,
            created_at: Utc::now(),
            pending: BTreeSet::new(),
            read: BTreeSet::new(),
            next_block: 1,
            drained: false,
            stop_requested: false,
            abort_requested: false,
            timed_out: false,
            detected: Detected::Nominal,
            task: None,
        };
        info!(session = %session.id, "Session opened");
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn task(&self) -> Option<&TaskReply> {
        self.task.as_ref()
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort_requested
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    fn closed_error(&self) -> SessionError {
        if self.timed_out {
            SessionError::TimedOut
        } else {
            SessionError::Closed
        }
    }

    fn touch(&mut self) {
        self.revision += 1;
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(session = %self.id, from = %self.state, to = %state, "Session state change");
            self.state = state;
        }
    }

    /// Validate a caller-supplied session id
    pub fn check_id(&self, id: &str) -> Result<(), SessionError> {
        let matches = Uuid::parse_str(id).map(|u| u == self.id).unwrap_or(false);
        if !matches {
            return Err(SessionError::InvalidSessionId(id.to_string()));
        }
        if self.state == SessionState::Closed {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn require_transferring(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Closed => Err(self.closed_error()),
            s if s.is_transferring() => Ok(()),
            s => Err(SessionError::NotCapturing(s)),
        }
    }

    /// Store the reply of a negotiated task
    pub fn set_task(&mut self, reply: TaskReply) -> Result<(), SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotReady(self.state));
        }
        self.task = Some(reply);
        self.touch();
        Ok(())
    }

    /// `ready → capturing`
    pub fn start_capturing(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::NotReady(self.state));
        }
        self.drained = false;
        self.stop_requested = false;
        self.abort_requested = false;
        self.detected = Detected::Nominal;
        self.read.clear();
        self.set_state(SessionState::Capturing);
        self.touch();
        info!(session = %self.id, "Capturing started");
        Ok(())
    }

    /// Whether the producer should stop at its next checkpoint
    pub fn should_stop_producing(&self) -> bool {
        self.stop_requested || self.abort_requested || !self.state.is_transferring() || self.drained
    }

    /// Number the next produced block will get
    pub fn next_block_number(&self) -> u64 {
        self.next_block
    }

    /// Record a block the device finished producing. A graceful stop still
    /// lets an in-flight block land while draining.
    pub fn push_image_block(&mut self) -> Result<u64, SessionError> {
        self.require_transferring()?;
        if self.drained {
            return Err(SessionError::NotCapturing(self.state));
        }
        let number = self.next_block;
        self.next_block += 1;
        self.pending.insert(number);
        self.touch();
        debug!(session = %self.id, block = number, "Image block ready");
        Ok(number)
    }

    /// The device will produce no further blocks in this capture cycle
    pub fn finish_capture(&mut self, detected: Detected) {
        if !self.state.is_transferring() {
            return;
        }
        self.drained = true;
        self.detected = detected;
        if self.state == SessionState::Capturing {
            self.set_state(SessionState::Draining);
        }
        if detected != Detected::Nominal {
            warn!(session = %self.id, detected = ?detected, "Capture ended by device condition");
        }
        self.settle();
        self.touch();
    }

    /// Graceful stop: `capturing → draining`
    pub fn stop_capturing(&mut self) -> Result<(), SessionError> {
        self.require_transferring()?;
        self.stop_requested = true;
        if self.state == SessionState::Capturing {
            self.set_state(SessionState::Draining);
        }
        self.settle();
        self.touch();
        info!(session = %self.id, "Stop capturing requested");
        Ok(())
    }

    /// Advisory abort, honored by the producer at its next checkpoint
    pub fn request_abort(&mut self) {
        if self.state == SessionState::Closed || self.abort_requested {
            return;
        }
        self.abort_requested = true;
        self.stop_requested = true;
        if self.state == SessionState::Capturing {
            self.set_state(SessionState::Draining);
        }
        self.settle();
        self.touch();
        warn!(session = %self.id, "Abort requested");
    }

    pub fn image_blocks(&self) -> Result<Vec<u64>, SessionError> {
        self.require_transferring()?;
        Ok(self.pending.iter().copied().collect())
    }

    pub fn is_drained(&self) -> Result<bool, SessionError> {
        self.require_transferring()?;
        Ok(self.drained)
    }

    /// Check that a block is pending, without marking it read
    pub fn ensure_pending(&self, number: u64) -> Result<(), SessionError> {
        self.require_transferring()?;
        if self.pending.contains(&number) {
            Ok(())
        } else {
            Err(SessionError::InvalidImageBlockNumber(number))
        }
    }

    /// Record that a block's image was transferred
    pub fn mark_read(&mut self, number: u64) -> Result<(), SessionError> {
        self.ensure_pending(number)?;
        self.read.insert(number);
        Ok(())
    }

    pub fn was_read(&self, number: u64) -> bool {
        self.read.contains(&number)
    }

    /// Release an inclusive range of blocks. Numbers already released are
    /// ignored; released numbers are never handed out again.
    pub fn release(&mut self, first: u64, last: u64) -> Result<Vec<u64>, SessionError> {
        self.require_transferring()?;
        if first == 0 || first > last {
            return Err(SessionError::InvalidRange { first, last });
        }

        let released: Vec<u64> = self.pending.range(first..=last).copied().collect();
        for number in &released {
            self.pending.remove(number);
            if !self.read.remove(number) {
                debug!(session = %self.id, block = number, "Released block that was never read");
            }
        }

        if !released.is_empty() {
            self.settle();
            self.touch();
        }
        Ok(released)
    }

    /// `draining → ready` once everything is released, the device is done and
    /// the client has stopped the capture
    fn settle(&mut self) {
        if self.state == SessionState::Draining
            && self.drained
            && self.stop_requested
            && self.pending.is_empty()
        {
            self.set_state(SessionState::Ready);
            info!(session = %self.id, "Session drained, ready for another capture");
        }
    }

    /// Close the session, discarding whatever is still pending
    pub fn close(&mut self) -> Vec<u64> {
        let discarded: Vec<u64> = std::mem::take(&mut self.pending).into_iter().collect();
        if !discarded.is_empty() {
            warn!(session = %self.id, blocks = ?discarded, "Discarding unreleased image blocks on close");
        }
        self.read.clear();
        self.abort_requested = true;
        self.set_state(SessionState::Closed);
        self.touch();
        info!(session = %self.id, "Session closed");
        discarded
    }

    /// Close a session nobody has talked to within the timeout
    pub fn expire(&mut self) -> Vec<u64> {
        warn!(session = %self.id, "Session timed out");
        self.timed_out = true;
        self.close()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.to_string(),
            revision: self.revision,
            state: self.state,
            image_blocks: self.pending.iter().copied().collect(),
            image_blocks_drained: self.drained,
            status: DeviceStatus::from_detected(self.detected),
            task: self.task.clone(),
        }
    }
}
