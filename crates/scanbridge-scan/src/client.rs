//! Client-side session mirror
//!
//! Tracks the newest snapshot the device has returned so the scan loop can
//! ask for pending blocks and the drained flag without another round trip.

use scanbridge_core::{ApiError, DeviceStatus, SessionSnapshot, SessionState};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tracing::{debug, info};

use crate::transport::{DeviceTransport, ImageTransfer, MetadataTransfer};

pub struct ClientSession {
    transport: Arc<dyn DeviceTransport>,
    snapshot: SessionSnapshot,
}

impl ClientSession {
    /// Open a session on the device
    pub async fn open(transport: Arc<dyn DeviceTransport>) -> Result<Self, ApiError> {
        let snapshot = transport.create_session().await?;
        info!(session = %snapshot.session_id, "Client session opened");
        Ok(Self {
            transport,
            snapshot,
        })
    }

    pub fn id(&self) -> &str {
        &self.snapshot.session_id
    }

    pub fn transport(&self) -> &Arc<dyn DeviceTransport> {
        &self.transport
    }

    pub fn snapshot(&self) -> &SessionSnapshot {
        &self.snapshot
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.state
    }

    pub fn revision(&self) -> u64 {
        self.snapshot.revision
    }

    pub fn status(&self) -> DeviceStatus {
        self.snapshot.status
    }

    /// Pending block numbers, ascending
    pub fn image_blocks(&self) -> &[u64] {
        &self.snapshot.image_blocks
    }

    pub fn is_drained(&self) -> bool {
        self.snapshot.image_blocks_drained
    }

    /// Take a snapshot if it is newer than the one held. Concurrent workers
    /// may return out of order; older snapshots are dropped.
    pub fn apply(&mut self, snapshot: SessionSnapshot) {
        if snapshot.session_id != self.snapshot.session_id {
            debug!(got = %snapshot.session_id, "Ignoring snapshot of another session");
            return;
        }
        if snapshot.revision >= self.snapshot.revision {
            self.snapshot = snapshot;
        }
    }

    pub async fn refresh(&mut self) -> Result<(), ApiError> {
        let snapshot = self.transport.get_session(&self.snapshot.session_id).await?;
        self.apply(snapshot);
        Ok(())
    }

    /// Block until the device reports something newer than what we hold
    pub async fn wait_for_events(&mut self) -> Result<(), ApiError> {
        let snapshot = self
            .transport
            .wait_for_events(&self.snapshot.session_id, self.snapshot.revision)
            .await?;
        self.apply(snapshot);
        Ok(())
    }

    pub async fn send_task(&mut self, task: &JsonValue) -> Result<(), ApiError> {
        let snapshot = self
            .transport
            .send_task(&self.snapshot.session_id, task)
            .await?;
        self.apply(snapshot);
        Ok(())
    }

    pub async fn start_capturing(&mut self) -> Result<(), ApiError> {
        let snapshot = self
            .transport
            .start_capturing(&self.snapshot.session_id)
            .await?;
        self.apply(snapshot);
        Ok(())
    }

    pub async fn stop_capturing(&mut self) -> Result<(), ApiError> {
        let snapshot = self
            .transport
            .stop_capturing(&self.snapshot.session_id)
            .await?;
        self.apply(snapshot);
        Ok(())
    }

    pub async fn read_image_block_metadata(
        &mut self,
        number: u64,
        with_thumbnail: bool,
    ) -> Result<MetadataTransfer, ApiError> {
        let transfer = self
            .transport
            .read_image_block_metadata(&self.snapshot.session_id, number, with_thumbnail)
            .await?;
        self.apply(transfer.session.clone());
        Ok(transfer)
    }

    pub async fn read_image_block(
        &mut self,
        number: u64,
        with_metadata: bool,
    ) -> Result<ImageTransfer, ApiError> {
        let transfer = self
            .transport
            .read_image_block(&self.snapshot.session_id, number, with_metadata)
            .await?;
        self.apply(transfer.session.clone());
        Ok(transfer)
    }

    pub async fn release_image_blocks(&mut self, first: u64, last: u64) -> Result<(), ApiError> {
        let snapshot = self
            .transport
            .release_image_blocks(&self.snapshot.session_id, first, last)
            .await?;
        self.apply(snapshot);
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), ApiError> {
        let snapshot = self
            .transport
            .close_session(&self.snapshot.session_id)
            .await?;
        self.apply(snapshot);
        info!(session = %self.snapshot.session_id, "Client session closed");
        Ok(())
    }
}
