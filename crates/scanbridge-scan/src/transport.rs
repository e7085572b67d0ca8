//! Device transport seam
//!
//! The scan loop reaches a scanner only through [`DeviceTransport`]. The
//! in-process [`LocalScanner`](crate::local::LocalScanner) and the remote
//! [`HttpTransport`](crate::http::HttpTransport) both implement it.

use async_trait::async_trait;
use scanbridge_core::{ApiError, ImageBlockMetadata, SessionSnapshot};
use serde_json::Value as JsonValue;

/// Metadata of one block, with the session as it stood afterwards
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataTransfer {
    pub session: SessionSnapshot,
    pub metadata: ImageBlockMetadata,
    pub thumbnail: Option<Vec<u8>>,
}

/// Image bytes of one block
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTransfer {
    pub session: SessionSnapshot,
    pub image: Vec<u8>,
    /// Present when requested together with the image
    pub metadata: Option<ImageBlockMetadata>,
}

#[async_trait]
pub trait DeviceTransport: Send + Sync {
    async fn create_session(&self) -> Result<SessionSnapshot, ApiError>;

    async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot, ApiError>;

    /// Long poll: returns once the session revision is past `revision`, or
    /// when the device-side timeout expires
    async fn wait_for_events(
        &self,
        session_id: &str,
        revision: u64,
    ) -> Result<SessionSnapshot, ApiError>;

    async fn send_task(&self, session_id: &str, task: &JsonValue)
        -> Result<SessionSnapshot, ApiError>;

    async fn start_capturing(&self, session_id: &str) -> Result<SessionSnapshot, ApiError>;

    async fn stop_capturing(&self, session_id: &str) -> Result<SessionSnapshot, ApiError>;

    async fn read_image_block_metadata(
        &self,
        session_id: &str,
        number: u64,
        with_thumbnail: bool,
    ) -> Result<MetadataTransfer, ApiError>;

    async fn read_image_block(
        &self,
        session_id: &str,
        number: u64,
        with_metadata: bool,
    ) -> Result<ImageTransfer, ApiError>;

    /// Release the inclusive range `first..=last`
    async fn release_image_blocks(
        &self,
        session_id: &str,
        first: u64,
        last: u64,
    ) -> Result<SessionSnapshot, ApiError>;

    async fn close_session(&self, session_id: &str) -> Result<SessionSnapshot, ApiError>;
}
