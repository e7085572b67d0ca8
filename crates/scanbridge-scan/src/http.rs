//! Remote scanner over HTTP

use async_trait::async_trait;
use reqwest::Client;
use scanbridge_core::{ApiError, SessionSnapshot};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, trace};

use crate::protocol::{
    CommandEnvelope, CommandParams, CommandResults, Method, ResponseEnvelope, ScannerInfo,
    INFO_PATH, SESSION_PATH,
};
use crate::transport::{DeviceTransport, ImageTransfer, MetadataTransfer};

/// Extra time allowed on top of the device's long-poll window
const LONG_POLL_GRACE: Duration = Duration::from_secs(5);

/// Posts session commands to a remote scanner
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    timeout: Duration,
    long_poll: Duration,
}

impl HttpTransport {
    /// `timeout` bounds ordinary calls; `long_poll` is the device's
    /// `waitForEvents` window
    pub fn new(base_url: &str, timeout: Duration, long_poll: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ApiError::transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            long_poll,
        })
    }

    /// Use the long-poll window a device advertised
    pub fn with_long_poll(mut self, long_poll: Duration) -> Self {
        self.long_poll = long_poll;
        self
    }

    pub fn long_poll(&self) -> Duration {
        self.long_poll
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the device identity
    pub async fn info(&self) -> Result<ScannerInfo, ApiError> {
        let url = format!("{}{}", self.base_url, INFO_PATH);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ApiError::transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::transport(e.to_string()))?;
        if !status.is_success() {
            return Err(ApiError::transport(format!("{} returned {}", url, status))
                .with_http_status(status.as_u16())
                .with_response(body));
        }
        serde_json::from_str(&body).map_err(|e| {
            ApiError::security(format!("malformed device info: {}", e)).with_response(body)
        })
    }

    async fn call(&self, method: Method, params: CommandParams) -> Result<CommandResults, ApiError> {
        let command = CommandEnvelope::new(method, params);
        let timeout = if method == Method::WaitForEvents {
            self.long_poll + LONG_POLL_GRACE
        } else {
            self.timeout
        };
        let url = format!("{}{}", self.base_url, SESSION_PATH);
        trace!(method = %method, command_id = %command.command_id, "Posting command");

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&command)
            .send()
            .await
            .map_err(|e| ApiError::transport(format!("{} failed: {}", method, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::transport(format!("{} failed: {}", method, e)))?;

        if !status.is_success() {
            return Err(ApiError::transport(format!("{} returned {}", method, status))
                .with_http_status(status.as_u16())
                .with_response(body));
        }

        let envelope: ResponseEnvelope = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                return Err(ApiError::security(format!("malformed {} response: {}", method, e))
                    .with_response(body))
            }
        };
        if let Err(e) = envelope.check(&command) {
            return Err(e.with_response(body));
        }

        if !envelope.results.success {
            let err = envelope.results.to_error().with_response(body);
            debug!(method = %method, error = %err, "Command rejected by device");
            return Err(err);
        }
        Ok(envelope.results)
    }

    async fn session_call(
        &self,
        method: Method,
        params: CommandParams,
    ) -> Result<SessionSnapshot, ApiError> {
        self.call(method, params).await?.into_session()
    }
}

#[async_trait]
impl DeviceTransport for HttpTransport {
    async fn create_session(&self) -> Result<SessionSnapshot, ApiError> {
        self.session_call(Method::CreateSession, CommandParams::default())
            .await
    }

    async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot, ApiError> {
        self.session_call(Method::GetSession, CommandParams::session(session_id))
            .await
    }

    async fn wait_for_events(
        &self,
        session_id: &str,
        revision: u64,
    ) -> Result<SessionSnapshot, ApiError> {
        let params = CommandParams {
            revision: Some(revision),
            ..CommandParams::session(session_id)
        };
        self.session_call(Method::WaitForEvents, params).await
    }

    async fn send_task(
        &self,
        session_id: &str,
        task: &JsonValue,
    ) -> Result<SessionSnapshot, ApiError> {
        let params = CommandParams {
            task: Some(task.clone()),
            ..CommandParams::session(session_id)
        };
        self.session_call(Method::SendTask, params).await
    }

    async fn start_capturing(&self, session_id: &str) -> Result<SessionSnapshot, ApiError> {
        self.session_call(Method::StartCapturing, CommandParams::session(session_id))
            .await
    }

    async fn stop_capturing(&self, session_id: &str) -> Result<SessionSnapshot, ApiError> {
        self.session_call(Method::StopCapturing, CommandParams::session(session_id))
            .await
    }

    async fn read_image_block_metadata(
        &self,
        session_id: &str,
        number: u64,
        with_thumbnail: bool,
    ) -> Result<MetadataTransfer, ApiError> {
        let params = CommandParams {
            image_block_num: Some(number),
            with_thumbnail,
            ..CommandParams::session(session_id)
        };
        self.call(Method::ReadImageBlockMetadata, params)
            .await?
            .into_metadata_transfer()
    }

    async fn read_image_block(
        &self,
        session_id: &str,
        number: u64,
        with_metadata: bool,
    ) -> Result<ImageTransfer, ApiError> {
        let params = CommandParams {
            image_block_num: Some(number),
            with_metadata,
            ..CommandParams::session(session_id)
        };
        self.call(Method::ReadImageBlock, params)
            .await?
            .into_image_transfer()
    }

    async fn release_image_blocks(
        &self,
        session_id: &str,
        first: u64,
        last: u64,
    ) -> Result<SessionSnapshot, ApiError> {
        let params = CommandParams {
            image_block_num_first: Some(first),
            image_block_num_last: Some(last),
            ..CommandParams::session(session_id)
        };
        self.session_call(Method::ReleaseImageBlocks, params).await
    }

    async fn close_session(&self, session_id: &str) -> Result<SessionSnapshot, ApiError> {
        self.session_call(Method::CloseSession, CommandParams::session(session_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanbridge_core::Facility;

    #[tokio::test]
    async fn test_unreachable_device_is_transport_error() {
        let transport = HttpTransport::new(
            "http://127.0.0.1:9/",
            Duration::from_millis(500),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(transport.base_url(), "http://127.0.0.1:9");

        let err = transport.create_session().await.unwrap_err();
        assert_eq!(err.facility, Facility::HttpStatus);
        assert!(err.is_fatal());
    }
}
