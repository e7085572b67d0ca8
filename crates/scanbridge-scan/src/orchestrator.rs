//! Scan loop
//!
//! Drives a client session from task to drained: send the task, start
//! capturing, then transfer and release image blocks as they appear until the
//! device reports it is drained. One `stopCapturing` per run ends the capture,
//! either as soon as the drain is seen or earlier on stop, abort or failure;
//! the device only returns to `ready` after it. The first failure is kept with its full
//! context; the loop then only does what is needed to leave the device clean
//! (one stop, releases) and later failures are logged.
//!
//! Two strategies share the loop. `Serial` handles pending blocks one after
//! another in ascending order. `Concurrent` hands each pending block to a
//! worker, bounded by a semaphore, and reaps all of them before looking for
//! the next batch.

use scanbridge_core::{ApiError, SessionState, TaskReply};
use serde_json::Value as JsonValue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::client::ClientSession;
use crate::sink::{ImageSink, TransferredBlock};
use crate::transport::DeviceTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanStrategy {
    #[default]
    Serial,
    Concurrent { workers: usize },
}

/// Shortest wait between stop and abort checks
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub strategy: ScanStrategy,
    /// How often a blocked wait checks for stop and abort
    pub poll_interval: Duration,
    /// Fetch metadata together with the image instead of in its own call
    pub metadata_with_image: bool,
    pub thumbnails: bool,
}

impl ScanOptions {
    pub fn new(strategy: ScanStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// Set the poll interval; a zero interval is raised to one millisecond
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(MIN_POLL_INTERVAL);
        self
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            strategy: ScanStrategy::default(),
            poll_interval: Duration::from_millis(250),
            metadata_with_image: true,
            thumbnails: false,
        }
    }
}

/// Stop and abort requests, shareable with signal handlers
#[derive(Debug, Clone, Default)]
pub struct ScanControl {
    stop: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
}

impl ScanControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish the current capture and collect what was already scanned
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop transferring, release what is pending and close
    pub fn request_abort(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

/// What a scan run did
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    /// Blocks delivered to the sink, in completion order
    pub transferred: Vec<u64>,
    /// Blocks released on the device, delivered or not
    pub released: Vec<u64>,
    pub drained: bool,
    /// A stop was sent to the device
    pub stopped: bool,
    pub aborted: bool,
    pub final_state: SessionState,
    /// Reply the device gave for the task
    pub task: Option<TaskReply>,
    /// The first failure of the run
    pub first_error: Option<ApiError>,
}

impl ScanReport {
    fn new() -> Self {
        Self {
            transferred: Vec::new(),
            released: Vec::new(),
            drained: false,
            stopped: false,
            aborted: false,
            final_state: SessionState::NoSession,
            task: None,
            first_error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.first_error.is_none()
    }

    /// Keep the first error; log the rest
    fn record(&mut self, operation: &str, err: ApiError) {
        match &self.first_error {
            None => {
                error!(
                    operation = %operation,
                    facility = %err.facility,
                    status = %err.status,
                    hint = err.hint(),
                    "{}",
                    err.description
                );
                self.first_error = Some(err);
            }
            Some(first) => {
                warn!(operation = %operation, error = %err, first = %first, "Further error after first failure");
            }
        }
    }
}

pub struct ScanRunner {
    options: ScanOptions,
}

impl ScanRunner {
    pub fn new(options: ScanOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Open a session, run the scan and close the session on every path.
    /// Fails only if no session could be opened.
    pub async fn scan(
        &self,
        transport: Arc<dyn DeviceTransport>,
        task: &JsonValue,
        sink: Arc<dyn ImageSink>,
        control: &ScanControl,
    ) -> Result<ScanReport, ApiError> {
        let mut session = ClientSession::open(transport).await?;
        let mut report = self.run(&mut session, task, sink, control).await;

        if let Err(e) = session.close().await {
            report.record("closeSession", e);
        }
        report.final_state = session.state();
        Ok(report)
    }

    /// Negotiate and capture on an open session
    pub async fn run(
        &self,
        session: &mut ClientSession,
        task: &JsonValue,
        sink: Arc<dyn ImageSink>,
        control: &ScanControl,
    ) -> ScanReport {
        let mut report = ScanReport::new();

        let sent = session.send_task(task).await;
        if session.refresh().await.is_ok() {
            report.task = session.snapshot().task.clone();
        }
        if let Err(e) = sent {
            report.record("sendTask", e);
            report.final_state = session.state();
            return report;
        }

        if control.is_abort_requested() {
            info!("Abort requested before capture");
            report.aborted = true;
            report.final_state = session.state();
            return report;
        }

        if let Err(e) = session.start_capturing().await {
            report.record("startCapturing", e);
            report.final_state = session.state();
            return report;
        }

        self.drive(session, &sink, control, &mut report).await;

        report.drained = session.is_drained();
        report.final_state = session.state();
        info!(
            transferred = report.transferred.len(),
            released = report.released.len(),
            drained = report.drained,
            aborted = report.aborted,
            "Scan loop finished"
        );
        report
    }

    async fn drive(
        &self,
        session: &mut ClientSession,
        sink: &Arc<dyn ImageSink>,
        control: &ScanControl,
        report: &mut ScanReport,
    ) {
        let mut stop_sent = false;
        let mut halted = false;
        let mut device_problem = false;

        loop {
            if control.is_abort_requested() && !report.aborted {
                warn!(session = %session.id(), "Abort requested");
                report.aborted = true;
            }

            let status = session.status();
            if !status.success && !device_problem {
                device_problem = true;
                if let Some(code) = status.detected.status() {
                    report.record(
                        "capture",
                        ApiError::protocol(code, format!("device reported {}", code)),
                    );
                }
            }

            let want_stop = control.is_stop_requested()
                || report.aborted
                || halted
                || device_problem
                || session.is_drained();
            if want_stop && !stop_sent && session.state().is_transferring() {
                stop_sent = true;
                report.stopped = true;
                if let Err(e) = session.stop_capturing().await {
                    report.record("stopCapturing", e);
                    report.aborted = true;
                }
            }

            if !session.state().is_transferring() {
                debug!(state = %session.state(), "Session left the transfer states");
                break;
            }

            let pending = session.image_blocks().to_vec();
            if let (Some(&first), Some(&last)) = (pending.first(), pending.last()) {
                if report.aborted || halted {
                    match session.release_image_blocks(first, last).await {
                        Ok(()) => {
                            info!(first = first, last = last, "Released untransferred image blocks");
                            report.released.extend(&pending);
                        }
                        Err(e) => {
                            report.record("releaseImageBlocks", e);
                            report.aborted = true;
                        }
                    }
                } else {
                    let failed = match self.options.strategy {
                        ScanStrategy::Serial => {
                            self.transfer_serial(session, &pending, sink, control, report)
                                .await
                        }
                        ScanStrategy::Concurrent { workers } => {
                            self.transfer_concurrent(session, &pending, workers, sink, control, report)
                                .await
                        }
                    };
                    halted |= failed;
                }
            }

            if report.aborted {
                break;
            }
            if session.is_drained() && session.image_blocks().is_empty() {
                if stop_sent {
                    break;
                }
                continue;
            }
            if !pending.is_empty() {
                continue;
            }

            if let Err(e) = self.wait(session, control, stop_sent).await {
                // Without events the session cannot be followed any further
                report.record("waitForEvents", e);
                report.aborted = true;
            }
        }
    }

    /// Returns whether a transfer failed
    async fn transfer_serial(
        &self,
        session: &mut ClientSession,
        pending: &[u64],
        sink: &Arc<dyn ImageSink>,
        control: &ScanControl,
        report: &mut ScanReport,
    ) -> bool {
        for &number in pending {
            if control.is_abort_requested() {
                return false;
            }
            let result = transfer_block(
                session.transport().as_ref(),
                session.id(),
                number,
                &self.options,
                sink.as_ref(),
            )
            .await;
            match result {
                Ok(snapshot) => {
                    session.apply(snapshot);
                    report.transferred.push(number);
                    report.released.push(number);
                }
                Err(e) => {
                    report.record(&format!("image block {}", number), e);
                    return true;
                }
            }
        }
        false
    }

    /// Returns whether a transfer failed
    async fn transfer_concurrent(
        &self,
        session: &mut ClientSession,
        pending: &[u64],
        workers: usize,
        sink: &Arc<dyn ImageSink>,
        control: &ScanControl,
        report: &mut ScanReport,
    ) -> bool {
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let failed = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();

        for &number in pending {
            if control.is_abort_requested() || failed.load(Ordering::SeqCst) {
                break;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };

            let transport = Arc::clone(session.transport());
            let session_id = session.id().to_string();
            let sink = Arc::clone(sink);
            let options = self.options.clone();
            let failed = Arc::clone(&failed);

            tasks.spawn(async move {
                let _permit = permit;
                let result =
                    transfer_block(transport.as_ref(), &session_id, number, &options, sink.as_ref())
                        .await;
                if result.is_err() {
                    failed.store(true, Ordering::SeqCst);
                }
                (number, result)
            });
        }

        let mut any_failed = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((number, Ok(snapshot))) => {
                    session.apply(snapshot);
                    report.transferred.push(number);
                    report.released.push(number);
                }
                Ok((number, Err(e))) => {
                    any_failed = true;
                    report.record(&format!("image block {}", number), e);
                }
                Err(e) => {
                    any_failed = true;
                    report.record("worker", ApiError::undefined(format!("scan worker failed: {}", e)));
                }
            }
        }
        debug!(batch = pending.len(), "Worker batch reaped");
        any_failed
    }

    /// Wait for a session update, giving up early on abort, or on stop when
    /// the stop has not reached the device yet
    async fn wait(
        &self,
        session: &mut ClientSession,
        control: &ScanControl,
        stop_sent: bool,
    ) -> Result<(), ApiError> {
        let mut ticker = tokio::time::interval(self.options.poll_interval());
        ticker.tick().await;

        let wait = session.wait_for_events();
        tokio::pin!(wait);

        loop {
            tokio::select! {
                result = &mut wait => return result,
                _ = ticker.tick() => {
                    if control.is_abort_requested()
                        || (!stop_sent && control.is_stop_requested())
                    {
                        debug!("Wait interrupted");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Read one block, hand it to the sink, release it. A block is never
/// released before its image has been read and delivered.
async fn transfer_block(
    transport: &dyn DeviceTransport,
    session_id: &str,
    number: u64,
    options: &ScanOptions,
    sink: &dyn ImageSink,
) -> Result<scanbridge_core::SessionSnapshot, ApiError> {
    let separate_metadata = !options.metadata_with_image || options.thumbnails;
    let (metadata, thumbnail) = if separate_metadata {
        let transfer = transport
            .read_image_block_metadata(session_id, number, options.thumbnails)
            .await?;
        (Some(transfer.metadata), transfer.thumbnail)
    } else {
        (None, None)
    };

    let transfer = transport
        .read_image_block(session_id, number, !separate_metadata)
        .await?;
    let metadata = transfer
        .metadata
        .or(metadata)
        .ok_or_else(|| ApiError::security(format!("no metadata for image block {}", number)))?;

    sink.deliver(TransferredBlock {
        number,
        image: transfer.image,
        metadata,
        thumbnail,
    })
    .map_err(|e| ApiError::undefined(format!("failed to deliver image block {}: {:#}", number, e)))?;

    let snapshot = transport
        .release_image_blocks(session_id, number, number)
        .await?;
    debug!(block = number, "Image block transferred and released");
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalScanner, LocalScannerConfig};
    use crate::sink::MemorySink;
    use crate::transport::{ImageTransfer, MetadataTransfer};
    use async_trait::async_trait;
    use scanbridge_core::metadata::MetadataStatus;
    use scanbridge_core::{
        ApiStatus, Detected, Facility, ImageAddress, ImageBlockMetadata, ImageInfo, ImageSource,
        MoreParts, Session, SessionSnapshot,
    };
    use scanbridge_negotiate::DeviceProfile;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Scripted device: every block exists as soon as capture starts
    struct MockDevice {
        session: Mutex<Option<Session>>,
        blocks: u64,
        /// Capture is already finished when it starts
        drained_on_start: bool,
        /// Capture finishes on the first wait
        drain_on_wait: bool,
        fail_read: Option<u64>,
        calls: Mutex<Vec<String>>,
    }

    impl MockDevice {
        fn new(blocks: u64) -> Self {
            Self {
                session: Mutex::new(None),
                blocks,
                drained_on_start: true,
                drain_on_wait: false,
                fail_read: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn with_session<T>(
            &self,
            f: impl FnOnce(&mut Session) -> Result<T, ApiError>,
        ) -> Result<T, ApiError> {
            let mut guard = self.session.lock().unwrap();
            let session = guard
                .as_mut()
                .ok_or_else(|| ApiError::protocol(ApiStatus::InvalidSessionId, "no session"))?;
            f(session)
        }

        fn metadata(number: u64) -> ImageBlockMetadata {
            ImageBlockMetadata {
                status: MetadataStatus { success: true },
                address: ImageAddress {
                    image_number: number,
                    image_part: 1,
                    more_parts: MoreParts::LastPartInFile,
                    sheet_number: number,
                    source: ImageSource::Flatbed,
                    stream_name: "stream0".to_string(),
                    source_name: "source0".to_string(),
                    pixel_format_name: "pixelFormat0".to_string(),
                },
                image: ImageInfo {
                    compression: "none".to_string(),
                    pixel_format: "bw1".to_string(),
                    pixel_height: 2200,
                    pixel_width: 1700,
                    pixel_offset_x: 0,
                    pixel_offset_y: 0,
                    resolution: 200,
                    size: 4,
                },
            }
        }
    }

    #[async_trait]
    impl DeviceTransport for MockDevice {
        async fn create_session(&self) -> Result<SessionSnapshot, ApiError> {
            self.log("create".to_string());
            let session = Session::open();
            let snapshot = session.snapshot();
            *self.session.lock().unwrap() = Some(session);
            Ok(snapshot)
        }

        async fn get_session(&self, _id: &str) -> Result<SessionSnapshot, ApiError> {
            self.with_session(|s| Ok(s.snapshot()))
        }

        async fn wait_for_events(&self, _id: &str, _rev: u64) -> Result<SessionSnapshot, ApiError> {
            self.log("wait".to_string());
            tokio::time::sleep(Duration::from_millis(5)).await;
            let drain = self.drain_on_wait;
            self.with_session(|s| {
                if drain {
                    s.finish_capture(Detected::Nominal);
                }
                Ok(s.snapshot())
            })
        }

        async fn send_task(&self, _id: &str, _task: &JsonValue) -> Result<SessionSnapshot, ApiError> {
            self.with_session(|s| {
                s.set_task(TaskReply::default())?;
                Ok(s.snapshot())
            })
        }

        async fn start_capturing(&self, _id: &str) -> Result<SessionSnapshot, ApiError> {
            self.log("start".to_string());
            let drained = self.drained_on_start;
            let blocks = self.blocks;
            self.with_session(|s| {
                s.start_capturing()?;
                for _ in 0..blocks {
                    s.push_image_block()?;
                }
                if drained {
                    s.finish_capture(Detected::Nominal);
                }
                Ok(s.snapshot())
            })
        }

        async fn stop_capturing(&self, _id: &str) -> Result<SessionSnapshot, ApiError> {
            self.log("stop".to_string());
            self.with_session(|s| {
                s.stop_capturing()?;
                s.finish_capture(Detected::Nominal);
                Ok(s.snapshot())
            })
        }

        async fn read_image_block_metadata(
            &self,
            _id: &str,
            number: u64,
            _thumb: bool,
        ) -> Result<MetadataTransfer, ApiError> {
            self.log(format!("meta {}", number));
            self.with_session(|s| {
                s.ensure_pending(number)?;
                Ok(MetadataTransfer {
                    session: s.snapshot(),
                    metadata: Self::metadata(number),
                    thumbnail: None,
                })
            })
        }

        async fn read_image_block(
            &self,
            _id: &str,
            number: u64,
            with_metadata: bool,
        ) -> Result<ImageTransfer, ApiError> {
            self.log(format!("read {}", number));
            if self.fail_read == Some(number) {
                return Err(ApiError::protocol(ApiStatus::Busy, "device busy")
                    .with_response("{\"results\":{\"success\":false}}"));
            }
            self.with_session(|s| {
                s.mark_read(number)?;
                Ok(ImageTransfer {
                    session: s.snapshot(),
                    image: b"%PDF".to_vec(),
                    metadata: with_metadata.then(|| Self::metadata(number)),
                })
            })
        }

        async fn release_image_blocks(
            &self,
            _id: &str,
            first: u64,
            last: u64,
        ) -> Result<SessionSnapshot, ApiError> {
            self.log(format!("release {}-{}", first, last));
            self.with_session(|s| {
                s.release(first, last)?;
                Ok(s.snapshot())
            })
        }

        async fn close_session(&self, _id: &str) -> Result<SessionSnapshot, ApiError> {
            self.log("close".to_string());
            self.with_session(|s| {
                s.close();
                Ok(s.snapshot())
            })
        }
    }

    /// Requests abort once a given block has been delivered
    struct AbortAfter {
        inner: MemorySink,
        after: u64,
        control: ScanControl,
    }

    impl ImageSink for AbortAfter {
        fn deliver(&self, block: TransferredBlock) -> anyhow::Result<()> {
            let number = block.number;
            self.inner.deliver(block)?;
            if number == self.after {
                self.control.request_abort();
            }
            Ok(())
        }
    }

    fn serial() -> ScanRunner {
        ScanRunner::new(ScanOptions {
            poll_interval: Duration::from_millis(10),
            ..ScanOptions::default()
        })
    }

    #[tokio::test]
    async fn test_serial_reads_and_releases_in_order() {
        let device = Arc::new(MockDevice::new(3));
        let sink = Arc::new(MemorySink::new());

        let report = serial()
            .scan(device.clone(), &json!({}), sink.clone(), &ScanControl::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert!(report.drained);
        assert_eq!(report.transferred, vec![1, 2, 3]);
        assert_eq!(sink.numbers(), vec![1, 2, 3]);
        assert_eq!(report.final_state, SessionState::Closed);
        assert!(report.stopped);
        assert_eq!(
            device.calls(),
            vec![
                "create", "start", "stop", "read 1", "release 1-1", "read 2", "release 2-2",
                "read 3", "release 3-3", "close"
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_follows_late_drain() {
        let mut device = MockDevice::new(2);
        device.drained_on_start = false;
        device.drain_on_wait = true;
        let device = Arc::new(device);

        let report = serial()
            .scan(device.clone(), &json!({}), Arc::new(MemorySink::new()), &ScanControl::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert!(report.drained);
        assert_eq!(report.transferred, vec![1, 2]);

        // Everything is released before the drain shows up; the stop still
        // goes out once, after the drain and before the close
        let calls = device.calls();
        assert_eq!(calls.iter().filter(|c| *c == "stop").count(), 1);
        let release = calls.iter().position(|c| c == "release 2-2").unwrap();
        let stop = calls.iter().position(|c| c == "stop").unwrap();
        let close = calls.iter().position(|c| c == "close").unwrap();
        assert!(release < stop && stop < close);
    }

    #[tokio::test]
    async fn test_zero_poll_interval_is_raised() {
        let options = ScanOptions::new(ScanStrategy::Serial).with_poll_interval(Duration::ZERO);
        assert_eq!(options.poll_interval, MIN_POLL_INTERVAL);

        // Set directly, the field is still clamped where the loop uses it
        let mut device = MockDevice::new(1);
        device.drained_on_start = false;
        device.drain_on_wait = true;
        let device = Arc::new(device);
        let runner = ScanRunner::new(ScanOptions {
            poll_interval: Duration::ZERO,
            ..ScanOptions::default()
        });

        let report = runner
            .scan(device, &json!({}), Arc::new(MemorySink::new()), &ScanControl::new())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.transferred, vec![1]);
    }

    #[tokio::test]
    async fn test_separate_metadata_is_read_first() {
        let device = Arc::new(MockDevice::new(1));
        let runner = ScanRunner::new(ScanOptions {
            metadata_with_image: false,
            ..ScanOptions::default()
        });

        runner
            .scan(device.clone(), &json!({}), Arc::new(MemorySink::new()), &ScanControl::new())
            .await
            .unwrap();

        let calls = device.calls();
        let meta = calls.iter().position(|c| c == "meta 1").unwrap();
        let read = calls.iter().position(|c| c == "read 1").unwrap();
        let release = calls.iter().position(|c| c == "release 1-1").unwrap();
        assert!(meta < read && read < release);
    }

    #[tokio::test]
    async fn test_abort_releases_pending_before_close() {
        let device = Arc::new(MockDevice::new(5));
        let control = ScanControl::new();
        let sink = Arc::new(AbortAfter {
            inner: MemorySink::new(),
            after: 3,
            control: control.clone(),
        });

        let report = serial()
            .scan(device.clone(), &json!({}), sink.clone(), &control)
            .await
            .unwrap();

        assert!(report.aborted);
        assert_eq!(report.transferred, vec![1, 2, 3]);
        assert_eq!(report.released, vec![1, 2, 3, 4, 5]);
        assert_eq!(sink.inner.numbers(), vec![1, 2, 3]);

        let calls = device.calls();
        let release = calls.iter().position(|c| c == "release 4-5").unwrap();
        let close = calls.iter().position(|c| c == "close").unwrap();
        assert!(release < close);
        assert!(!calls.contains(&"read 4".to_string()));
    }

    #[tokio::test]
    async fn test_first_error_is_kept() {
        let mut device = MockDevice::new(4);
        device.fail_read = Some(2);
        let device = Arc::new(device);

        let report = serial()
            .scan(device.clone(), &json!({}), Arc::new(MemorySink::new()), &ScanControl::new())
            .await
            .unwrap();

        let err = report.first_error.expect("first error recorded");
        assert_eq!(err.facility, Facility::Protocol);
        assert_eq!(err.status, ApiStatus::Busy);
        assert!(err.response.is_some());

        // Block 1 went through; the rest were released without a transfer
        assert_eq!(report.transferred, vec![1]);
        assert_eq!(report.released, vec![1, 2, 3, 4]);
        assert!(device.calls().contains(&"release 2-4".to_string()));
        assert_eq!(report.final_state, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_stop_is_sent_once() {
        let mut device = MockDevice::new(3);
        device.drained_on_start = false;
        let device = Arc::new(device);
        let control = ScanControl::new();
        control.request_stop();

        let report = serial()
            .scan(device.clone(), &json!({}), Arc::new(MemorySink::new()), &control)
            .await
            .unwrap();

        assert!(report.stopped);
        assert!(!report.aborted);
        // A stop still collects what was already scanned
        assert_eq!(report.transferred, vec![1, 2, 3]);
        assert_eq!(device.calls().iter().filter(|c| *c == "stop").count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_transfers_every_block() {
        let device = Arc::new(MockDevice::new(6));
        let runner = ScanRunner::new(ScanOptions {
            strategy: ScanStrategy::Concurrent { workers: 3 },
            ..ScanOptions::default()
        });

        let report = runner
            .scan(device.clone(), &json!({}), Arc::new(MemorySink::new()), &ScanControl::new())
            .await
            .unwrap();

        let mut transferred = report.transferred.clone();
        transferred.sort_unstable();
        assert_eq!(transferred, vec![1, 2, 3, 4, 5, 6]);
        assert!(report.drained);
        assert_eq!(report.final_state, SessionState::Closed);

        // No block is released before it was read
        let calls = device.calls();
        for n in 1..=6 {
            let read = calls.iter().position(|c| *c == format!("read {}", n)).unwrap();
            let release = calls
                .iter()
                .position(|c| *c == format!("release {}-{}", n, n))
                .unwrap();
            assert!(read < release);
        }
        assert_eq!(calls.iter().filter(|c| *c == "stop").count(), 1);
        assert_eq!(calls.last().map(String::as_str), Some("close"));
    }

    async fn scan_local(strategy: ScanStrategy) -> (ScanReport, Vec<u64>) {
        let temp_dir = TempDir::new().unwrap();
        let scanner = LocalScanner::new(LocalScannerConfig {
            store_dir: temp_dir.path().join("device"),
            sheets: 3,
            block_delay: Duration::from_millis(5),
            long_poll: Duration::from_secs(2),
            profile: DeviceProfile::default(),
            ..LocalScannerConfig::default()
        })
        .unwrap();
        let sink = Arc::new(MemorySink::new());
        let runner = ScanRunner::new(ScanOptions {
            strategy,
            poll_interval: Duration::from_millis(10),
            ..ScanOptions::default()
        });

        let task = json!({"actions":[{"action":"configure","streams":[{"sources":[{
            "source":"flatbed","pixelFormats":[{"pixelFormat":"bw1","attributes":[
                {"attribute":"resolution","values":[{"value":300}]}
            ]}]}]}]}]});
        let report = runner
            .scan(Arc::new(scanner), &task, sink.clone(), &ScanControl::new())
            .await
            .unwrap();

        for block in sink.blocks() {
            assert_eq!(block.metadata.address.source, ImageSource::Flatbed);
            assert_eq!(block.metadata.image.resolution, 300);
        }
        (report, sink.numbers())
    }

    #[tokio::test]
    async fn test_local_scanner_serial() {
        let (report, numbers) = scan_local(ScanStrategy::Serial).await;

        assert!(report.is_success());
        assert!(report.drained);
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(report.final_state, SessionState::Closed);
        let task = report.task.unwrap();
        assert_eq!(task.actions[0].streams[0].sources[0].source, "flatbed");
    }

    #[tokio::test]
    async fn test_local_scanner_concurrent() {
        let (report, mut numbers) = scan_local(ScanStrategy::Concurrent { workers: 2 }).await;

        assert!(report.is_success());
        numbers.sort_unstable();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_rejected_task_skips_capture() {
        let temp_dir = TempDir::new().unwrap();
        let scanner = LocalScanner::new(LocalScannerConfig {
            store_dir: temp_dir.path().to_path_buf(),
            ..LocalScannerConfig::default()
        })
        .unwrap();

        let report = serial()
            .scan(
                Arc::new(scanner),
                &json!({"actions":[{"action":"calibrate","exception":"fail"}]}),
                Arc::new(MemorySink::new()),
                &ScanControl::new(),
            )
            .await
            .unwrap();

        let err = report.first_error.unwrap();
        assert_eq!(err.facility, Facility::Language);
        assert_eq!(err.json_key.as_deref(), Some("actions[0].action"));
        assert!(!report.task.unwrap().is_success());
        assert!(report.transferred.is_empty());
        assert_eq!(report.final_state, SessionState::Closed);
    }
}
