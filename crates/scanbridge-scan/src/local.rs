//! In-process scanner (device role)
//!
//! Owns the authoritative [`Session`], negotiates tasks against a
//! [`SimulatedDevice`] and runs a producer task that writes image blocks into
//! an [`ImageBlockStore`]. Every change is published on a `watch` channel so
//! long polls wake as soon as something moves. A session that receives no
//! command within the session timeout is closed; long polls do not count as
//! activity.

use async_trait::async_trait;
use scanbridge_core::metadata::MetadataStatus;
use scanbridge_core::reply::ActionReply;
use scanbridge_core::{
    ApiError, Detected, ImageAddress, ImageBlockMetadata, ImageBlockStore, ImageInfo,
    ImageSource, MoreParts, Session, SessionError, SessionSnapshot, SessionState, StoreError,
    VendorIdentity,
};
use scanbridge_negotiate::mapping::{compression_name, pixel_format_name};
use scanbridge_negotiate::{
    Capability, CapabilityDevice, DeviceProfile, Negotiated, NegotiationEngine, Selection,
    SimulatedDevice,
};
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::ScannerInfo;
use crate::transport::{DeviceTransport, ImageTransfer, MetadataTransfer};

/// Shortest idle time before a session is closed
pub const MIN_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings of the simulated scanner
#[derive(Debug, Clone)]
pub struct LocalScannerConfig {
    pub name: String,
    /// Vendor GUID whose task extensions this scanner honors
    pub vendor: Uuid,
    pub store_dir: PathBuf,
    /// Sheets in the feeder (or placed on the glass) per capture
    pub sheets: u32,
    /// Time to produce one image block
    pub block_delay: Duration,
    /// Report a paper jam after this many sheets
    pub jam_after: Option<u32>,
    /// Longest a `waitForEvents` call is held open
    pub long_poll: Duration,
    /// Idle time after which the session is closed, at least
    /// [`MIN_SESSION_TIMEOUT`]
    pub session_timeout: Duration,
    pub thumbnails: bool,
    pub profile: DeviceProfile,
}

impl Default for LocalScannerConfig {
    fn default() -> Self {
        Self {
            name: "scanbridge".to_string(),
            vendor: Uuid::nil(),
            store_dir: std::env::temp_dir().join("scanbridge-blocks"),
            sheets: 3,
            block_delay: Duration::from_millis(50),
            jam_after: None,
            long_poll: Duration::from_secs(30),
            session_timeout: Duration::from_secs(300),
            thumbnails: false,
            profile: DeviceProfile::default(),
        }
    }
}

struct Inner {
    session: Option<Session>,
    device: SimulatedDevice,
    negotiated: Option<Negotiated>,
    producer: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    /// When the open session expires unless a command arrives
    deadline: Instant,
}

impl Inner {
    fn stop_tasks(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    updates: watch::Sender<SessionSnapshot>,
    store: ImageBlockStore,
    engine: NegotiationEngine,
    config: LocalScannerConfig,
}

impl Shared {
    /// Publish the current session and return its snapshot
    fn publish(&self, session: &Session) -> SessionSnapshot {
        let snapshot = session.snapshot();
        self.updates.send_replace(snapshot.clone());
        snapshot
    }

    /// Lock the scanner state and push the idle deadline out
    async fn command(&self) -> tokio::sync::MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().await;
        inner.deadline = Instant::now() + self.config.session_timeout;
        inner
    }

    fn remove_blocks(&self, numbers: &[u64]) {
        for &number in numbers {
            if let Err(e) = self.store.remove_block(number) {
                warn!(block = number, error = %e, "Failed to remove image block");
            }
        }
    }
}

/// The open session, if `id` names it
fn live<'a>(session: &'a mut Option<Session>, id: &str) -> Result<&'a mut Session, ApiError> {
    let session = session
        .as_mut()
        .ok_or_else(|| SessionError::InvalidSessionId(id.to_string()))?;
    session.check_id(id)?;
    Ok(session)
}

/// What the producer needs to know about the negotiated configuration
#[derive(Debug, Clone)]
struct CapturePlan {
    flatbed: bool,
    duplex: bool,
    stream_name: String,
    source_name: String,
    pixel_format_name: String,
    pixel_format: String,
    compression: String,
    resolution: u32,
}

impl CapturePlan {
    fn new(negotiated: &Negotiated, device: &SimulatedDevice) -> Self {
        let selection = &negotiated.selection;
        let stream_name = if selection.stream_name.is_empty() {
            "stream0".to_string()
        } else {
            selection.stream_name.clone()
        };
        Self {
            flatbed: negotiated.flatbed,
            duplex: negotiated.duplex,
            stream_name,
            source_name: selection.source_name().to_string(),
            pixel_format_name: selection.pixel_format_name().to_string(),
            pixel_format: device
                .get(Capability::PixelType)
                .and_then(pixel_format_name)
                .unwrap_or("rgb24")
                .to_string(),
            compression: device
                .get(Capability::Compression)
                .and_then(compression_name)
                .unwrap_or("none")
                .to_string(),
            resolution: device
                .get(Capability::XResolution)
                .and_then(|r| u32::try_from(r).ok())
                .unwrap_or(200),
        }
    }

    fn metadata(&self, image_number: u64, sheet_number: u64, size: u64) -> ImageBlockMetadata {
        // US letter
        let width = self.resolution * 17 / 2;
        let height = self.resolution * 11;
        ImageBlockMetadata {
            status: MetadataStatus { success: true },
            address: ImageAddress {
                image_number,
                image_part: 1,
                more_parts: MoreParts::LastPartInFile,
                sheet_number,
                source: ImageSource::label(self.flatbed, self.duplex, image_number),
                stream_name: self.stream_name.clone(),
                source_name: self.source_name.clone(),
                pixel_format_name: self.pixel_format_name.clone(),
            },
            image: ImageInfo {
                compression: self.compression.clone(),
                pixel_format: self.pixel_format.clone(),
                pixel_height: height,
                pixel_width: width,
                pixel_offset_x: 0,
                pixel_offset_y: 0,
                resolution: self.resolution,
                size,
            },
        }
    }
}

/// Stand-in image bytes; a PDF header followed by a pattern
fn fake_image(number: u64, pixel_format: &str) -> Vec<u8> {
    let mut image = format!("%PDF-1.7\n% {} image block {}\n", pixel_format, number).into_bytes();
    image.extend(std::iter::repeat((number % 251) as u8).take(1024));
    image.extend_from_slice(b"\n%%EOF\n");
    image
}

fn fake_thumbnail(number: u64) -> Vec<u8> {
    format!("%PDF-1.7\n% thumbnail {}\n%%EOF\n", number).into_bytes()
}

/// Simulated scanner reachable in-process
#[derive(Clone)]
pub struct LocalScanner {
    shared: Arc<Shared>,
}

impl LocalScanner {
    /// Create the scanner and clear any blocks a previous run left behind
    pub fn new(mut config: LocalScannerConfig) -> Result<Self, StoreError> {
        config.session_timeout = config.session_timeout.max(MIN_SESSION_TIMEOUT);
        let store = ImageBlockStore::open(&config.store_dir)?;
        store.clear()?;

        let (updates, _) = watch::channel(SessionSnapshot::no_session());
        let inner = Inner {
            session: None,
            device: SimulatedDevice::new(config.profile.clone()),
            negotiated: None,
            producer: None,
            watchdog: None,
            deadline: Instant::now(),
        };

        info!(
            name = %config.name,
            store = %config.store_dir.display(),
            session_timeout = ?config.session_timeout,
            "Local scanner ready"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(inner),
                updates,
                store,
                engine: NegotiationEngine::new(VendorIdentity::new(config.vendor)),
                config,
            }),
        })
    }

    pub fn config(&self) -> &LocalScannerConfig {
        &self.shared.config
    }

    pub fn info(&self) -> ScannerInfo {
        let config = &self.shared.config;
        ScannerInfo {
            long_poll_ms: u64::try_from(config.long_poll.as_millis()).ok(),
            ..ScannerInfo::new(config.name.clone(), config.vendor)
        }
    }

    /// Subscribe to session snapshots
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.updates.subscribe()
    }

    /// Simulate paper being added to or taken out of the feeder
    pub async fn set_feeder_loaded(&self, loaded: bool) {
        self.shared.inner.lock().await.device.set_feeder_loaded(loaded);
    }

    /// Abort whatever capture is running, e.g. on shutdown
    pub async fn shutdown(&self) {
        let mut guard = self.shared.inner.lock().await;
        let inner = &mut *guard;
        if let Some(session) = inner.session.as_mut() {
            session.request_abort();
            self.shared.publish(session);
        }
        inner.stop_tasks();
    }

    /// Snapshot of the session `id` names, without counting as activity
    async fn current(&self, session_id: &str) -> Result<SessionSnapshot, ApiError> {
        let mut guard = self.shared.inner.lock().await;
        Ok(live(&mut guard.session, session_id)?.snapshot())
    }
}

/// Close the session once no command has arrived before its deadline
async fn watch_idle(shared: Arc<Shared>, session_id: Uuid) {
    loop {
        let deadline = shared.inner.lock().await.deadline;
        tokio::time::sleep_until(deadline).await;

        let mut guard = shared.inner.lock().await;
        let inner = &mut *guard;
        if inner.deadline > Instant::now() {
            continue;
        }
        let Some(session) = inner
            .session
            .as_mut()
            .filter(|s| s.id() == session_id && s.state() != SessionState::Closed)
        else {
            return;
        };

        let discarded = session.expire();
        shared.remove_blocks(&discarded);
        shared.publish(session);
        if let Some(producer) = inner.producer.take() {
            producer.abort();
        }
        inner.watchdog = None;
        return;
    }
}

/// Image, thumbnail and metadata of one block, ready to be stored
struct PendingBlock {
    number: u64,
    image: Vec<u8>,
    thumbnail: Option<Vec<u8>>,
    metadata: ImageBlockMetadata,
}

/// Produce image blocks until the sheets run out, a stop or abort arrives, or
/// the simulated device jams. Files are written without holding the scanner
/// lock; the lock is only taken to publish finished blocks.
async fn produce(shared: Arc<Shared>, session_id: Uuid, plan: CapturePlan) {
    let config = &shared.config;
    let sides: u64 = if plan.duplex { 2 } else { 1 };
    let mut sheet: u32 = 0;

    loop {
        tokio::time::sleep(config.block_delay).await;

        let first = {
            let mut guard = shared.inner.lock().await;
            let Some(session) = guard.session.as_mut().filter(|s| s.id() == session_id) else {
                debug!(session = %session_id, "Session gone, producer exiting");
                return;
            };

            let detected = if session.should_stop_producing() || sheet >= config.sheets {
                Some(Detected::Nominal)
            } else if config.jam_after == Some(sheet) {
                Some(Detected::PaperJam)
            } else {
                None
            };

            if let Some(detected) = detected {
                if session.state().is_transferring() {
                    session.finish_capture(detected);
                    shared.publish(session);
                    drop(guard);
                    let store = shared.store.clone();
                    match tokio::task::spawn_blocking(move || store.mark_drained()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(error = %e, "Failed to write drained marker"),
                        Err(e) => warn!(error = %e, "Drained marker writer failed"),
                    }
                }
                info!(session = %session_id, sheets = sheet, detected = ?detected, "Capture finished");
                return;
            }
            session.next_block_number()
        };

        sheet += 1;
        let blocks: Vec<PendingBlock> = (first..first + sides)
            .map(|number| {
                let image = fake_image(number, &plan.pixel_format);
                let metadata = plan.metadata(number, u64::from(sheet), image.len() as u64);
                PendingBlock {
                    number,
                    thumbnail: config.thumbnails.then(|| fake_thumbnail(number)),
                    image,
                    metadata,
                }
            })
            .collect();
        let numbers: Vec<u64> = blocks.iter().map(|b| b.number).collect();

        let store = shared.store.clone();
        let written = tokio::task::spawn_blocking(move || {
            for block in &blocks {
                store.write_block(
                    block.number,
                    &block.image,
                    block.thumbnail.as_deref(),
                    &block.metadata,
                )?;
            }
            Ok::<(), StoreError>(())
        })
        .await;

        let mut guard = shared.inner.lock().await;
        let Some(session) = guard.session.as_mut().filter(|s| s.id() == session_id) else {
            shared.remove_blocks(&numbers);
            return;
        };

        let failure = match written {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(e) = failure {
            error!(blocks = ?numbers, error = %e, "Failed to store image blocks");
            shared.remove_blocks(&numbers);
            session.finish_capture(Detected::Nominal);
            shared.publish(session);
            return;
        }

        for (i, &number) in numbers.iter().enumerate() {
            if let Err(e) = session.push_image_block() {
                warn!(block = number, error = %e, "Image block produced after capture ended");
                shared.remove_blocks(&numbers[i..]);
                break;
            }
        }
        shared.publish(session);
    }
}

#[async_trait]
impl DeviceTransport for LocalScanner {
    async fn create_session(&self) -> Result<SessionSnapshot, ApiError> {
        let mut guard = self.shared.command().await;
        let inner = &mut *guard;

        if let Some(existing) = &inner.session {
            if existing.state() != SessionState::Closed {
                return Err(SessionError::NewSessionNotAllowed.into());
            }
        }

        self.shared.store.clear()?;
        inner.device.reset_all();
        inner.negotiated = None;
        inner.stop_tasks();
        let session = inner.session.insert(Session::open());
        inner.watchdog = Some(tokio::spawn(watch_idle(
            Arc::clone(&self.shared),
            session.id(),
        )));
        Ok(self.shared.publish(session))
    }

    async fn get_session(&self, session_id: &str) -> Result<SessionSnapshot, ApiError> {
        let mut guard = self.shared.command().await;
        Ok(live(&mut guard.session, session_id)?.snapshot())
    }

    async fn wait_for_events(
        &self,
        session_id: &str,
        revision: u64,
    ) -> Result<SessionSnapshot, ApiError> {
        let mut updates = self.shared.updates.subscribe();
        let current = self.current(session_id).await?;
        if current.revision > revision {
            return Ok(current);
        }

        let moved = tokio::time::timeout(self.shared.config.long_poll, async {
            loop {
                {
                    let snapshot = updates.borrow_and_update();
                    if snapshot.session_id != session_id || snapshot.revision > revision {
                        return true;
                    }
                }
                if updates.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false);

        if !moved {
            debug!(session = %session_id, revision = revision, "Long poll timed out");
        }
        self.current(session_id).await
    }

    async fn send_task(
        &self,
        session_id: &str,
        task: &JsonValue,
    ) -> Result<SessionSnapshot, ApiError> {
        let mut guard = self.shared.command().await;
        let inner = &mut *guard;
        let session = live(&mut inner.session, session_id)?;
        if session.state() != SessionState::Ready {
            return Err(SessionError::NotReady(session.state()).into());
        }

        inner.device.reset_all();
        match self.shared.engine.process(&mut inner.device, task) {
            Ok(outcome) => {
                session.set_task(outcome.reply)?;
                inner.negotiated = outcome.configured;
                Ok(self.shared.publish(session))
            }
            Err(failure) => {
                warn!(session = %session_id, error = %failure, "Task rejected");
                session.set_task(failure.reply())?;
                inner.negotiated = None;
                self.shared.publish(session);
                Err(failure.error.into())
            }
        }
    }

    async fn start_capturing(&self, session_id: &str) -> Result<SessionSnapshot, ApiError> {
        let mut guard = self.shared.command().await;
        let inner = &mut *guard;
        let session = live(&mut inner.session, session_id)?;
        session.start_capturing()?;

        if let Err(e) = self.shared.store.clear() {
            warn!(error = %e, "Failed to clear block store");
        }

        let negotiated = inner.negotiated.clone().unwrap_or_else(|| {
            Negotiated::from_device(ActionReply::new("configure"), Selection::default(), &inner.device)
        });
        let plan = CapturePlan::new(&negotiated, &inner.device);
        debug!(plan = ?plan, "Starting producer");

        if let Some(previous) = inner.producer.take() {
            previous.abort();
        }
        inner.producer = Some(tokio::spawn(produce(
            Arc::clone(&self.shared),
            session.id(),
            plan,
        )));

        Ok(self.shared.publish(session))
    }

    async fn stop_capturing(&self, session_id: &str) -> Result<SessionSnapshot, ApiError> {
        let mut guard = self.shared.command().await;
        let session = live(&mut guard.session, session_id)?;
        session.stop_capturing()?;
        Ok(self.shared.publish(session))
    }

    async fn read_image_block_metadata(
        &self,
        session_id: &str,
        number: u64,
        with_thumbnail: bool,
    ) -> Result<MetadataTransfer, ApiError> {
        let mut guard = self.shared.command().await;
        let session = live(&mut guard.session, session_id)?;
        session.ensure_pending(number)?;

        let metadata = self.shared.store.read_metadata(number)?;
        let thumbnail = if with_thumbnail {
            self.shared.store.read_thumbnail(number)?
        } else {
            None
        };
        Ok(MetadataTransfer {
            session: session.snapshot(),
            metadata,
            thumbnail,
        })
    }

    async fn read_image_block(
        &self,
        session_id: &str,
        number: u64,
        with_metadata: bool,
    ) -> Result<ImageTransfer, ApiError> {
        let mut guard = self.shared.command().await;
        let session = live(&mut guard.session, session_id)?;
        session.ensure_pending(number)?;

        let image = self.shared.store.read_image(number)?;
        let metadata = if with_metadata {
            Some(self.shared.store.read_metadata(number)?)
        } else {
            None
        };
        session.mark_read(number)?;
        debug!(session = %session_id, block = number, bytes = image.len(), "Image block read");

        Ok(ImageTransfer {
            session: session.snapshot(),
            image,
            metadata,
        })
    }

    async fn release_image_blocks(
        &self,
        session_id: &str,
        first: u64,
        last: u64,
    ) -> Result<SessionSnapshot, ApiError> {
        let mut guard = self.shared.command().await;
        let session = live(&mut guard.session, session_id)?;
        let released = session.release(first, last)?;
        self.shared.remove_blocks(&released);
        debug!(session = %session_id, released = ?released, "Released image blocks");
        Ok(self.shared.publish(session))
    }

    async fn close_session(&self, session_id: &str) -> Result<SessionSnapshot, ApiError> {
        let mut guard = self.shared.command().await;
        let inner = &mut *guard;
        let session = live(&mut inner.session, session_id)?;

        let discarded = session.close();
        self.shared.remove_blocks(&discarded);
        let snapshot = self.shared.publish(session);
        inner.stop_tasks();
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanbridge_core::{ApiStatus, Facility};
    use serde_json::json;
    use tempfile::TempDir;

    fn scanner(temp_dir: &TempDir, sheets: u32) -> LocalScanner {
        LocalScanner::new(LocalScannerConfig {
            store_dir: temp_dir.path().join("blocks"),
            sheets,
            block_delay: Duration::from_millis(5),
            long_poll: Duration::from_secs(5),
            ..LocalScannerConfig::default()
        })
        .unwrap()
    }

    async fn wait_until_drained(scanner: &LocalScanner, id: &str) -> SessionSnapshot {
        let mut snapshot = scanner.get_session(id).await.unwrap();
        while !snapshot.image_blocks_drained {
            snapshot = scanner.wait_for_events(id, snapshot.revision).await.unwrap();
        }
        snapshot
    }

    #[tokio::test]
    async fn test_single_session() {
        let temp_dir = TempDir::new().unwrap();
        let scanner = scanner(&temp_dir, 1);

        let session = scanner.create_session().await.unwrap();
        assert_eq!(session.state, SessionState::Ready);

        let err = scanner.create_session().await.unwrap_err();
        assert_eq!(err.status, ApiStatus::NewSessionNotAllowed);

        let err = scanner.get_session(&Uuid::new_v4().to_string()).await.unwrap_err();
        assert_eq!(err.status, ApiStatus::InvalidSessionId);

        scanner.close_session(&session.session_id).await.unwrap();
        let err = scanner.get_session(&session.session_id).await.unwrap_err();
        assert_eq!(err.status, ApiStatus::ClosedSession);

        // A closed session makes room for a new one
        assert!(scanner.create_session().await.is_ok());
    }

    #[tokio::test]
    async fn test_task_failure_is_recorded() {
        let temp_dir = TempDir::new().unwrap();
        let scanner = scanner(&temp_dir, 1);
        let id = scanner.create_session().await.unwrap().session_id;

        let err = scanner
            .send_task(
                &id,
                &json!({"actions":[{"action":"configure","streams":[{"sources":[{
                    "source":"flatbed","pixelFormats":[{"pixelFormat":"bw1","attributes":[
                        {"attribute":"resolution","values":[{"value":42,"exception":"fail"}]}
                    ]}]}]}]}]}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.facility, Facility::Language);
        assert_eq!(
            err.json_key.as_deref(),
            Some("actions[0].streams[0].sources[0].pixelFormats[0].attributes[0].values[0]")
        );
        assert_eq!(err.value.as_deref(), Some("42"));

        let task = scanner.get_session(&id).await.unwrap().task.unwrap();
        assert!(!task.is_success());
        let results = task.actions[0].results.as_ref().unwrap();
        assert_eq!(results.value.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_capture_read_release() {
        let temp_dir = TempDir::new().unwrap();
        let scanner = scanner(&temp_dir, 2);
        let id = scanner.create_session().await.unwrap().session_id;

        scanner
            .send_task(
                &id,
                &json!({"actions":[{"action":"configure","streams":[{"sources":[{
                    "source":"feeder","pixelFormats":[{"pixelFormat":"gray8"}]}]}]}]}),
            )
            .await
            .unwrap();
        scanner.start_capturing(&id).await.unwrap();

        let snapshot = wait_until_drained(&scanner, &id).await;
        // Duplex feeder: two sides per sheet
        assert_eq!(snapshot.image_blocks, vec![1, 2, 3, 4]);
        assert_eq!(snapshot.state, SessionState::Draining);

        let meta = scanner.read_image_block_metadata(&id, 2, false).await.unwrap();
        assert_eq!(meta.metadata.address.source, ImageSource::FeederRear);
        assert_eq!(meta.metadata.address.sheet_number, 1);
        assert_eq!(meta.metadata.image.pixel_format, "gray8");

        let image = scanner.read_image_block(&id, 1, true).await.unwrap();
        assert!(image.image.starts_with(b"%PDF-"));
        assert_eq!(image.metadata.unwrap().image.size, image.image.len() as u64);

        let snapshot = scanner.release_image_blocks(&id, 1, 4).await.unwrap();
        assert!(snapshot.image_blocks.is_empty());
        assert_eq!(snapshot.state, SessionState::Draining);
        assert!(!temp_dir.path().join("blocks/img000001.pdf").exists());

        let snapshot = scanner.stop_capturing(&id).await.unwrap();
        assert_eq!(snapshot.state, SessionState::Ready);

        let err = scanner.read_image_block(&id, 1, false).await.unwrap_err();
        assert_eq!(err.status, ApiStatus::NotCapturing);
    }

    #[tokio::test]
    async fn test_paper_jam_ends_capture() {
        let temp_dir = TempDir::new().unwrap();
        let scanner = LocalScanner::new(LocalScannerConfig {
            store_dir: temp_dir.path().to_path_buf(),
            sheets: 5,
            jam_after: Some(1),
            block_delay: Duration::from_millis(5),
            profile: DeviceProfile {
                duplex: false,
                ..DeviceProfile::default()
            },
            ..LocalScannerConfig::default()
        })
        .unwrap();
        let id = scanner.create_session().await.unwrap().session_id;
        scanner.start_capturing(&id).await.unwrap();

        let snapshot = wait_until_drained(&scanner, &id).await;
        assert_eq!(snapshot.image_blocks, vec![1]);
        assert_eq!(snapshot.status.detected, Detected::PaperJam);
        assert!(!snapshot.status.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let scanner = LocalScanner::new(LocalScannerConfig {
            store_dir: temp_dir.path().join("blocks"),
            long_poll: Duration::from_secs(60),
            session_timeout: Duration::from_secs(1),
            ..LocalScannerConfig::default()
        })
        .unwrap();
        assert_eq!(scanner.config().session_timeout, MIN_SESSION_TIMEOUT);

        let created = scanner.create_session().await.unwrap();
        let id = created.session_id.clone();

        // Commands inside the window keep the session alive
        tokio::time::sleep(Duration::from_secs(8)).await;
        scanner.get_session(&id).await.unwrap();
        tokio::time::sleep(Duration::from_secs(8)).await;
        let snapshot = scanner.get_session(&id).await.unwrap();

        // A long poll is not activity; the timeout ends it early
        let started = Instant::now();
        let err = scanner
            .wait_for_events(&id, snapshot.revision)
            .await
            .unwrap_err();
        assert_eq!(err.status, ApiStatus::SessionTimedOut);
        assert!(started.elapsed() < Duration::from_secs(60));

        let published = scanner.subscribe().borrow().clone();
        assert_eq!(published.state, SessionState::Closed);
        assert!(published.revision > snapshot.revision);

        // The expired session makes room for a new one
        assert!(scanner.create_session().await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_returns_on_change() {
        let temp_dir = TempDir::new().unwrap();
        let scanner = scanner(&temp_dir, 1);
        let created = scanner.create_session().await.unwrap();

        let waiter = {
            let scanner = scanner.clone();
            let id = created.session_id.clone();
            let revision = created.revision;
            tokio::spawn(async move { scanner.wait_for_events(&id, revision).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        scanner.start_capturing(&created.session_id).await.unwrap();

        let snapshot = waiter.await.unwrap().unwrap();
        assert!(snapshot.revision > created.revision);
    }
}
