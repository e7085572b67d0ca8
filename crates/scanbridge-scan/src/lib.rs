//! Scanbridge Scan - device transports and the client scan loop
//!
//! This crate provides:
//! - The [`DeviceTransport`] seam with an HTTP and an in-process implementation
//! - The session command wire format
//! - A client-side session mirror
//! - The scan loop with serial and concurrent transfer strategies

pub mod client;
pub mod http;
pub mod local;
pub mod orchestrator;
pub mod protocol;
pub mod sink;
pub mod transport;

pub use client::ClientSession;
pub use http::HttpTransport;
pub use local::{LocalScanner, LocalScannerConfig, MIN_SESSION_TIMEOUT};
pub use orchestrator::{ScanControl, ScanOptions, ScanReport, ScanRunner, ScanStrategy};
pub use protocol::{dispatch, CommandEnvelope, ResponseEnvelope, ScannerInfo};
pub use sink::{ImageSink, MemorySink, StoreSink, TransferredBlock};
pub use transport::{DeviceTransport, ImageTransfer, MetadataTransfer};
