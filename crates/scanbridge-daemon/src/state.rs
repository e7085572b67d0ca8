//! Application state management

use anyhow::Result;
use scanbridge_scan::LocalScanner;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;

/// Shared application state
pub struct AppState {
    /// Simulated scanner answering session commands
    pub scanner: Arc<LocalScanner>,
    /// Configuration
    pub config: Config,
}

impl AppState {
    /// Create new application state
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let scanner = Arc::new(LocalScanner::new(config.to_local_config())?);
        info!(
            name = %config.scanner.name,
            vendor = %config.scanner.vendor,
            sheets = config.scanner.sheets,
            "Scanner created"
        );
        Ok(Arc::new(Self { scanner, config }))
    }
}
