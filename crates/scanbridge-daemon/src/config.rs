//! Configuration loading and validation

use anyhow::{bail, Result};
use scanbridge_negotiate::DeviceProfile;
use scanbridge_scan::{LocalScannerConfig, ScanOptions, ScanStrategy, MIN_SESSION_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the scanner endpoint
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Longest a waitForEvents call is held open, in seconds
    #[serde(default = "default_long_poll")]
    pub long_poll_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            long_poll_secs: default_long_poll(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:34034".to_string()
}

fn default_long_poll() -> u64 {
    30
}

/// Simulated scanner served by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Vendor GUID whose task extensions are honored
    #[serde(default = "Uuid::nil")]
    pub vendor: Uuid,
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    #[serde(default = "default_true")]
    pub feeder: bool,
    #[serde(default = "default_true")]
    pub flatbed: bool,
    #[serde(default = "default_true")]
    pub duplex: bool,
    #[serde(default)]
    pub automatic_sense_medium: bool,
    #[serde(default = "default_pixel_formats")]
    pub pixel_formats: Vec<String>,
    #[serde(default = "default_resolutions")]
    pub resolutions: Vec<u32>,
    #[serde(default = "default_compressions")]
    pub compressions: Vec<String>,
    /// Sheets produced per capture
    #[serde(default = "default_sheets")]
    pub sheets: u32,
    /// Time to produce one image block, in milliseconds
    #[serde(default = "default_block_delay")]
    pub block_delay_ms: u64,
    /// Report a paper jam after this many sheets
    #[serde(default)]
    pub jam_after: Option<u32>,
    /// Idle seconds before an open session is closed (at least 10)
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    #[serde(default)]
    pub thumbnails: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            vendor: Uuid::nil(),
            store_dir: default_store_dir(),
            feeder: true,
            flatbed: true,
            duplex: true,
            automatic_sense_medium: false,
            pixel_formats: default_pixel_formats(),
            resolutions: default_resolutions(),
            compressions: default_compressions(),
            sheets: default_sheets(),
            block_delay_ms: default_block_delay(),
            jam_after: None,
            session_timeout_secs: default_session_timeout(),
            thumbnails: false,
        }
    }
}

fn default_name() -> String {
    "scanbridge".to_string()
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("scanbridge-blocks")
}

fn default_true() -> bool {
    true
}

fn default_pixel_formats() -> Vec<String> {
    vec!["bw1".to_string(), "gray8".to_string(), "rgb24".to_string()]
}

fn default_resolutions() -> Vec<u32> {
    vec![100, 150, 200, 300, 600]
}

fn default_compressions() -> Vec<String> {
    vec!["none".to_string(), "group4".to_string(), "jpeg".to_string()]
}

fn default_sheets() -> u32 {
    3
}

fn default_block_delay() -> u64 {
    200
}

fn default_session_timeout() -> u64 {
    300
}

/// One-shot scan client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `serial` or `concurrent`
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Transfer workers for the concurrent strategy
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// How often a blocked wait checks for stop and abort, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub metadata_with_image: bool,
    #[serde(default)]
    pub thumbnails: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            workers: default_workers(),
            poll_interval_ms: default_poll_interval(),
            request_timeout_ms: default_request_timeout(),
            metadata_with_image: true,
            thumbnails: false,
            output_dir: default_output_dir(),
        }
    }
}

fn default_strategy() -> String {
    "serial".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    250
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("scans")
}

impl Config {
    pub fn long_poll(&self) -> Duration {
        Duration::from_secs(self.daemon.long_poll_secs)
    }

    /// Convert to the in-process scanner settings
    pub fn to_local_config(&self) -> LocalScannerConfig {
        let scanner = &self.scanner;
        LocalScannerConfig {
            name: scanner.name.clone(),
            vendor: scanner.vendor,
            store_dir: scanner.store_dir.clone(),
            sheets: scanner.sheets,
            block_delay: Duration::from_millis(scanner.block_delay_ms),
            jam_after: scanner.jam_after,
            long_poll: self.long_poll(),
            session_timeout: Duration::from_secs(scanner.session_timeout_secs)
                .max(MIN_SESSION_TIMEOUT),
            thumbnails: scanner.thumbnails,
            profile: DeviceProfile {
                feeder: scanner.feeder,
                flatbed: scanner.flatbed,
                duplex: scanner.duplex,
                automatic_sense_medium: scanner.automatic_sense_medium,
                pixel_formats: scanner.pixel_formats.clone(),
                resolutions: scanner.resolutions.clone(),
                compressions: scanner.compressions.clone(),
                ..DeviceProfile::default()
            },
        }
    }

    /// Convert to scan loop options
    pub fn to_scan_options(&self) -> Result<ScanOptions> {
        let client = &self.client;
        let strategy = match client.strategy.to_lowercase().as_str() {
            "serial" => ScanStrategy::Serial,
            "concurrent" => {
                if client.workers == 0 {
                    bail!("client.workers must be at least 1 for the concurrent strategy");
                }
                ScanStrategy::Concurrent {
                    workers: client.workers,
                }
            }
            other => bail!("Unknown scan strategy '{}', expected serial or concurrent", other),
        };
        let options = ScanOptions {
            metadata_with_image: client.metadata_with_image,
            thumbnails: client.thumbnails,
            ..ScanOptions::new(strategy)
        };
        Ok(options.with_poll_interval(Duration::from_millis(client.poll_interval_ms)))
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let config = Config {
        scanner: ScannerConfig {
            vendor: Uuid::new_v4(),
            ..ScannerConfig::default()
        },
        ..Config::default()
    };

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}
