//! Scanbridge - Main entry point
//!
//! Serves a simulated scanner over HTTP, or runs a single scan as a client
//! against that scanner in-process or against a remote one.

use anyhow::{bail, Context, Result};
use clap::Parser;
use scanbridge_core::ImageBlockStore;
use scanbridge_scan::{
    DeviceTransport, HttpTransport, LocalScanner, ScanControl, ScanReport, ScanRunner, StoreSink,
};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use scanbridge_daemon::config::{self, Config};
use scanbridge_daemon::{server, state};

#[derive(Parser, Debug)]
#[command(name = "scanbridge")]
#[command(about = "Document scanner session bridge and scan client")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "scanbridge.toml")]
    config: PathBuf,

    /// Bind address for the scanner endpoint
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single scan with this task file and exit
    #[arg(short, long)]
    task: Option<PathBuf>,

    /// Scan on a remote scanner instead of the in-process one
    #[arg(short, long, requires = "task")]
    remote: Option<String>,

    /// Directory for received images (overrides client.output_dir)
    #[arg(short, long, requires = "task")]
    output: Option<PathBuf>,

    /// Write a default configuration file and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Scanbridge v{}", env!("CARGO_PKG_VERSION"));

    if args.init_config {
        if args.config.exists() {
            bail!("{} already exists", args.config.display());
        }
        config::save_default_config(&args.config)?;
        println!("Wrote default configuration to {}", args.config.display());
        return Ok(());
    }

    let mut config = config::load_config(&args.config)?;

    if let Some(bind) = args.bind {
        config.daemon.bind = bind;
    }

    match args.task {
        Some(task) => {
            let output = args
                .output
                .unwrap_or_else(|| config.client.output_dir.clone());
            scan_once(&config, &task, args.remote.as_deref(), &output).await
        }
        None => {
            let state = state::AppState::new(config)?;
            server::run(state).await
        }
    }
}

/// Negotiate the task, run the scan loop and save what arrives
async fn scan_once(
    config: &Config,
    task_path: &Path,
    remote: Option<&str>,
    output: &Path,
) -> Result<()> {
    let text = std::fs::read_to_string(task_path)
        .with_context(|| format!("Failed to read task {}", task_path.display()))?;
    let task: JsonValue = serde_json::from_str(&text)
        .with_context(|| format!("Task {} is not valid JSON", task_path.display()))?;

    let options = config.to_scan_options()?;
    let mut local = None;
    let transport: Arc<dyn DeviceTransport> = match remote {
        Some(url) => {
            let mut http = HttpTransport::new(
                url,
                Duration::from_millis(config.client.request_timeout_ms),
                config.long_poll(),
            )?;
            let device = http.info().await?;
            // The device decides how long it holds a long poll
            if let Some(ms) = device.long_poll_ms {
                http = http.with_long_poll(Duration::from_millis(ms));
            }
            info!(
                url = %url,
                name = %device.name,
                model = %device.model,
                long_poll = ?http.long_poll(),
                "Connected to scanner"
            );
            Arc::new(http)
        }
        None => {
            let scanner = LocalScanner::new(config.to_local_config())?;
            local = Some(scanner.clone());
            Arc::new(scanner)
        }
    };

    let sink = Arc::new(StoreSink::new(ImageBlockStore::open(output)?));
    let control = ScanControl::new();
    spawn_interrupt_handler(control.clone());

    info!(
        task = %task_path.display(),
        strategy = ?options.strategy,
        output = %output.display(),
        "Starting scan"
    );
    let runner = ScanRunner::new(options);
    let report = runner.scan(transport, &task, sink, &control).await?;

    if let Some(scanner) = local {
        scanner.shutdown().await;
    }

    print_report(&report, output)?;

    if let Some(err) = report.first_error {
        if let Some(json_key) = &err.json_key {
            error!(json_key = %json_key, "Task rejected");
        }
        if let Some(response) = &err.response {
            error!(response = %response, "Raw device response");
        }
        bail!("{}. {}", err, err.hint());
    }
    Ok(())
}

/// First Ctrl-C stops capturing and collects what was scanned; a second one
/// aborts
fn spawn_interrupt_handler(control: ScanControl) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupted, stopping capture (press Ctrl-C again to abort)");
        control.request_stop();

        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Aborting scan");
        control.request_abort();
    });
}

fn print_report(report: &ScanReport, output: &Path) -> Result<()> {
    if let Some(task) = &report.task {
        println!("{}", serde_json::to_string_pretty(&task.to_json())?);
    }

    println!(
        "Transferred {} image block(s) to {}",
        report.transferred.len(),
        output.display()
    );
    let skipped = report.released.len().saturating_sub(report.transferred.len());
    if skipped > 0 {
        println!("Released {} image block(s) without transfer", skipped);
    }
    println!(
        "Drained: {}  Stopped: {}  Aborted: {}  Final state: {}",
        report.drained, report.stopped, report.aborted, report.final_state
    );
    Ok(())
}
