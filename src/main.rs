//! SmartScale - Main Entry Point
//!
//! Command line front end: scan for scales, stream live weight readings and
//! export them to CSV.

use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use smartscale::{
    config::{self, AppConfig, AppState},
    discovery::{self, address_from_label},
    export,
    producer::ProcessProducer,
    session::{AcquisitionSession, ChannelSubscriber, SessionEvent, Subscriber},
    store::RecordStore,
    types::Measurement,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of the one in the app data directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to a daily rotating file in the app data directory
    #[arg(long, global = true)]
    log_file: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for scales
    Scan {
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Stream weight readings from a scale
    Stream {
        /// Device address, or a "name - address" label printed by `scan`
        target: Option<String>,

        /// Reconnect to the last device streamed from
        #[arg(long, conflicts_with = "target")]
        last: bool,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Export the readings to this CSV file (or directory) when done
        #[arg(long)]
        export: Option<PathBuf>,

        /// Print and export times in UTC instead of local time
        #[arg(long)]
        utc: bool,
    },
    /// Show the configuration
    Config {
        /// Write the default configuration if none exists
        #[arg(long)]
        init: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_file);

    let config_path = cli.config.clone().or_else(config::config_path);
    let config = match &config_path {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Scan { timeout } => scan(&config, timeout),
        Commands::Stream {
            target,
            last,
            duration,
            export,
            utc,
        } => stream(&config, target, last, duration, export, utc || config.export.utc),
        Commands::Config { init } => show_config(&config, config_path.as_deref(), init),
    }
}

/// Set up tracing; the returned guard flushes the log file on drop
fn init_logging(log_file: bool) -> Option<WorkerGuard> {
    let (file_layer, guard) = match log_file.then(config::ensure_app_data_dir) {
        Some(Ok(dir)) => {
            let appender = tracing_appender::rolling::daily(dir.join("logs"), "smartscale.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Some(Err(e)) => {
            eprintln!("File logging disabled: {}", e);
            (None, None)
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,smartscale=debug")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

fn scan(config: &AppConfig, timeout: Option<u64>) -> Result<()> {
    let command = config
        .producer
        .discovery_command()
        .context("Cannot run the discovery helper")?;
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.discovery.timeout());

    let report = discovery::discover(&command, timeout);
    if let Some(error) = &report.error {
        bail!("Discovery failed: {}", error);
    }
    if !report.has_devices() {
        println!("No devices found");
        return Ok(());
    }

    let mut state = AppState::load_or_default();
    for device in &report.devices {
        match device.rssi {
            Some(rssi) => println!("{}  ({} dBm)", device.label(), rssi),
            None => println!("{}", device.label()),
        }
        state.add_recent_device(device.into());
    }
    if let Err(e) = state.save() {
        tracing::warn!("Failed to save app state: {}", e);
    }
    Ok(())
}

fn stream(
    config: &AppConfig,
    target: Option<String>,
    last: bool,
    duration: Option<u64>,
    export_path: Option<PathBuf>,
    utc: bool,
) -> Result<()> {
    let mut state = AppState::load_or_default();
    let target = match target {
        Some(target) => address_from_label(&target)
            .map(str::to_string)
            .unwrap_or(target),
        None if last => match state.last_device.clone() {
            Some(address) => address,
            None => bail!("No previous device; run `smartscale scan` first"),
        },
        None => bail!("No target given; pass a device address or --last"),
    };

    let command = config
        .producer
        .stream_command()
        .context("Cannot run the acquisition helper")?;
    let store = RecordStore::new();
    let session = AcquisitionSession::new(
        Arc::new(ProcessProducer::new(command)),
        store.clone(),
        config.session,
    );

    let (subscriber, events) = ChannelSubscriber::unbounded();
    let subscriber: Arc<dyn Subscriber> = subscriber;
    session.subscribe(&subscriber);
    session
        .start(&target)
        .with_context(|| format!("Failed to start streaming from {}", target))?;

    let name = state
        .find_device(&target)
        .map(|d| d.name.clone())
        .unwrap_or_else(|| "Unknown".to_string());
    state.remember_device(&name, &target);
    if let Err(e) = state.save() {
        tracing::warn!("Failed to save app state: {}", e);
    }

    println!("{:<10}  {:<8}  {:>11}", "Date", "Time", "Weight (kg)");
    let deadline =
        duration.and_then(|secs| Instant::now().checked_add(Duration::from_secs(secs)));
    let mut outcome = None;
    loop {
        let wait = match deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::from_millis(500),
        };
        match events.recv_timeout(wait) {
            Ok(SessionEvent::Measurement(m)) => print_row(&m, utc),
            Ok(SessionEvent::ProtocolError(e)) => eprintln!("Helper: {}", e),
            Ok(SessionEvent::SessionEnded(reason)) => {
                outcome = Some(reason);
                break;
            }
            Err(_) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    tracing::info!("Duration reached, stopping");
                    break;
                }
            }
        }
    }

    session.stop();
    // Readings that raced the stop are still in the queue
    for event in smartscale::session::drain(&events) {
        match event {
            SessionEvent::Measurement(m) => print_row(&m, utc),
            SessionEvent::SessionEnded(reason) if outcome.is_none() => outcome = Some(reason),
            _ => {}
        }
    }

    let stats = session.stats();
    tracing::info!(
        "{} lines, {} measurements, {} protocol errors ({:.1}% decoded)",
        stats.lines_received,
        stats.measurements,
        stats.protocol_errors,
        stats.success_rate()
    );

    if let Some(path) = export_path {
        let records = store.snapshot();
        let path = resolve_export_path(&path, config.export.directory.as_deref());
        let written = if utc {
            export::export_csv_in(&records, &path, &Utc)
        } else {
            export::export_csv_in(&records, &path, &Local)
        }
        .context("Export failed")?;
        println!("Exported {} readings to {}", records.len(), written.display());
    }

    match outcome.flatten() {
        Some(reason) => bail!("Session failed: {}", reason),
        None => Ok(()),
    }
}

fn print_row(m: &Measurement, utc: bool) {
    let (date, time) = if utc {
        (m.date_string(&Utc), m.time_string(&Utc))
    } else {
        (m.date_string(&Local), m.time_string(&Local))
    };
    println!("{:<10}  {:<8}  {:>11}", date, time, m.weight_string());
}

/// Directories get a timestamped file name; bare names land in the export directory
fn resolve_export_path(path: &Path, export_dir: Option<&Path>) -> PathBuf {
    if path.is_dir() {
        return path.join(export::default_file_name(&Local::now()));
    }
    match export_dir {
        Some(dir) if path.parent().map_or(true, |p| p.as_os_str().is_empty()) => dir.join(path),
        _ => path.to_path_buf(),
    }
}

fn show_config(config: &AppConfig, path: Option<&Path>, init: bool) -> Result<()> {
    if init {
        let path = path.context("Could not determine config path")?;
        if path.exists() {
            println!("Config already exists at {}", path.display());
        } else {
            config.save_to(path)?;
            println!("Wrote default config to {}", path.display());
        }
    } else if let Some(path) = path {
        println!("# {}", path.display());
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
