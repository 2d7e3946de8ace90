//! Configuration module for SmartScale-RS
//!
//! This module handles application configuration including:
//! - How to run the acquisition and discovery helpers
//! - Session timing (liveness deadline, watchdog interval, grace period)
//! - Application state persistence (last device, recent devices)
//!
//! # App Data Location
//!
//! Application data is stored in the platform-appropriate location:
//! - **Linux**: `~/.local/share/dev.smartscale.smartscale-rs/`
//! - **macOS**: `~/Library/Application Support/dev.smartscale.smartscale-rs/`
//! - **Windows**: `%APPDATA%\dev.smartscale.smartscale-rs\`
//!
//! # Files
//!
//! - `config.json` - Helper and session settings
//! - `app_state.json` - Last used device and recently discovered devices
//!
//! # Example
//!
//! ```ignore
//! use smartscale::config::{AppConfig, AppState};
//!
//! let config = AppConfig::load_or_default();
//! let producer = config.producer.stream_producer()?;
//!
//! let mut state = AppState::load_or_default();
//! state.remember_device("SC02", "AA:BB:CC:DD:EE:FF");
//! state.save()?;
//! ```

use crate::discovery::DiscoveredDevice;
use crate::error::{Result, ScaleError};
use crate::producer::CommandSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Application identifier for data directories
pub const APP_ID: &str = "dev.smartscale.smartscale-rs";

/// Config filename
pub const CONFIG_FILE: &str = "config.json";

/// App state filename
pub const APP_STATE_FILE: &str = "app_state.json";

/// Maximum number of recent devices to remember
pub const MAX_RECENT_DEVICES: usize = 10;

/// Default silence tolerated before a session times out
pub const DEFAULT_LIVENESS_DEADLINE_MS: u64 = 5000;

/// Default interval between watchdog checks
pub const DEFAULT_WATCHDOG_INTERVAL_MS: u64 = 1000;

/// Default time a helper gets to exit before it is killed
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 2000;

/// Default discovery timeout in seconds (the helper scans for 5s itself)
pub const DEFAULT_DISCOVERY_TIMEOUT_SECS: u64 = 15;

/// Default streaming helper script
pub const DEFAULT_STREAM_SCRIPT: &str = "retrieve_data.py";

/// Default discovery helper script
pub const DEFAULT_DISCOVERY_SCRIPT: &str = "scan_ble.py";

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        ScaleError::Config("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            ScaleError::Config(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Get the path to the config file
pub fn config_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(CONFIG_FILE))
}

/// Get the path to the app state file
pub fn app_state_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(APP_STATE_FILE))
}

fn read_json<T: serde::de::DeserializeOwned + Default>(path: &Path, what: &str) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ScaleError::Config(format!("Failed to read {}: {}", what, e)))?;

    serde_json::from_str(&content)
        .map_err(|e| ScaleError::Config(format!("Failed to parse {}: {}", what, e)))
}

fn write_json<T: Serialize>(value: &T, path: &Path, what: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| ScaleError::Config(format!("Failed to create {}: {}", parent.display(), e)))?;
    }

    let content = serde_json::to_string_pretty(value)
        .map_err(|e| ScaleError::Config(format!("Failed to serialize {}: {}", what, e)))?;

    std::fs::write(path, content)
        .map_err(|e| ScaleError::Config(format!("Failed to write {}: {}", what, e)))
}

// ==================== App Config ====================

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// How to run the helpers
    pub producer: ProducerConfig,
    /// Session timing
    pub session: SessionConfig,
    /// Device discovery settings
    pub discovery: DiscoveryConfig,
    /// CSV export settings
    pub export: ExportConfig,
}

impl AppConfig {
    /// Load config from the default location
    pub fn load() -> Result<Self> {
        let path = config_path()
            .ok_or_else(|| ScaleError::Config("Could not determine config path".to_string()))?;
        Self::load_from(&path)
    }

    /// Load config from a specific file; a missing file yields defaults
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        read_json(path.as_ref(), "config")
    }

    /// Load config, returning defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        let dir = ensure_app_data_dir()?;
        self.save_to(dir.join(CONFIG_FILE))
    }

    /// Save config to a specific file
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        write_json(self, path.as_ref(), "config")
    }
}

// ==================== Producer Config ====================

/// How the Python helpers are located and launched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Interpreter to use; resolved automatically when unset
    pub interpreter: Option<PathBuf>,
    /// Directory holding the helper scripts (and optionally a `venv`)
    pub scripts_dir: PathBuf,
    /// Streaming helper, relative to `scripts_dir`
    pub stream_script: String,
    /// Discovery helper, relative to `scripts_dir`
    pub discovery_script: String,
    /// Pass `-u` so the helper's stdout is not block-buffered
    pub unbuffered: bool,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            interpreter: None,
            scripts_dir: app_data_dir()
                .map(|dir| dir.join("python"))
                .unwrap_or_else(|| PathBuf::from("python")),
            stream_script: DEFAULT_STREAM_SCRIPT.to_string(),
            discovery_script: DEFAULT_DISCOVERY_SCRIPT.to_string(),
            unbuffered: true,
        }
    }
}

impl ProducerConfig {
    /// Virtualenv interpreter inside `scripts_dir`, if present
    pub fn venv_interpreter(&self) -> Option<PathBuf> {
        let venv = self.scripts_dir.join("venv");
        [
            venv.join("bin").join("python"),
            venv.join("Scripts").join("python.exe"),
        ]
        .into_iter()
        .find(|p| p.is_file())
    }

    /// Resolve the interpreter: configured, then virtualenv, then PATH
    pub fn resolve_interpreter(&self) -> Result<PathBuf> {
        if let Some(interpreter) = &self.interpreter {
            return Ok(interpreter.clone());
        }
        if let Some(venv) = self.venv_interpreter() {
            tracing::debug!("Using virtualenv interpreter {}", venv.display());
            return Ok(venv);
        }
        ["python3", "python"]
            .into_iter()
            .find_map(|name| which::which(name).ok())
            .ok_or_else(|| {
                ScaleError::SpawnFailure(
                    "no Python interpreter found (configure producer.interpreter)".to_string(),
                )
            })
    }

    /// Command for a helper script; the script must exist
    pub fn script_command(&self, script: &str) -> Result<CommandSpec> {
        let script_path = self.scripts_dir.join(script);
        if !script_path.is_file() {
            return Err(ScaleError::SpawnFailure(format!(
                "{} not found at: {}",
                script,
                script_path.display()
            )));
        }

        let mut spec = CommandSpec::new(self.resolve_interpreter()?);
        if self.unbuffered {
            spec = spec.arg("-u");
        }
        Ok(spec.arg(script_path.to_string_lossy()))
    }

    /// Command running the streaming helper (the target is appended per session)
    pub fn stream_command(&self) -> Result<CommandSpec> {
        self.script_command(&self.stream_script)
    }

    /// Command running the discovery helper
    pub fn discovery_command(&self) -> Result<CommandSpec> {
        self.script_command(&self.discovery_script)
    }
}

// ==================== Session Config ====================

/// Timing of an acquisition session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Silence tolerated while streaming before the session fails
    pub liveness_deadline_ms: u64,
    /// Interval between watchdog checks
    pub watchdog_interval_ms: u64,
    /// Time a helper gets to exit after a graceful termination request
    pub grace_period_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            liveness_deadline_ms: DEFAULT_LIVENESS_DEADLINE_MS,
            watchdog_interval_ms: DEFAULT_WATCHDOG_INTERVAL_MS,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
        }
    }
}

impl SessionConfig {
    pub fn liveness_deadline(&self) -> Duration {
        Duration::from_millis(self.liveness_deadline_ms)
    }

    /// Watchdog tick, never shorter than 1 ms
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms.max(1))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

// ==================== Discovery Config ====================

/// Device discovery settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Give up on the discovery helper after this many seconds
    pub timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_DISCOVERY_TIMEOUT_SECS,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ==================== Export Config ====================

/// CSV export settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Directory used when only a file name is given; current directory if unset
    pub directory: Option<PathBuf>,
    /// Format timestamps in UTC instead of local time
    pub utc: bool,
}

// ==================== Recent Device Entry ====================

/// A device seen during discovery or used for streaming
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentDevice {
    /// Advertised name
    pub name: String,
    /// BLE address (or platform UUID)
    pub address: String,
    /// Last used timestamp (Unix seconds)
    pub last_used: u64,
}

impl RecentDevice {
    /// Create a new entry stamped with the current time
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            last_used: unix_now(),
        }
    }
}

impl From<&DiscoveredDevice> for RecentDevice {
    fn from(device: &DiscoveredDevice) -> Self {
        Self::new(device.name.clone(), device.address.clone())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ==================== App State ====================

/// Persistent application state
///
/// Remembers devices across runs so `stream --last` can reconnect without
/// scanning again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppState {
    /// Version for future migration support
    #[serde(default = "default_app_state_version")]
    pub version: u32,

    /// Address of the last device streamed from
    #[serde(default)]
    pub last_device: Option<String>,

    /// Recently used or discovered devices, most recent first
    #[serde(default)]
    pub recent_devices: Vec<RecentDevice>,
}

fn default_app_state_version() -> u32 {
    1
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            version: 1,
            last_device: None,
            recent_devices: Vec::new(),
        }
    }
}

impl AppState {
    /// Load app state from the default location
    pub fn load() -> Result<Self> {
        let path = app_state_path().ok_or_else(|| {
            ScaleError::Config("Could not determine app state path".to_string())
        })?;
        Self::load_from(&path)
    }

    /// Load app state from a specific file
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        read_json(path.as_ref(), "app state")
    }

    /// Load app state, returning defaults on any error
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load app state, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save app state to the default location
    pub fn save(&self) -> Result<()> {
        let dir = ensure_app_data_dir()?;
        self.save_to(dir.join(APP_STATE_FILE))
    }

    /// Save app state to a specific file
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        write_json(self, path.as_ref(), "app state")
    }

    /// Add or refresh a device in the recents list
    pub fn add_recent_device(&mut self, device: RecentDevice) {
        self.recent_devices.retain(|d| d.address != device.address);
        self.recent_devices.insert(0, device);
        self.recent_devices.truncate(MAX_RECENT_DEVICES);
    }

    /// Record a device as the one last streamed from
    pub fn remember_device(&mut self, name: &str, address: &str) {
        self.add_recent_device(RecentDevice::new(name, address));
        self.last_device = Some(address.to_string());
    }

    /// Look up a recent device by address
    pub fn find_device(&self, address: &str) -> Option<&RecentDevice> {
        self.recent_devices.iter().find(|d| d.address == address)
    }
}

// ==================== Tests ====================
