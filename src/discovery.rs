//! One-shot device discovery
//!
//! Runs the discovery helper, which scans for scales and prints a single JSON
//! report on stdout:
//!
//! ```text
//! {"found": true, "devices": [{"name": "SC02", "address": "AA:BB:...", "rssi": -60}]}
//! ```
//!
//! Every failure (helper missing, non-zero exit, timeout, unreadable output)
//! is folded into a report with `found: false` and an `error` message, so the
//! caller always has something to show.

use crate::producer::CommandSpec;
use crossbeam_channel::{bounded, Receiver};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

/// Separator between name and address in a device label
pub const LABEL_SEPARATOR: &str = " - ";

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A scale seen during discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    #[serde(default)]
    pub name: String,
    pub address: String,
    /// Signal strength in dBm, when the platform reports it
    #[serde(default)]
    pub rssi: Option<i64>,
}

impl DiscoveredDevice {
    /// `"name - address"`, as shown in device pickers
    pub fn label(&self) -> String {
        format!("{}{}{}", self.name, LABEL_SEPARATOR, self.address)
    }
}

/// Recover the address from a label produced by [`DiscoveredDevice::label`]
pub fn address_from_label(label: &str) -> Option<&str> {
    label
        .rfind(LABEL_SEPARATOR)
        .map(|idx| label[idx + LABEL_SEPARATOR.len()..].trim())
        .filter(|address| !address.is_empty())
}

/// Result of one discovery run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    #[serde(default)]
    pub found: bool,
    #[serde(default)]
    pub devices: Vec<DiscoveredDevice>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DiscoveryReport {
    /// A report carrying only an error
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            found: false,
            devices: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Check if any device can be connected to
    pub fn has_devices(&self) -> bool {
        self.found && !self.devices.is_empty()
    }
}

/// Parse the helper's output; never fails
pub fn parse_report(output: &str) -> DiscoveryReport {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return DiscoveryReport::failed("discovery helper produced no output");
    }
    if let Some(message) = trimmed.strip_prefix(crate::protocol::ERROR_PREFIX) {
        return DiscoveryReport::failed(message.trim());
    }
    if !trimmed.starts_with('{') {
        return DiscoveryReport::failed("invalid discovery output: expected a JSON object");
    }
    match serde_json::from_str::<DiscoveryReport>(trimmed) {
        Ok(mut report) => {
            report.found = report.found && !report.devices.is_empty();
            report
        }
        Err(e) => DiscoveryReport::failed(format!("invalid discovery output: {}", e)),
    }
}

/// Run the discovery helper and wait for its report
pub fn discover(command: &CommandSpec, timeout: Duration) -> DiscoveryReport {
    tracing::info!("Scanning for devices: {}", command);

    let mut child = match command.command().spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!("Failed to launch discovery helper: {}", e);
            return DiscoveryReport::failed(format!(
                "failed to launch {}: {}",
                command.program.display(),
                e
            ));
        }
    };

    // Drain both pipes while waiting so a chatty helper cannot block on a full pipe
    let stdout = child.stdout.take().map(read_to_string_async);
    let stderr = child.stderr.take().map(read_to_string_async);

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if started.elapsed() >= timeout {
                    tracing::warn!("Discovery timed out after {:?}", timeout);
                    let _ = child.kill();
                    let _ = child.wait();
                    return DiscoveryReport::failed(format!(
                        "discovery timed out after {}s",
                        timeout.as_secs()
                    ));
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return DiscoveryReport::failed(format!("failed to wait for discovery: {}", e));
            }
        }
    };

    let output = stdout.and_then(|rx| rx.recv().ok()).unwrap_or_default();
    let errors = stderr.and_then(|rx| rx.recv().ok()).unwrap_or_default();
    if !errors.trim().is_empty() {
        tracing::debug!(target: "smartscale::helper", "{}", errors.trim());
    }

    if !status.success() {
        let detail = errors
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .map(|l| format!(": {}", l.trim()))
            .unwrap_or_default();
        return DiscoveryReport::failed(format!("discovery helper failed ({}){}", status, detail));
    }

    let report = parse_report(&output);
    tracing::info!("Discovery found {} device(s)", report.devices.len());
    report
}

/// Run discovery on a background thread; the report arrives on the receiver
pub fn discover_async(command: CommandSpec, timeout: Duration) -> Receiver<DiscoveryReport> {
    let (tx, rx) = bounded(1);
    let spawned = thread::Builder::new()
        .name("smartscale-discovery".to_string())
        .spawn({
            let tx = tx.clone();
            move || {
                let _ = tx.send(discover(&command, timeout));
            }
        });
    if let Err(e) = spawned {
        let _ = tx.send(DiscoveryReport::failed(format!(
            "failed to spawn discovery thread: {}",
            e
        )));
    }
    rx
}

fn read_to_string_async<R: Read + Send + 'static>(mut reader: R) -> Receiver<String> {
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
    });
    rx
}
