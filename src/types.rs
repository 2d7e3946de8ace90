//! Core data types for SmartScale-RS
//!
//! This module contains the fundamental values shared by every part of the
//! crate: the decoded [`Measurement`], the acquisition [`SessionState`] and the
//! [`FailureReason`] that explains how a session ended.
//!
//! # Main Types
//!
//! - [`Measurement`] - One timestamped weight reading, immutable once decoded
//! - [`SessionState`] - Lifecycle of one acquisition session
//! - [`FailureReason`] - Why a session ended in `Failed`
//! - [`SessionStats`] - Counters collected by the reader loop
//!
//! # Time
//!
//! Measurement timestamps are wall-clock epoch milliseconds (UTC) as reported
//! by the helper. Formatting for display or export picks a time zone at the
//! call site, so the same record renders deterministically in tests (UTC) and
//! in the user's local time in the CLI.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Date format used by the table view and CSV export
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Time format used by the table view and CSV export
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// One decoded weight reading
///
/// Only constructible through [`Measurement::new`] (deserialization included),
/// so every value in a store has a non-negative timestamp and a finite weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMeasurement")]
pub struct Measurement {
    timestamp_millis: i64,
    weight_kg: f64,
}

#[derive(Deserialize)]
struct RawMeasurement {
    timestamp_millis: i64,
    weight_kg: f64,
}

impl TryFrom<RawMeasurement> for Measurement {
    type Error = String;

    fn try_from(raw: RawMeasurement) -> Result<Self, Self::Error> {
        Measurement::new(raw.timestamp_millis, raw.weight_kg).ok_or_else(|| {
            format!(
                "invalid measurement: timestamp {} ms, weight {}",
                raw.timestamp_millis, raw.weight_kg
            )
        })
    }
}

impl Measurement {
    /// Create a measurement, rejecting negative timestamps and non-finite weights
    pub fn new(timestamp_millis: i64, weight_kg: f64) -> Option<Self> {
        if timestamp_millis < 0 || !weight_kg.is_finite() {
            return None;
        }
        Some(Self {
            timestamp_millis,
            weight_kg,
        })
    }

    /// Milliseconds since the Unix epoch (UTC)
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp_millis
    }

    /// Weight in kilograms
    pub fn weight_kg(&self) -> f64 {
        self.weight_kg
    }

    /// Timestamp as a UTC date-time
    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp_millis).unwrap_or_default()
    }

    /// Timestamp converted into the given time zone
    pub fn datetime_in<Tz: TimeZone>(&self, tz: &Tz) -> DateTime<Tz> {
        self.datetime().with_timezone(tz)
    }

    /// `yyyy-MM-dd` in the given time zone
    pub fn date_string<Tz: TimeZone>(&self, tz: &Tz) -> String
    where
        Tz::Offset: std::fmt::Display,
    {
        self.datetime_in(tz).format(DATE_FORMAT).to_string()
    }

    /// `HH:mm:ss` in the given time zone
    pub fn time_string<Tz: TimeZone>(&self, tz: &Tz) -> String
    where
        Tz::Offset: std::fmt::Display,
    {
        self.datetime_in(tz).format(TIME_FORMAT).to_string()
    }

    /// Weight rounded to two decimals for display
    pub fn weight_string(&self) -> String {
        format!("{:.2}", self.weight_kg)
    }
}

/// Why a session ended in [`SessionState::Failed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No output from the helper within the liveness deadline
    Timeout,
    /// Helper exited on its own with a non-zero code
    AbnormalExit(i32),
    /// Helper was killed by a signal nobody in this process sent
    Terminated,
    /// Helper could not be launched
    Spawn(String),
    /// Reading the helper's output failed
    Stream(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::AbnormalExit(code) => write!(f, "exit code {}", code),
            FailureReason::Terminated => write!(f, "terminated by signal"),
            FailureReason::Spawn(msg) => write!(f, "spawn failed: {}", msg),
            FailureReason::Stream(msg) => write!(f, "stream error: {}", msg),
        }
    }
}

/// Lifecycle of one acquisition session
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Created, not started yet
    #[default]
    Idle,
    /// Launching the helper process
    Connecting,
    /// Helper running, lines being decoded
    Streaming,
    /// Tearing down the helper and the worker threads
    Stopping,
    /// Ended cleanly (user stop or helper exited with code 0)
    Stopped,
    /// Ended because of a failure
    Failed(FailureReason),
}

impl SessionState {
    /// Check if the helper may still be producing data
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Streaming)
    }

    /// Check if the session reached a final state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed(_))
    }

    /// Failure reason, if the session failed
    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            SessionState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Display name for the state
    pub fn display_name(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting => "Connecting",
            SessionState::Streaming => "Streaming",
            SessionState::Stopping => "Stopping",
            SessionState::Stopped => "Stopped",
            SessionState::Failed(_) => "Failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Failed(reason) => write!(f, "Failed ({})", reason),
            other => write!(f, "{}", other.display_name()),
        }
    }
}

/// Statistics about one acquisition session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    /// Lines read from the helper, decodable or not
    pub lines_received: u64,
    /// Lines decoded into measurements
    pub measurements: u64,
    /// Lines reported as protocol errors
    pub protocol_errors: u64,
    /// Time since the helper last produced a line
    pub last_seen_age: Option<Duration>,
}

impl SessionStats {
    /// Share of lines that decoded into measurements, in percent
    pub fn success_rate(&self) -> f64 {
        if self.lines_received == 0 {
            100.0
        } else {
            (self.measurements as f64 / self.lines_received as f64) * 100.0
        }
    }
}
