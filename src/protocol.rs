//! Line protocol spoken by the acquisition helper
//!
//! The helper writes one event per line on stdout:
//!
//! - a JSON object `{"timestamp": <int seconds>, "weight": <float kg>}`, possibly
//!   with extra fields such as the raw advertisement payload;
//! - a JSON object with an `error` field and no weight, when the helper failed
//!   to interpret an advertisement;
//! - a literal `ERROR: <message>` line for the helper's own failures.
//!
//! [`decode_line`] turns one such line into a [`Measurement`] or a
//! [`ProtocolError`]. It is pure: no state survives between lines, it never
//! blocks and never panics, whatever the input.

use crate::types::Measurement;
use serde::Deserialize;
use thiserror::Error;

/// Prefix the helper uses for its own error reports
pub const ERROR_PREFIX: &str = "ERROR:";

/// Message used for lines that are neither a sample nor an error report
pub const MALFORMED_LINE: &str = "malformed line";

/// A line that did not decode into a measurement
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ProtocolError {
    /// What went wrong, as reported by the helper or the decoder
    pub message: String,
    /// The offending line, when it was not an explicit `ERROR:` report
    pub raw: Option<String>,
}

impl ProtocolError {
    /// An explicit error report from the helper
    pub fn reported(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            raw: None,
        }
    }

    /// A line the decoder could not make sense of
    pub fn malformed(raw: impl Into<String>) -> Self {
        Self {
            message: MALFORMED_LINE.to_string(),
            raw: Some(raw.into()),
        }
    }

    /// Check if the helper reported this error itself
    pub fn is_reported(&self) -> bool {
        self.raw.is_none() || self.message != MALFORMED_LINE
    }
}

/// Wire shape of a JSON line
#[derive(Debug, Deserialize)]
struct WireSample {
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

/// Decode one line of helper output
pub fn decode_line(line: &str) -> Result<Measurement, ProtocolError> {
    let line = line.trim_end_matches(&['\r', '\n'][..]);

    if let Some(rest) = line.strip_prefix(ERROR_PREFIX) {
        return Err(ProtocolError::reported(rest.trim_start()));
    }

    // serde would also accept a JSON array in field order
    if !line.trim_start().starts_with('{') {
        return Err(ProtocolError::malformed(line));
    }
    let sample: WireSample =
        serde_json::from_str(line).map_err(|_| ProtocolError::malformed(line))?;

    match sample {
        WireSample {
            timestamp: Some(seconds),
            weight: Some(weight),
            ..
        } => seconds
            .checked_mul(1000)
            .and_then(|millis| Measurement::new(millis, weight))
            .ok_or_else(|| ProtocolError::malformed(line)),
        WireSample {
            weight: None,
            error: Some(message),
            ..
        } => Err(ProtocolError {
            message,
            raw: Some(line.to_string()),
        }),
        _ => Err(ProtocolError::malformed(line)),
    }
}
