//! Error handling for SmartScale-RS
//!
//! This module defines the crate error type and a Result alias for use
//! throughout the library.
//!
//! Only failures that happen synchronously surface as [`ScaleError`]: target
//! validation, a second `start`, and launching the helper process. Anything
//! that goes wrong once a session is streaming is reported asynchronously as a
//! [`FailureReason`](crate::types::FailureReason) through the subscriber
//! interface.

use crate::protocol::ProtocolError;
use crate::types::SessionState;
use thiserror::Error;

/// Main error type for SmartScale-RS operations
#[derive(Error, Debug)]
pub enum ScaleError {
    /// Empty or malformed device identifier passed to `start`
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// `start` called on a session that has already left `Idle`
    #[error("Session already active (state: {0})")]
    AlreadyActive(SessionState),

    /// Helper executable or script missing, or the OS refused to launch it
    #[error("Failed to launch helper: {0}")]
    SpawnFailure(String),

    /// Malformed or explicit error line from the helper
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to CSV export
    #[error("Export error: {0}")]
    Export(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<ScaleError>,
    },
}

impl ScaleError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ScaleError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

impl From<serde_json::Error> for ScaleError {
    fn from(err: serde_json::Error) -> Self {
        ScaleError::Serialization(err.to_string())
    }
}

/// Result type alias for SmartScale-RS operations
pub type Result<T> = std::result::Result<T, ScaleError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| ScaleError::Io(e).with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| ScaleError::Io(e).with_context(f()))
    }
}
