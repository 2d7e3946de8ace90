//! Data producer abstraction
//!
//! An acquisition session reads its events from an external producer: in
//! practice a helper process that talks to the scale over BLE and prints one
//! event per line. The session never touches `std::process` directly; it goes
//! through the traits in this module so it can be driven by a scripted fake
//! in tests.
//!
//! # Components
//!
//! - [`Producer`] - Launches one run of the producer for a target device
//! - [`LineSource`] - Blocking line reader over the producer's output
//! - [`ProcessControl`] - Termination and exit status of a launched producer
//! - [`ProcessProducer`] - Real implementation backed by a child process
//! - [`MockProducer`] - Channel-driven fake (feature-gated)
//!
//! Cancelling a blocked [`LineSource::read_line`] is done by terminating the
//! producer through its [`ProcessControl`]: once the process is gone its
//! output closes and the read returns end-of-stream.

#[cfg(any(test, feature = "mock-producer"))]
pub mod mock;
pub mod process;

#[cfg(any(test, feature = "mock-producer"))]
pub use mock::{MockFeed, MockProducer};
pub use process::{CommandSpec, ProcessProducer};

use crate::error::Result;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

/// How often exit status is polled while waiting for a producer to go away
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How to ask a producer to terminate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Ask politely (SIGTERM on unix)
    Graceful,
    /// Kill outright
    Forced,
}

/// How a producer process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own with this code
    Code(i32),
    /// Killed by a signal
    Signal,
}

impl ProcessExit {
    /// Check if the process exited with code 0
    pub fn success(&self) -> bool {
        matches!(self, ProcessExit::Code(0))
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        match status.code() {
            Some(code) => ProcessExit::Code(code),
            None => ProcessExit::Signal,
        }
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessExit::Code(code) => write!(f, "exit code {}", code),
            ProcessExit::Signal => write!(f, "killed by signal"),
        }
    }
}

/// Blocking reader over the producer's output
pub trait LineSource: Send {
    /// Read the next line without its terminator; `None` at end of stream
    fn read_line(&mut self) -> io::Result<Option<String>>;
}

/// Lifecycle control of a launched producer
pub trait ProcessControl: Send {
    /// Ask the producer to terminate; a no-op once it has exited
    fn terminate(&mut self, how: Termination) -> io::Result<()>;

    /// Exit status if the producer has exited, without blocking
    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>>;

    /// Block until the producer exits
    fn wait(&mut self) -> io::Result<ProcessExit>;

    /// OS process id, when there is one
    fn id(&self) -> Option<u32> {
        None
    }
}

/// A launched producer: its output and its lifecycle handle
pub struct ProducerHandle {
    /// Output lines, consumed by the session's reader thread
    pub lines: Box<dyn LineSource>,
    /// Termination and exit status, owned by the session
    pub control: Box<dyn ProcessControl>,
}

impl std::fmt::Debug for ProducerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerHandle")
            .field("pid", &self.control.id())
            .finish_non_exhaustive()
    }
}

/// Something that can be launched against a target device
pub trait Producer: Send + Sync {
    /// Launch one run for `target`; failures are reported as `SpawnFailure`
    fn launch(&self, target: &str) -> Result<ProducerHandle>;

    /// Short human-readable description for logs
    fn describe(&self) -> String {
        "producer".to_string()
    }
}

/// Poll until the producer exits or `timeout` elapses
///
/// A timeout too large to represent as a deadline waits without limit.
pub fn wait_for_exit(
    control: &mut dyn ProcessControl,
    timeout: Duration,
) -> io::Result<Option<ProcessExit>> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        if let Some(exit) = control.try_wait()? {
            return Ok(Some(exit));
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Ok(None);
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

/// Terminate a producer: graceful first, forced once `grace` has elapsed
///
/// Always reaps the process before returning.
pub fn shutdown(control: &mut dyn ProcessControl, grace: Duration) -> io::Result<ProcessExit> {
    if let Some(exit) = control.try_wait()? {
        return Ok(exit);
    }

    if let Err(e) = control.terminate(Termination::Graceful) {
        tracing::debug!("Graceful termination failed: {}", e);
    }
    if let Some(exit) = wait_for_exit(control, grace)? {
        tracing::debug!("Producer exited after graceful termination ({})", exit);
        return Ok(exit);
    }

    tracing::warn!("Producer still running after {:?}, killing it", grace);
    if let Err(e) = control.terminate(Termination::Forced) {
        tracing::warn!("Forced termination failed: {}", e);
    }
    control.wait()
}
