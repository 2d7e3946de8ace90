//! Liveness watchdog
//!
//! A background thread that wakes up every `interval`, compares the time the
//! helper was last heard from against the liveness deadline and reports a
//! stall once. The check at fire time goes through [`LivenessSource`], so a
//! session that already left `Streaming` is never reported as stalled.

use crossbeam_channel::{bounded, select, tick, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default silence tolerated before a session is declared stalled
pub const DEFAULT_LIVENESS_DEADLINE: Duration = Duration::from_millis(5000);

/// Default interval between liveness checks
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(1000);

/// What the watchdog observes and notifies
pub trait LivenessSource: Send + Sync {
    /// When the producer was last heard from; `None` once the session is no longer streaming
    fn last_seen(&self) -> Option<Instant>;

    /// Called once when the silence exceeds the deadline
    ///
    /// Returns false if the session had already moved on and the stall was ignored.
    fn on_stalled(&self, silence: Duration) -> bool;
}

/// Handle to a running watchdog thread
#[derive(Debug)]
pub struct TimeoutWatchdog {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TimeoutWatchdog {
    /// Start watching `source`
    pub fn spawn(
        source: Arc<dyn LivenessSource>,
        deadline: Duration,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("smartscale-watchdog".to_string())
            .spawn(move || {
                let ticker = tick(interval);
                loop {
                    select! {
                        recv(cancel_rx) -> _ => {
                            tracing::trace!("Watchdog cancelled");
                            return;
                        }
                        recv(ticker) -> _ => {
                            let Some(last_seen) = source.last_seen() else {
                                tracing::trace!("Session left streaming, watchdog exiting");
                                return;
                            };
                            let silence = last_seen.elapsed();
                            if silence > deadline {
                                tracing::warn!("No data from helper for {:?}", silence);
                                if !source.on_stalled(silence) {
                                    tracing::debug!("Stall ignored, session already ending");
                                }
                                return;
                            }
                        }
                    }
                }
            })?;

        Ok(Self {
            cancel: Some(cancel_tx),
            handle: Some(handle),
        })
    }

    /// Stop the watchdog and wait for its thread
    ///
    /// Safe to call from the watchdog thread itself (e.g. from `on_stalled`);
    /// the join is skipped in that case.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("Watchdog thread panicked");
            }
        }
    }

    /// Signal the watchdog to stop without waiting for its thread
    ///
    /// For callers the watchdog may itself be waiting on, such as the reader
    /// thread while a notification is in flight. A watchdog already inside
    /// `on_stalled` finishes that call and then exits.
    pub fn detach(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.try_send(());
        }
        self.handle = None;
    }

    /// Check if the watchdog thread is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for TimeoutWatchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}
