//! Acquisition session
//!
//! An [`AcquisitionSession`] supervises one run of the acquisition helper for
//! one target device: it launches the producer, decodes its output on a
//! reader thread, watches for silence with a [`TimeoutWatchdog`], appends
//! measurements to the [`RecordStore`] and tells subscribers when the run is
//! over.
//!
//! # State machine
//!
//! ```text
//! Idle --start--> Connecting --launched--> Streaming --eof, exit 0 / stop--> Stopping --> Stopped
//!                     |                        |
//!                     +--launch failed--> Failed(spawn)
//!                                              +--silence / exit != 0 / read error--> Stopping --> Failed
//! ```
//!
//! `Stopped` and `Failed` are final for an instance; starting again needs a
//! new session.
//!
//! # Threads
//!
//! - `smartscale-reader` blocks on the producer's output and publishes events;
//!   all subscriber callbacks run here (or on the thread that ends the session
//!   for the session-ended event).
//! - `smartscale-watchdog` ticks every `watchdog_interval_ms`.
//! - The caller's thread drives `start`/`stop`/`status`.
//!
//! Every mutable session field lives in one `SessionShared` behind a single
//! mutex. No lock is held while subscribers run or while waiting on the
//! producer.
//!
//! # Example
//!
//! ```ignore
//! use smartscale::producer::{CommandSpec, ProcessProducer};
//! use smartscale::session::{AcquisitionSession, ChannelSubscriber};
//! use smartscale::store::RecordStore;
//!
//! let producer = ProcessProducer::new(CommandSpec::new("python3").arg("-u").arg("retrieve_data.py"));
//! let session = AcquisitionSession::new(Arc::new(producer), RecordStore::new(), Default::default());
//! let (subscriber, events) = ChannelSubscriber::unbounded();
//! session.subscribe(&(subscriber.clone() as Arc<dyn Subscriber>));
//! session.start("AA:BB:CC:DD:EE:FF")?;
//! ```

pub mod bus;
pub mod watchdog;

pub use bus::{
    collect_until_ended, drain, ChannelSubscriber, NotificationBus, SessionEvent, Subscriber,
    SubscriptionId,
};
pub use watchdog::{
    LivenessSource, TimeoutWatchdog, DEFAULT_CHECK_INTERVAL, DEFAULT_LIVENESS_DEADLINE,
};

use crate::config::SessionConfig;
use crate::error::{Result, ScaleError};
use crate::producer::{self, LineSource, ProcessControl, ProcessExit, Producer, ProducerHandle};
use crate::protocol::decode_line;
use crate::store::RecordStore;
use crate::types::{FailureReason, SessionState, SessionStats};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    lines_received: u64,
    measurements: u64,
    protocol_errors: u64,
}

/// All mutable per-session state, guarded by one mutex
#[derive(Default)]
struct SessionShared {
    state: SessionState,
    target: Option<String>,
    control: Option<Box<dyn ProcessControl>>,
    last_seen: Option<Instant>,
    stop_requested: bool,
    /// Set once the final state is reached; guards the single end notification
    ended: bool,
    counters: Counters,
    exit: Option<ProcessExit>,
    reader_thread: Option<ThreadId>,
    /// Disconnects when the reader thread returns
    reader_done: Option<Receiver<()>>,
    /// End notification raised on the reader thread, published once its current event is out
    deferred_end: Option<Option<FailureReason>>,
}

#[derive(Default)]
struct Workers {
    reader: Option<JoinHandle<()>>,
    watchdog: Option<TimeoutWatchdog>,
}

struct SessionInner {
    shared: Mutex<SessionShared>,
    /// Signalled when the session reaches a final state
    settled: Condvar,
    workers: Mutex<Workers>,
    producer: Arc<dyn Producer>,
    store: RecordStore,
    config: SessionConfig,
}

/// One supervised run of the acquisition helper
///
/// Dropping the session stops it: the helper is terminated and the worker
/// threads are torn down. Callers that share the session across threads
/// should still call [`stop`](Self::stop) explicitly before letting go.
pub struct AcquisitionSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for AcquisitionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionSession")
            .field("state", &self.status())
            .field("target", &self.target())
            .finish()
    }
}

impl AcquisitionSession {
    /// Create an idle session that will append to `store`
    pub fn new(producer: Arc<dyn Producer>, store: RecordStore, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                shared: Mutex::new(SessionShared::default()),
                settled: Condvar::new(),
                workers: Mutex::new(Workers::default()),
                producer,
                store,
                config,
            }),
        }
    }

    /// Launch the producer for `target` and start streaming
    ///
    /// Fails with `AlreadyActive` unless the session is `Idle`, with
    /// `InvalidTarget` for an empty or malformed identifier, and with
    /// `SpawnFailure` if the producer cannot be launched. Everything that
    /// happens after streaming begins is reported through subscribers only.
    pub fn start(&self, target: &str) -> Result<()> {
        let target = {
            let mut shared = self.inner.lock_shared();
            if shared.state != SessionState::Idle {
                return Err(ScaleError::AlreadyActive(shared.state.clone()));
            }
            let target = validate_target(target)?;
            shared.state = SessionState::Connecting;
            shared.target = Some(target.clone());
            target
        };

        tracing::info!(
            "Connecting to {} via {}",
            target,
            self.inner.producer.describe()
        );
        let ProducerHandle { lines, control } = match self.inner.producer.launch(&target) {
            Ok(handle) => handle,
            Err(e) => {
                let message = match e {
                    ScaleError::SpawnFailure(message) => message,
                    other => other.to_string(),
                };
                tracing::error!("Failed to launch helper: {}", message);
                self.inner
                    .settle(SessionState::Failed(FailureReason::Spawn(message.clone())), false);
                return Err(ScaleError::SpawnFailure(message));
            }
        };

        // Workers are registered before anyone else can look for them
        let mut workers = self.inner.lock_workers();
        let done_tx = {
            let mut shared = self.inner.lock_shared();
            if shared.stop_requested {
                drop(shared);
                drop(workers);
                tracing::info!("Stop requested while connecting, shutting helper down");
                drop(lines);
                self.inner.reap(control);
                self.inner.settle(SessionState::Stopped, true);
                return Ok(());
            }
            let (done_tx, done_rx) = bounded::<()>(0);
            shared.state = SessionState::Streaming;
            shared.last_seen = Some(Instant::now());
            shared.control = Some(control);
            shared.reader_done = Some(done_rx);
            done_tx
        };

        let source: Arc<dyn LivenessSource> = self.inner.clone();
        match TimeoutWatchdog::spawn(
            source,
            self.inner.config.liveness_deadline(),
            self.inner.config.watchdog_interval(),
        ) {
            Ok(watchdog) => workers.watchdog = Some(watchdog),
            Err(e) => {
                drop(workers);
                return Err(self.abort_start(format!("failed to spawn watchdog: {}", e)));
            }
        }

        let inner = self.inner.clone();
        let reader = thread::Builder::new()
            .name("smartscale-reader".to_string())
            .spawn(move || inner.run_reader(lines, done_tx));
        match reader {
            Ok(handle) => workers.reader = Some(handle),
            Err(e) => {
                drop(workers);
                return Err(self.abort_start(format!("failed to spawn reader: {}", e)));
            }
        }

        tracing::info!("Streaming from {}", target);
        Ok(())
    }

    /// Stop the session; idempotent and callable from any thread
    ///
    /// The helper is asked to terminate and killed if it is still running
    /// after the grace period. A no-op on an idle session.
    pub fn stop(&self) {
        let control = {
            let mut shared = self.inner.lock_shared();
            let state = shared.state.clone();
            match state {
                SessionState::Idle => {
                    tracing::debug!("Stop on idle session ignored");
                    return;
                }
                SessionState::Connecting => {
                    shared.stop_requested = true;
                    shared.state = SessionState::Stopping;
                    drop(shared);
                    tracing::info!("Stopping session while connecting");
                    self.inner.wait_settled();
                    return;
                }
                SessionState::Streaming => {
                    shared.stop_requested = true;
                    shared.state = SessionState::Stopping;
                    shared.control.take()
                }
                SessionState::Stopping => {
                    drop(shared);
                    self.inner.wait_settled();
                    self.inner.join_workers();
                    return;
                }
                SessionState::Stopped | SessionState::Failed(_) => {
                    drop(shared);
                    self.inner.join_workers();
                    return;
                }
            }
        };

        tracing::info!("Stopping session");
        self.inner.cancel_watchdog();
        if let Some(control) = control {
            self.inner.reap(control);
        }
        self.inner.await_reader();
        self.inner.settle(SessionState::Stopped, true);
        self.inner.join_workers();
    }

    /// Current state
    pub fn status(&self) -> SessionState {
        self.inner.lock_shared().state.clone()
    }

    /// Target passed to the last accepted `start`
    pub fn target(&self) -> Option<String> {
        self.inner.lock_shared().target.clone()
    }

    /// Counters collected by the reader
    pub fn stats(&self) -> SessionStats {
        let shared = self.inner.lock_shared();
        SessionStats {
            lines_received: shared.counters.lines_received,
            measurements: shared.counters.measurements,
            protocol_errors: shared.counters.protocol_errors,
            last_seen_age: shared.last_seen.map(|t| t.elapsed()),
        }
    }

    /// How the helper process ended, once it has
    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.inner.lock_shared().exit
    }

    /// Register a subscriber (held weakly)
    pub fn subscribe(&self, subscriber: &Arc<dyn Subscriber>) -> SubscriptionId {
        self.inner.store.subscribe(subscriber)
    }

    /// Remove a subscriber by id
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.store.unsubscribe(id)
    }

    /// Remove a subscriber by instance
    pub fn unsubscribe_subscriber(&self, subscriber: &Arc<dyn Subscriber>) -> bool {
        self.inner.store.unsubscribe_subscriber(subscriber)
    }

    /// The store measurements are appended to
    pub fn store(&self) -> &RecordStore {
        &self.inner.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Block until the session reaches a final state or `timeout` elapses
    ///
    /// Returns the state observed last.
    pub fn wait_until_settled(&self, timeout: Duration) -> SessionState {
        self.inner.wait_settled_for(timeout)
    }

    /// Undo a half-finished start: kill the helper and fail with `Spawn`
    fn abort_start(&self, message: String) -> ScaleError {
        tracing::error!("Aborting session start: {}", message);
        let control = {
            let mut shared = self.inner.lock_shared();
            shared.state = SessionState::Stopping;
            shared.control.take()
        };
        self.inner.cancel_watchdog();
        if let Some(control) = control {
            self.inner.reap(control);
        }
        self.inner
            .settle(SessionState::Failed(FailureReason::Spawn(message.clone())), false);
        self.inner.join_workers();
        ScaleError::SpawnFailure(message)
    }
}

impl Drop for AcquisitionSession {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SessionInner {
    fn lock_shared(&self) -> MutexGuard<'_, SessionShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_workers(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn grace(&self) -> Duration {
        self.config.grace_period()
    }

    fn run_reader(self: Arc<Self>, mut lines: Box<dyn LineSource>, _done: Sender<()>) {
        self.lock_shared().reader_thread = Some(thread::current().id());
        tracing::debug!("Reader started");

        loop {
            match lines.read_line() {
                Ok(Some(line)) => {
                    let streaming = self.handle_line(&line);
                    self.flush_deferred_end();
                    if !streaming {
                        break;
                    }
                }
                Ok(None) => {
                    self.on_stream_closed();
                    break;
                }
                Err(e) => {
                    self.on_stream_failed(e.to_string());
                    break;
                }
            }
        }

        self.flush_deferred_end();
        tracing::debug!("Reader finished");
    }

    fn flush_deferred_end(&self) {
        let pending = self.lock_shared().deferred_end.take();
        if let Some(reason) = pending {
            self.store.publish_session_ended(reason);
        }
    }

    /// Decode and publish one line; false once the session stopped streaming
    fn handle_line(&self, line: &str) -> bool {
        let blank = line.trim().is_empty();
        let decoded = (!blank).then(|| decode_line(line));

        {
            let mut shared = self.lock_shared();
            if shared.state != SessionState::Streaming {
                return false;
            }
            shared.last_seen = Some(Instant::now());
            shared.counters.lines_received += 1;
            match &decoded {
                Some(Ok(_)) => shared.counters.measurements += 1,
                Some(Err(_)) => shared.counters.protocol_errors += 1,
                None => {}
            }
        }

        match decoded {
            Some(Ok(measurement)) => {
                tracing::trace!(
                    "Measurement {} kg at {}",
                    measurement.weight_kg(),
                    measurement.timestamp_millis()
                );
                self.store.append(measurement);
            }
            Some(Err(error)) => {
                match &error.raw {
                    Some(raw) if !error.is_reported() => {
                        tracing::warn!("Helper sent a malformed line: {:?}", raw)
                    }
                    _ => tracing::warn!("Helper reported an error: {}", error.message),
                }
                self.store.publish_protocol_error(&error);
            }
            None => tracing::trace!("Skipping blank line"),
        }
        true
    }

    /// The producer closed its output while streaming
    fn on_stream_closed(&self) {
        let control = {
            let mut shared = self.lock_shared();
            if shared.state != SessionState::Streaming {
                return;
            }
            shared.state = SessionState::Stopping;
            shared.control.take()
        };

        tracing::info!("Helper closed its output");
        let Some(mut control) = control else {
            self.settle(SessionState::Stopped, true);
            return;
        };

        let exit = match producer::wait_for_exit(control.as_mut(), self.grace()) {
            Ok(Some(exit)) => Ok(exit),
            Ok(None) => {
                tracing::warn!("Helper closed its output but is still running");
                producer::shutdown(control.as_mut(), self.grace())
            }
            Err(e) => Err(e),
        };

        let state = match exit {
            Ok(exit) => {
                self.lock_shared().exit = Some(exit);
                match exit {
                    ProcessExit::Code(0) => SessionState::Stopped,
                    ProcessExit::Code(code) => {
                        SessionState::Failed(FailureReason::AbnormalExit(code))
                    }
                    ProcessExit::Signal => SessionState::Failed(FailureReason::Terminated),
                }
            }
            Err(e) => SessionState::Failed(FailureReason::Stream(e.to_string())),
        };
        self.settle(state, true);
    }

    /// Reading the producer's output failed while streaming
    fn on_stream_failed(&self, message: String) {
        let control = {
            let mut shared = self.lock_shared();
            if shared.state != SessionState::Streaming {
                return;
            }
            shared.state = SessionState::Stopping;
            shared.control.take()
        };

        tracing::error!("Reading helper output failed: {}", message);
        if let Some(control) = control {
            self.reap(control);
        }
        self.settle(SessionState::Failed(FailureReason::Stream(message)), true);
    }

    /// Terminate the producer and record how it ended
    fn reap(&self, mut control: Box<dyn ProcessControl>) {
        match producer::shutdown(control.as_mut(), self.grace()) {
            Ok(exit) => {
                tracing::debug!("Helper ended ({})", exit);
                self.lock_shared().exit = Some(exit);
            }
            Err(e) => tracing::warn!("Failed to shut helper down: {}", e),
        }
    }

    /// Move to a final state, at most once; optionally notify subscribers
    ///
    /// On the reader thread the notification is deferred until the reader is
    /// done with its current event, since that event may still be publishing.
    fn settle(&self, state: SessionState, notify: bool) {
        let (reason, deferred) = {
            let mut shared = self.lock_shared();
            if shared.ended {
                return;
            }
            shared.ended = true;
            shared.state = state.clone();
            shared.control = None;
            self.settled.notify_all();

            let reason = state.failure().cloned();
            let deferred = notify && shared.reader_thread == Some(thread::current().id());
            if deferred {
                shared.deferred_end = Some(reason.clone());
            }
            (reason, deferred)
        };

        match &reason {
            None => tracing::info!("Session stopped"),
            Some(reason) => tracing::warn!("Session failed: {}", reason),
        }
        if notify && !deferred {
            self.store.publish_session_ended(reason);
        }
    }

    fn wait_settled(&self) -> SessionState {
        self.wait_settled_for(
            self.grace()
                .saturating_mul(2)
                .saturating_add(Duration::from_millis(500)),
        )
    }

    fn wait_settled_for(&self, timeout: Duration) -> SessionState {
        let shared = self.lock_shared();
        if shared.reader_thread == Some(thread::current().id()) {
            return shared.state.clone();
        }
        let (shared, result) = self
            .settled
            .wait_timeout_while(shared, timeout, |s| !s.ended && s.state != SessionState::Idle)
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() {
            tracing::debug!("Session did not settle within {:?}", timeout);
        }
        shared.state.clone()
    }

    /// Wait (bounded) for the reader to return; false if it is still running
    fn await_reader(&self) -> bool {
        let done = {
            let shared = self.lock_shared();
            if shared.reader_thread == Some(thread::current().id()) {
                return false;
            }
            shared.reader_done.clone()
        };
        match done {
            None => true,
            Some(done) => match done.recv_timeout(self.grace()) {
                Err(RecvTimeoutError::Disconnected) | Ok(()) => true,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!("Reader still blocked after {:?}", self.grace());
                    false
                }
            },
        }
    }

    /// Stop the watchdog; on the reader thread it is detached, not joined
    ///
    /// A stalled watchdog may be blocked publishing behind the notification
    /// the reader is currently delivering.
    fn cancel_watchdog(&self) {
        let watchdog = self.lock_workers().watchdog.take();
        let Some(mut watchdog) = watchdog else {
            return;
        };
        if self.on_reader_thread() {
            watchdog.detach();
        } else {
            watchdog.cancel();
        }
    }

    fn on_reader_thread(&self) -> bool {
        self.lock_shared().reader_thread == Some(thread::current().id())
    }

    /// Join finished workers; a reader that is still blocked is detached
    fn join_workers(&self) {
        self.cancel_watchdog();

        let reader = self.lock_workers().reader.take();
        let Some(reader) = reader else {
            return;
        };
        if reader.thread().id() == thread::current().id() {
            return;
        }
        if self.await_reader() {
            if reader.join().is_err() {
                tracing::error!("Reader thread panicked");
            }
        } else {
            tracing::warn!("Detaching reader thread");
        }
    }
}

impl LivenessSource for SessionInner {
    fn last_seen(&self) -> Option<Instant> {
        let shared = self.lock_shared();
        if shared.state == SessionState::Streaming {
            shared.last_seen
        } else {
            None
        }
    }

    fn on_stalled(&self, silence: Duration) -> bool {
        let control = {
            let mut shared = self.lock_shared();
            if shared.state != SessionState::Streaming {
                return false;
            }
            shared.state = SessionState::Stopping;
            shared.control.take()
        };

        tracing::warn!("Helper silent for {:?}, terminating it", silence);
        if let Some(control) = control {
            self.reap(control);
        }
        self.await_reader();
        self.settle(SessionState::Failed(FailureReason::Timeout), true);
        true
    }
}

/// Check a device identifier and return it trimmed
fn validate_target(target: &str) -> Result<String> {
    let trimmed = target.trim();
    if trimmed.is_empty() || trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ScaleError::InvalidTarget(target.to_string()));
    }
    Ok(trimmed.to_string())
}
