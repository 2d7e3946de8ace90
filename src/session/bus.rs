//! Subscriber registry and event fan-out
//!
//! The bus keeps non-owning (`Weak`) references to subscribers and delivers
//! three kinds of events: new measurements, protocol errors, and the end of a
//! session. Publishing takes a copy of the live subscriber set under the lock
//! and calls them after releasing it, so a callback may subscribe, unsubscribe
//! or read the store without deadlocking.
//!
//! Callbacks run synchronously on the publishing thread (the session's reader
//! thread). Consumers that need to do real work should use
//! [`ChannelSubscriber`], which hands events to a crossbeam queue instead.

use crate::protocol::ProtocolError;
use crate::types::{FailureReason, Measurement};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

/// Consumer of session events
///
/// Implementations must be cheap: they run on the thread that reads the
/// helper's output, and the next line is not read until they return.
#[cfg_attr(test, mockall::automock)]
pub trait Subscriber: Send + Sync {
    /// A measurement was appended to the store
    fn on_measurement(&self, measurement: Measurement);

    /// The helper produced a line that is not a measurement
    fn on_protocol_error(&self, _error: &ProtocolError) {}

    /// The session ended; `None` means a clean stop
    fn on_session_ended(&self, reason: Option<FailureReason>);
}

/// Handle returned by [`NotificationBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Registry of subscribers with copy-on-publish delivery
#[derive(Default)]
pub struct NotificationBus {
    subscribers: Mutex<Vec<(SubscriptionId, Weak<dyn Subscriber>)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("subscribers", &self.len())
            .finish()
    }
}

impl NotificationBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber without taking ownership of it
    pub fn subscribe(&self, subscriber: &Arc<dyn Subscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::downgrade(subscriber)));
        id
    }

    /// Remove a subscriber by id; returns false if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() < before
    }

    /// Remove every registration of this subscriber instance
    pub fn unsubscribe_subscriber(&self, subscriber: &Arc<dyn Subscriber>) -> bool {
        let target = Arc::as_ptr(subscriber) as *const ();
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(_, weak)| weak.as_ptr() as *const () != target);
        subscribers.len() < before
    }

    /// Number of live subscribers
    pub fn len(&self) -> usize {
        self.lock()
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    /// Check if nobody is listening
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a measurement to every subscriber
    pub fn publish_measurement(&self, measurement: Measurement) {
        for subscriber in self.snapshot() {
            subscriber.on_measurement(measurement);
        }
    }

    /// Deliver a protocol error to every subscriber
    pub fn publish_protocol_error(&self, error: &ProtocolError) {
        for subscriber in self.snapshot() {
            subscriber.on_protocol_error(error);
        }
    }

    /// Deliver the end-of-session event to every subscriber
    pub fn publish_session_ended(&self, reason: Option<FailureReason>) {
        for subscriber in self.snapshot() {
            subscriber.on_session_ended(reason.clone());
        }
    }

    /// Upgrade the live subscribers and prune the dropped ones
    fn snapshot(&self) -> Vec<Arc<dyn Subscriber>> {
        let mut subscribers = self.lock();
        subscribers.retain(|(_, weak)| weak.strong_count() > 0);
        subscribers
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Weak<dyn Subscriber>)>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Event forwarded by a [`ChannelSubscriber`]
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// New measurement
    Measurement(Measurement),
    /// Protocol error from the helper
    ProtocolError(ProtocolError),
    /// Session ended; `None` means a clean stop
    SessionEnded(Option<FailureReason>),
}

/// Subscriber that forwards events to a crossbeam channel
///
/// Sending never blocks the reader thread: when a bounded queue is full the
/// event is dropped and counted.
pub struct ChannelSubscriber {
    sender: Sender<SessionEvent>,
    dropped: AtomicU64,
}

impl ChannelSubscriber {
    /// Create a subscriber with an unbounded queue
    pub fn unbounded() -> (Arc<Self>, Receiver<SessionEvent>) {
        let (tx, rx) = unbounded();
        (Self::with_sender(tx), rx)
    }

    /// Create a subscriber with a bounded queue
    pub fn bounded(capacity: usize) -> (Arc<Self>, Receiver<SessionEvent>) {
        let (tx, rx) = bounded(capacity);
        (Self::with_sender(tx), rx)
    }

    fn with_sender(sender: Sender<SessionEvent>) -> Arc<Self> {
        Arc::new(Self {
            sender,
            dropped: AtomicU64::new(0),
        })
    }

    /// Number of events dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn forward(&self, event: SessionEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            // Receiver gone; nothing left to notify
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl Subscriber for ChannelSubscriber {
    fn on_measurement(&self, measurement: Measurement) {
        self.forward(SessionEvent::Measurement(measurement));
    }

    fn on_protocol_error(&self, error: &ProtocolError) {
        self.forward(SessionEvent::ProtocolError(error.clone()));
    }

    fn on_session_ended(&self, reason: Option<FailureReason>) {
        self.forward(SessionEvent::SessionEnded(reason));
    }
}

/// Receive all pending events without blocking
pub fn drain(receiver: &Receiver<SessionEvent>) -> Vec<SessionEvent> {
    receiver.try_iter().collect()
}

/// Block until the session-ended event arrives, collecting everything before it
///
/// Returns `None` if the timeout expires or the sender side is gone first.
pub fn collect_until_ended(
    receiver: &Receiver<SessionEvent>,
    timeout: Duration,
) -> Option<(Vec<SessionEvent>, Option<FailureReason>)> {
    let deadline = std::time::Instant::now().checked_add(timeout);
    let mut events = Vec::new();
    loop {
        let remaining = match deadline {
            Some(deadline) => deadline.saturating_duration_since(std::time::Instant::now()),
            None => timeout,
        };
        match receiver.recv_timeout(remaining) {
            Ok(SessionEvent::SessionEnded(reason)) => return Some((events, reason)),
            Ok(event) => events.push(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}
