//! In-memory measurement log
//!
//! [`RecordStore`] is the ordered, append-only log that backs the table view,
//! the live chart and the CSV exporter. It is a cheap `Clone` handle: every
//! clone refers to the same records and the same subscriber registry.
//!
//! # Locking
//!
//! Two locks are involved:
//!
//! - the ordering lock serializes appends and clears end to end (push +
//!   publish), so subscribers observe exactly the insertion order even with
//!   several appending threads, and a clear never lands between a push and
//!   its notification. It is held while subscribers run;
//! - the records lock guards the vector itself and is never held while
//!   subscribers run.
//!
//! A subscriber may therefore call [`RecordStore::snapshot`] or
//! [`RecordStore::clear`] from its callback, but must not call
//! [`RecordStore::append`] on the same store.

use crate::protocol::ProtocolError;
use crate::session::bus::{NotificationBus, Subscriber, SubscriptionId};
use crate::types::{FailureReason, Measurement};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct StoreInner {
    records: Mutex<Vec<Measurement>>,
    ordering: Mutex<()>,
    /// Thread currently holding the ordering lock
    publisher: Mutex<Option<ThreadId>>,
    bus: NotificationBus,
}

/// Ordering lock plus the identity of its holder
struct OrderGuard<'a> {
    _order: MutexGuard<'a, ()>,
    publisher: &'a Mutex<Option<ThreadId>>,
}

impl Drop for OrderGuard<'_> {
    fn drop(&mut self) {
        *lock(self.publisher) = None;
    }
}

/// Thread-safe ordered log of measurements
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    inner: Arc<StoreInner>,
}

impl RecordStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a measurement and notify subscribers
    pub fn append(&self, measurement: Measurement) {
        let _order = self.order();
        lock(&self.inner.records).push(measurement);
        self.inner.bus.publish_measurement(measurement);
    }

    /// Copy of all records in insertion order
    pub fn snapshot(&self) -> Vec<Measurement> {
        lock(&self.inner.records).clone()
    }

    /// Remove all records; already delivered notifications are unaffected
    ///
    /// Waits for an in-flight append to finish notifying, unless called from
    /// one of its callbacks.
    pub fn clear(&self) {
        let _order = (!self.in_callback()).then(|| self.order());
        let mut records = lock(&self.inner.records);
        let removed = records.len();
        records.clear();
        tracing::debug!("Cleared {} records", removed);
    }

    /// Number of records
    pub fn len(&self) -> usize {
        lock(&self.inner.records).len()
    }

    /// Check if the store holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent record
    pub fn last(&self) -> Option<Measurement> {
        lock(&self.inner.records).last().copied()
    }

    /// Register a subscriber (held weakly)
    pub fn subscribe(&self, subscriber: &Arc<dyn Subscriber>) -> SubscriptionId {
        self.inner.bus.subscribe(subscriber)
    }

    /// Remove a subscriber by id
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(id)
    }

    /// Remove a subscriber by instance
    pub fn unsubscribe_subscriber(&self, subscriber: &Arc<dyn Subscriber>) -> bool {
        self.inner.bus.unsubscribe_subscriber(subscriber)
    }

    /// Forward a protocol error to subscribers, ordered with appends
    pub fn publish_protocol_error(&self, error: &ProtocolError) {
        let _order = self.order();
        self.inner.bus.publish_protocol_error(error);
    }

    /// Forward the end of a session to subscribers, ordered with appends
    pub fn publish_session_ended(&self, reason: Option<FailureReason>) {
        let _order = self.order();
        self.inner.bus.publish_session_ended(reason);
    }

    /// The subscriber registry shared by every clone of this store
    pub fn bus(&self) -> &NotificationBus {
        &self.inner.bus
    }

    fn order(&self) -> OrderGuard<'_> {
        let order = lock(&self.inner.ordering);
        *lock(&self.inner.publisher) = Some(thread::current().id());
        OrderGuard {
            _order: order,
            publisher: &self.inner.publisher,
        }
    }

    /// Check if the calling thread is inside a notification from this store
    fn in_callback(&self) -> bool {
        *lock(&self.inner.publisher) == Some(thread::current().id())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::bus::{drain, ChannelSubscriber, SessionEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn sample(i: i64) -> Measurement {
        Measurement::new(1_700_000_000_000 + i * 1000, 70.0 + i as f64 * 0.01).unwrap()
    }

    #[test]
    fn test_append_then_snapshot() {
        let store = RecordStore::new();
        for i in 0..5 {
            store.append(sample(i));
            assert_eq!(store.snapshot().last(), Some(&sample(i)));
        }
        assert_eq!(store.len(), 5);
        assert_eq!(store.last(), Some(sample(4)));
    }

    #[test]
    fn test_clear_empties_store() {
        let store = RecordStore::new();
        store.append(sample(1));
        store.clear();
        assert!(store.snapshot().is_empty());
        assert!(store.is_empty());
        assert_eq!(store.last(), None);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = RecordStore::new();
        store.append(sample(1));
        let mut snap = store.snapshot();
        snap.clear();
        snap.push(sample(9));
        assert_eq!(store.snapshot(), vec![sample(1)]);
    }

    #[test]
    fn test_clones_share_records() {
        let store = RecordStore::new();
        let other = store.clone();
        other.append(sample(1));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_subscriber_receives_every_append() {
        let store = RecordStore::new();
        let (subscriber, rx) = ChannelSubscriber::unbounded();
        let as_dyn: Arc<dyn Subscriber> = subscriber;
        store.subscribe(&as_dyn);

        for i in 0..100 {
            store.append(sample(i));
        }

        let received: Vec<_> = drain(&rx)
            .into_iter()
            .map(|event| match event {
                SessionEvent::Measurement(m) => m,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(received, store.snapshot());
    }

    #[test]
    fn test_clear_does_not_retract_notifications() {
        let store = RecordStore::new();
        let (subscriber, rx) = ChannelSubscriber::unbounded();
        let as_dyn: Arc<dyn Subscriber> = subscriber;
        store.subscribe(&as_dyn);

        store.append(sample(1));
        store.clear();
        assert_eq!(drain(&rx).len(), 1);
    }

    #[test]
    fn test_concurrent_appenders_deliver_in_store_order() {
        let store = RecordStore::new();
        let (subscriber, rx) = ChannelSubscriber::unbounded();
        let as_dyn: Arc<dyn Subscriber> = subscriber;
        store.subscribe(&as_dyn);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        store.append(sample(t * 1000 + i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let delivered: Vec<_> = drain(&rx)
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::Measurement(m) => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(delivered.len(), 1000);
        assert_eq!(delivered, store.snapshot());
    }

    #[test]
    fn test_concurrent_append_and_clear() {
        let store = RecordStore::new();
        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..1000 {
                    store.append(sample(i));
                }
            })
        };
        for _ in 0..50 {
            store.clear();
            let snap = store.snapshot();
            assert!(snap.windows(2).all(|w| w[0].timestamp_millis() < w[1].timestamp_millis()));
        }
        writer.join().unwrap();
        assert!(store.len() <= 1000);
    }

    struct SnapshotReader {
        store: RecordStore,
        seen: Mutex<Vec<usize>>,
    }

    impl Subscriber for SnapshotReader {
        fn on_measurement(&self, _measurement: Measurement) {
            self.seen.lock().unwrap().push(self.store.snapshot().len());
        }

        fn on_session_ended(&self, _reason: Option<FailureReason>) {}
    }

    #[test]
    fn test_subscriber_may_read_snapshot() {
        let store = RecordStore::new();
        let reader = Arc::new(SnapshotReader {
            store: store.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let as_dyn: Arc<dyn Subscriber> = reader.clone();
        store.subscribe(&as_dyn);

        store.append(sample(1));
        store.append(sample(2));
        assert_eq!(*reader.seen.lock().unwrap(), vec![1, 2]);
    }

    /// Checks that each notified record is still in the store
    struct PresenceChecker {
        store: RecordStore,
        missing: AtomicUsize,
    }

    impl Subscriber for PresenceChecker {
        fn on_measurement(&self, measurement: Measurement) {
            if !self.store.snapshot().contains(&measurement) {
                self.missing.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn on_session_ended(&self, _reason: Option<FailureReason>) {}
    }

    #[test]
    fn test_clear_never_splits_append_from_its_notification() {
        let store = RecordStore::new();
        let checker = Arc::new(PresenceChecker {
            store: store.clone(),
            missing: AtomicUsize::new(0),
        });
        let as_dyn: Arc<dyn Subscriber> = checker.clone();
        store.subscribe(&as_dyn);

        let clearer = {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..2000 {
                    store.clear();
                }
            })
        };
        for i in 0..2000 {
            store.append(sample(i));
        }
        clearer.join().unwrap();

        assert_eq!(checker.missing.load(Ordering::SeqCst), 0);
    }

    struct ClearOnMeasurement {
        store: RecordStore,
    }

    impl Subscriber for ClearOnMeasurement {
        fn on_measurement(&self, _measurement: Measurement) {
            self.store.clear();
        }

        fn on_session_ended(&self, _reason: Option<FailureReason>) {}
    }

    #[test]
    fn test_subscriber_may_clear() {
        let store = RecordStore::new();
        let clearer: Arc<dyn Subscriber> = Arc::new(ClearOnMeasurement {
            store: store.clone(),
        });
        store.subscribe(&clearer);

        store.append(sample(1));
        assert!(store.is_empty());

        // The ordering lock is free again for other threads
        let other = store.clone();
        thread::spawn(move || other.clear()).join().unwrap();
    }
}
