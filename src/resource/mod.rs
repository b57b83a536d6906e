//! Observable resources: server-held sensor state with change fan-out.
//!
//! Every resource owns its state and its subscriber table behind a single
//! lock. A write replaces (or, for presence counters, appends to) the
//! state and pushes one [`Notification`] to every current subscriber
//! before the lock is released, so subscribers never see two writers'
//! updates interleaved and each subscriber sees writes in commit order.
//!
//! Delivery to a subscriber is a channel send; the subscriber's own task
//! (see [`crate::observe::Subscription`]) runs the callback, so a slow
//! subscriber never stalls the writer or the other subscribers.

pub mod payload;

use crate::error::{Result, VillageError};
use crate::observe::{Delivery, NotificationSink};
use crate::sensors::{PresenceLog, SensorKind, SensorState};
use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const IMMERSION_TEMP_PATH: &str = "/ImmersionTempResource";
pub const CHLORINE_PATH: &str = "/ChlorineResource";
pub const PRESENCE_PATH: &str = "/PresenceResource";

/// How long a GET response may be cached before a fresh read is warranted.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10);

pub type SubscriberId = u64;

/// One pushed update.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub path: String,
    /// Write counter of the resource at the time of the push.
    pub sequence: u64,
    pub state: SensorState,
    pub at: DateTime<Utc>,
}

/// Change acknowledgment returned by a successful write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ack {
    pub sequence: u64,
    pub state: SensorState,
    pub notified: usize,
}

enum Store {
    Scalar(SensorState),
    Presence(PresenceLog),
}

impl Store {
    fn snapshot(&self) -> SensorState {
        match self {
            Store::Scalar(state) => *state,
            Store::Presence(log) => SensorState::count(log.len()),
        }
    }
}

struct Inner {
    store: Store,
    sequence: u64,
    subscribers: BTreeMap<SubscriberId, NotificationSink>,
}

/// A network-addressable piece of sensor state.
pub struct ObservableResource {
    path: String,
    max_age: Duration,
    next_subscriber: AtomicU64,
    inner: Mutex<Inner>,
}

impl ObservableResource {
    fn with_store(path: impl Into<String>, store: Store) -> Self {
        Self {
            path: path.into(),
            max_age: DEFAULT_MAX_AGE,
            next_subscriber: AtomicU64::new(1),
            inner: Mutex::new(Inner {
                store,
                sequence: 0,
                subscribers: BTreeMap::new(),
            }),
        }
    }

    /// Create a resource holding a single scalar reading.
    pub fn scalar(path: impl Into<String>, initial: SensorState) -> Self {
        Self::with_store(path, Store::Scalar(initial))
    }

    /// Create a presence counter backed by an empty append-only log.
    pub fn presence(path: impl Into<String>) -> Self {
        Self::with_store(path, Store::Presence(PresenceLog::new()))
    }

    pub fn immersion_temperature(celsius: f64) -> Self {
        Self::scalar(IMMERSION_TEMP_PATH, SensorState::temperature(celsius))
    }

    pub fn chlorine(concentration: f64) -> Self {
        Self::scalar(CHLORINE_PATH, SensorState::concentration(concentration))
    }

    pub fn presence_counter() -> Self {
        Self::presence(PRESENCE_PATH)
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Resource name without the leading slash, as advertised in discovery.
    pub fn title(&self) -> &str {
        self.path.trim_start_matches('/')
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn kind(&self) -> SensorKind {
        self.inner.lock().store.snapshot().kind
    }

    /// Current state. Presence counters report their entry count.
    pub fn read(&self) -> SensorState {
        self.inner.lock().store.snapshot()
    }

    /// Number of writes committed so far.
    pub fn sequence(&self) -> u64 {
        self.inner.lock().sequence
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Replace the scalar state and notify every subscriber.
    ///
    /// Fails with `MalformedPayload` when the value is not finite, when the
    /// state's kind does not match the resource, or when called on a
    /// presence counter (use [`add_entry`](Self::add_entry) there).
    pub fn write(&self, state: SensorState) -> Result<Ack> {
        if !state.value.is_finite() {
            return Err(VillageError::MalformedPayload(format!(
                "{} cannot hold {}",
                self.path, state.value
            )));
        }
        let mut inner = self.inner.lock();
        match &mut inner.store {
            Store::Scalar(current) if current.kind == state.kind => *current = state,
            Store::Scalar(current) => {
                return Err(VillageError::MalformedPayload(format!(
                    "{} holds {} readings, got {}",
                    self.path, current.kind, state.kind
                )));
            }
            Store::Presence(_) => {
                return Err(VillageError::MalformedPayload(format!(
                    "{} only accepts entry identifiers",
                    self.path
                )));
            }
        }
        Ok(self.commit(&mut inner))
    }

    /// Append an identifier to a presence counter and notify every subscriber.
    pub fn add_entry(&self, id: i32) -> Result<Ack> {
        let mut inner = self.inner.lock();
        let Store::Presence(log) = &mut inner.store else {
            return Err(VillageError::MalformedPayload(format!(
                "{} does not record entries",
                self.path
            )));
        };
        let count = log.add_entry(id);
        info!("[Resource] {} added identifier {} ({} entries)", self.path, id, count);
        Ok(self.commit(&mut inner))
    }

    /// Apply an encoded write body.
    ///
    /// The body is decoded before the state is touched, so a malformed
    /// body leaves the state unchanged and produces no notifications.
    pub fn post(&self, body: &[u8]) -> Result<Ack> {
        let kind = self.kind();
        if kind == SensorKind::Count {
            let id = payload::decode_entry(body)?;
            self.add_entry(id)
        } else {
            let state = payload::decode_state(kind, body)?;
            self.write(state)
        }
    }

    /// Register a subscriber.
    ///
    /// The current state is pushed to the new subscriber right away, so a
    /// late subscriber starts from the same state a GET would return.
    /// If `sink` is already closed nothing is registered and the returned
    /// id refers to no subscriber.
    pub fn subscribe(&self, sink: NotificationSink) -> SubscriberId {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        let initial = Notification {
            path: self.path.clone(),
            sequence: inner.sequence,
            state: inner.store.snapshot(),
            at: Utc::now(),
        };
        if sink.send(Delivery::Update(initial)).is_ok() {
            inner.subscribers.insert(id, sink);
            debug!(
                "[Resource] {} subscriber {} registered ({} total)",
                self.path,
                id,
                inner.subscribers.len()
            );
        }
        id
    }

    /// Remove a subscriber. Returns whether it was still registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.inner.lock().subscribers.remove(&id).is_some();
        if removed {
            debug!("[Resource] {} subscriber {} removed", self.path, id);
        }
        removed
    }

    /// Bump the write counter and fan the new state out. Caller holds the lock.
    fn commit(&self, inner: &mut Inner) -> Ack {
        inner.sequence += 1;
        let state = inner.store.snapshot();
        let notification = Notification {
            path: self.path.clone(),
            sequence: inner.sequence,
            state,
            at: Utc::now(),
        };

        // A closed sink means the watcher went away without unsubscribing.
        inner.subscribers.retain(|id, sink| {
            let alive = sink.send(Delivery::Update(notification.clone())).is_ok();
            if !alive {
                debug!("[Resource] {} dropping abandoned subscriber {}", self.path, id);
            }
            alive
        });

        debug!(
            "[Resource] {} now {} (seq {}, {} subscribers notified)",
            self.path,
            state,
            inner.sequence,
            inner.subscribers.len()
        );

        Ack {
            sequence: inner.sequence,
            state,
            notified: inner.subscribers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(delivery) = rx.try_recv() {
            if let Delivery::Update(n) = delivery {
                out.push(n);
            }
        }
        out
    }

    #[test]
    fn test_read_without_subscribers() {
        let resource = ObservableResource::immersion_temperature(17.0);
        assert_eq!(resource.read(), SensorState::temperature(17.0));
        assert_eq!(resource.subscriber_count(), 0);
        assert_eq!(resource.title(), "ImmersionTempResource");
    }

    #[test]
    fn test_subscribe_delivers_current_state() {
        let resource = ObservableResource::chlorine(0.4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        resource.subscribe(tx);

        let received = drain(&mut rx);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].state, SensorState::concentration(0.4));
        assert_eq!(received[0].sequence, 0);
    }

    #[test]
    fn test_write_reaches_every_subscriber_once() {
        let resource = ObservableResource::immersion_temperature(17.0);
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, mut rx) = mpsc::unbounded_channel();
            resource.subscribe(tx);
            drain(&mut rx);
            receivers.push(rx);
        }

        let ack = resource.write(SensorState::temperature(21.0)).unwrap();
        assert_eq!(ack.sequence, 1);
        assert_eq!(ack.notified, 3);

        for rx in receivers.iter_mut() {
            let received = drain(rx);
            assert_eq!(received.len(), 1);
            assert_eq!(received[0].state, SensorState::temperature(21.0));
            assert_eq!(received[0].sequence, 1);
        }
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let resource = ObservableResource::immersion_temperature(17.0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = resource.subscribe(tx);
        drain(&mut rx);

        assert!(resource.unsubscribe(id));
        assert!(!resource.unsubscribe(id));

        resource.write(SensorState::temperature(18.0)).unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_closed_sink_is_dropped_on_write() {
        let resource = ObservableResource::immersion_temperature(17.0);
        let (tx, rx) = mpsc::unbounded_channel();
        resource.subscribe(tx);
        assert_eq!(resource.subscriber_count(), 1);
        drop(rx);

        let ack = resource.write(SensorState::temperature(18.0)).unwrap();
        assert_eq!(ack.notified, 0);
        assert_eq!(resource.subscriber_count(), 0);
    }

    #[test]
    fn test_malformed_post_is_a_no_op() {
        let resource = ObservableResource::immersion_temperature(17.0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        resource.subscribe(tx);
        drain(&mut rx);

        let err = resource.post(br#"{"temp": 30}"#).unwrap_err();
        assert!(matches!(err, VillageError::MalformedPayload(_)));
        assert_eq!(resource.read(), SensorState::temperature(17.0));
        assert_eq!(resource.sequence(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_write_rejects_wrong_kind() {
        let resource = ObservableResource::chlorine(1.0);
        let err = resource.write(SensorState::temperature(25.0)).unwrap_err();
        assert!(matches!(err, VillageError::MalformedPayload(_)));
        assert_eq!(resource.read(), SensorState::concentration(1.0));

        let presence = ObservableResource::presence_counter();
        assert!(presence.write(SensorState::count(3)).is_err());
        assert!(resource.add_entry(1).is_err());
    }

    #[test]
    fn test_write_rejects_non_finite_values() {
        let resource = ObservableResource::immersion_temperature(17.0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        resource.subscribe(tx);
        drain(&mut rx);

        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = resource.write(SensorState::temperature(value)).unwrap_err();
            assert!(matches!(err, VillageError::MalformedPayload(_)));
        }
        assert_eq!(resource.read(), SensorState::temperature(17.0));
        assert_eq!(resource.sequence(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_subscribe_with_closed_sink_registers_nothing() {
        let resource = ObservableResource::chlorine(1.0);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let id = resource.subscribe(tx);
        assert_eq!(resource.subscriber_count(), 0);
        assert!(!resource.unsubscribe(id));
    }

    #[test]
    fn test_presence_count_matches_successful_posts() {
        let resource = ObservableResource::presence_counter();
        let (tx, mut rx) = mpsc::unbounded_channel();
        resource.subscribe(tx);

        let bodies: [&[u8]; 6] = [b"5", b"6", b"oops", b"7", b"", b"5"];
        let mut successes = 0;
        let mut last = 0.0;
        for body in bodies {
            if resource.post(body).is_ok() {
                successes += 1;
            }
            let count = resource.read().value;
            assert!(count >= last);
            last = count;
        }

        assert_eq!(successes, 4);
        assert_eq!(resource.read(), SensorState::count(4));
        let counts: Vec<f64> = drain(&mut rx).iter().map(|n| n.state.value).collect();
        assert_eq!(counts, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_concurrent_writes_are_serialized() {
        use std::sync::Arc;

        let resource = Arc::new(ObservableResource::immersion_temperature(0.0));
        let (tx, mut rx) = mpsc::unbounded_channel();
        resource.subscribe(tx);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let resource = resource.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        resource
                            .write(SensorState::temperature((t * 100 + i) as f64))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let sequences: Vec<u64> = drain(&mut rx).iter().map(|n| n.sequence).collect();
        assert_eq!(sequences, (0..=200).collect::<Vec<u64>>());
        assert_eq!(resource.sequence(), 200);
    }
}
