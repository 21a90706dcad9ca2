// src/core/events/mod.rs

//! The progress event bus: an in-process, per-user, multi-subscriber
//! broadcast of lab/file-server spawn progress, backed by a bounded
//! ring buffer so that SSE clients can resume from `Last-Event-ID`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

pub mod purger;

/// The capacity of each user's live broadcast channel. Subscribers that fall
/// behind this many unread events are dropped per the bus's non-blocking
/// fan-out contract; they must reconnect and replay from the ring buffer.
const CHANNEL_CAPACITY: usize = 256;

/// The number of past events retained per user for SSE replay via
/// `Last-Event-ID`.
const RING_BUFFER_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A single progress event in a user's spawn/teardown event stream.
///
/// `seq` is strictly increasing per user (tests elsewhere rely on
/// this), which is what lets a reconnecting SSE client ask to resume "after
/// event N" without risking duplicates or gaps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    pub percent: Option<u8>,
    pub ready: bool,
}

impl ProgressEvent {
    pub fn info(seq: u64, message: impl Into<String>) -> Self {
        Self {
            seq,
            timestamp: Utc::now(),
            severity: Severity::Info,
            message: message.into(),
            percent: None,
            ready: false,
        }
    }

    pub fn warning(seq: u64, message: impl Into<String>) -> Self {
        Self {
            seq,
            timestamp: Utc::now(),
            severity: Severity::Warning,
            message: message.into(),
            percent: None,
            ready: false,
        }
    }

    pub fn error(seq: u64, message: impl Into<String>) -> Self {
        Self {
            seq,
            timestamp: Utc::now(),
            severity: Severity::Error,
            message: message.into(),
            percent: None,
            ready: false,
        }
    }

    pub fn ready(seq: u64, message: impl Into<String>) -> Self {
        Self {
            seq,
            timestamp: Utc::now(),
            severity: Severity::Info,
            message: message.into(),
            percent: Some(100),
            ready: true,
        }
    }
}

/// Per-user event state: the monotonic sequence counter, the bounded replay
/// buffer, and the live broadcast sender subscribers attach to.
struct UserChannel {
    next_seq: AtomicU64,
    buffer: Mutex<VecDeque<ProgressEvent>>,
    sender: broadcast::Sender<ProgressEvent>,
}

impl UserChannel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            next_seq: AtomicU64::new(0),
            buffer: Mutex::new(VecDeque::with_capacity(RING_BUFFER_CAPACITY)),
            sender,
        }
    }
}

/// `ProgressEventBus` is the central hub for per-user spawn progress.
///
/// Mirrors this codebase's Pub/Sub manager: a `DashMap` of broadcast
/// channels, one per key (here, per username instead of per channel name),
/// each fed by a bounded ring buffer for replay.
#[derive(Debug, Default)]
pub struct ProgressEventBus {
    users: DashMap<String, Arc<UserChannel>>,
}

impl std::fmt::Debug for UserChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserChannel")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl ProgressEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel_for(&self, user: &str) -> Arc<UserChannel> {
        self.users
            .entry(user.to_string())
            .or_insert_with(|| Arc::new(UserChannel::new()))
            .value()
            .clone()
    }

    /// Appends an event with the next sequence number for `user` and
    /// non-blockingly fans it out to live subscribers. Returns the
    /// published event (with its assigned `seq`).
    pub async fn publish(
        &self,
        user: &str,
        mut build: impl FnMut(u64) -> ProgressEvent,
    ) -> ProgressEvent {
        let channel = self.channel_for(user);
        let seq = channel.next_seq.fetch_add(1, Ordering::SeqCst);
        let event = build(seq);

        {
            let mut buffer = channel.buffer.lock().await;
            if buffer.len() >= RING_BUFFER_CAPACITY {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }

        // A `send` error just means there are currently no live subscribers;
        // the event still lives in the ring buffer for later replay.
        let _ = channel.sender.send(event.clone());
        event
    }

    /// Subscribes to `user`'s event stream. Returns the events currently in
    /// the replay buffer (optionally only those after `after_seq`, for
    /// `Last-Event-ID` resumption) plus a receiver for subsequent live
    /// events. Slow subscribers are silently dropped by `tokio::broadcast`
    /// once they fall more than `CHANNEL_CAPACITY` events behind; callers
    /// must re-subscribe (which replays from the buffer) to recover.
    pub async fn subscribe(
        &self,
        user: &str,
        after_seq: Option<u64>,
    ) -> (Vec<ProgressEvent>, broadcast::Receiver<ProgressEvent>) {
        let channel = self.channel_for(user);
        // Subscribe before reading the buffer so no event published between
        // the two can be lost to the caller.
        let receiver = channel.sender.subscribe();
        let buffer = channel.buffer.lock().await;
        let replay = buffer
            .iter()
            .filter(|e| after_seq.is_none_or(|after| e.seq > after))
            .cloned()
            .collect();
        (replay, receiver)
    }

    /// Removes all bus state for `user`. Called once the lab (and any
    /// file-server) for that user has reached `absent` and no resources
    /// remain; a live subscriber set survives the removal (subscribers hold
    /// their own `Receiver` clone), it is simply no longer reachable for
    /// new `publish` calls under that key.
    pub fn forget_user(&self, user: &str) {
        self.users.remove(user);
    }

    /// Sends a terminal event to every user's live subscribers so an SSE
    /// connection sees a clean stream end on process shutdown rather than
    /// a dropped connection. Deliberately not written to the replay buffer:
    /// a client reconnecting after a restart should resume real progress,
    /// not replay a stale "shutting down" notice.
    pub fn shutdown_sentinel(&self) {
        for entry in self.users.iter() {
            let _ = entry
                .value()
                .sender
                .send(ProgressEvent::warning(u64::MAX, "server is shutting down"));
        }
    }

    /// A maintenance pass removing users with no live subscribers and an
    /// empty or stale buffer so the map doesn't grow unboundedly across the
    /// process lifetime. Mirrors `PubSubManager::purge_empty_channels`.
    pub async fn purge_idle(&self, known_active_users: &std::collections::HashSet<String>) -> usize {
        let mut purged = 0;
        let candidates: Vec<String> = self
            .users
            .iter()
            .filter(|entry| {
                entry.value().sender.receiver_count() == 0
                    && !known_active_users.contains(entry.key())
            })
            .map(|entry| entry.key().clone())
            .collect();

        for user in candidates {
            self.users.remove(&user);
            purged += 1;
        }

        if purged > 0 {
            debug!("Purged {} idle progress-event channels.", purged);
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_assigns_monotonic_sequence_numbers() {
        let bus = ProgressEventBus::new();
        let e0 = bus.publish("rachel", |seq| ProgressEvent::info(seq, "pending")).await;
        let e1 = bus.publish("rachel", |seq| ProgressEvent::info(seq, "running")).await;
        assert_eq!(e0.seq, 0);
        assert_eq!(e1.seq, 1);
    }

    #[tokio::test]
    async fn subscribe_replays_buffered_events_then_delivers_live() {
        let bus = ProgressEventBus::new();
        bus.publish("rachel", |seq| ProgressEvent::info(seq, "pending")).await;
        let (replay, mut rx) = bus.subscribe("rachel", None).await;
        assert_eq!(replay.len(), 1);

        let published = bus
            .publish("rachel", |seq| ProgressEvent::ready(seq, "running"))
            .await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.seq, published.seq);
        assert!(received.ready);
    }

    #[tokio::test]
    async fn subscribe_after_seq_skips_already_seen_events() {
        let bus = ProgressEventBus::new();
        bus.publish("bob", |seq| ProgressEvent::info(seq, "a")).await;
        bus.publish("bob", |seq| ProgressEvent::info(seq, "b")).await;
        let (replay, _rx) = bus.subscribe("bob", Some(0)).await;
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].message, "b");
    }

    #[tokio::test]
    async fn forget_user_removes_bus_state() {
        let bus = ProgressEventBus::new();
        bus.publish("carol", |seq| ProgressEvent::info(seq, "x")).await;
        bus.forget_user("carol");
        let (replay, _rx) = bus.subscribe("carol", None).await;
        assert!(replay.is_empty());
    }

    #[tokio::test]
    async fn purge_idle_removes_unsubscribed_users_not_in_active_set() {
        let bus = ProgressEventBus::new();
        bus.publish("dave", |seq| ProgressEvent::info(seq, "x")).await;
        let purged = bus.purge_idle(&std::collections::HashSet::new()).await;
        assert_eq!(purged, 1);
    }
}
