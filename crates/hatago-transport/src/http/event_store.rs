//! Bounded in-memory SSE replay buffer, keyed by stream id (§3 `LastEventId`,
//! §4.7). Ids are a per-stream monotonic counter rather than an opaque
//! string, which makes "strictly monotonic" and "ids > x" trivial to check
//! and to test.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{TransportError, TransportResult};

#[derive(Clone, Debug)]
pub struct StoredEvent {
    pub id: u64,
    pub event_type: String,
    pub data: String,
}

struct Stream {
    buffer: VecDeque<StoredEvent>,
    capacity: usize,
    next_id: u64,
    senders: Vec<mpsc::UnboundedSender<StoredEvent>>,
}

impl Stream {
    fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            next_id: 1,
            senders: Vec::new(),
        }
    }

    fn push(&mut self, event_type: String, data: String) -> StoredEvent {
        let event = StoredEvent {
            id: self.next_id,
            event_type,
            data,
        };
        self.next_id += 1;
        if self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(event.clone());
        self.senders
            .retain(|sender| sender.send(event.clone()).is_ok());
        event
    }
}

/// Per-session replay buffers plus live SSE subscriber registries.
pub struct EventStore {
    streams: Mutex<HashMap<String, Stream>>,
    capacity: usize,
}

impl EventStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Append an event, creating the stream's buffer on first use.
    pub fn publish(&self, stream_id: &str, event_type: impl Into<String>, data: impl Into<String>) -> StoredEvent {
        let mut streams = self.streams.lock();
        let stream = streams
            .entry(stream_id.to_string())
            .or_insert_with(|| Stream::new(self.capacity));
        stream.push(event_type.into(), data.into())
    }

    /// Register a new subscriber for live events on `stream_id`.
    pub fn subscribe(&self, stream_id: &str) -> mpsc::UnboundedReceiver<StoredEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut streams = self.streams.lock();
        let stream = streams
            .entry(stream_id.to_string())
            .or_insert_with(|| Stream::new(self.capacity));
        stream.senders.push(tx);
        rx
    }

    /// Events after `last_event_id`, in order. Errors with
    /// [`TransportError::Truncated`] when the buffer can no longer prove
    /// nothing was missed (the open question in §9 is resolved as "error",
    /// not "silently start fresh").
    pub fn replay_from(&self, stream_id: &str, last_event_id: u64) -> TransportResult<Vec<StoredEvent>> {
        let streams = self.streams.lock();
        let Some(stream) = streams.get(stream_id) else {
            return Ok(Vec::new());
        };
        if last_event_id + 1 == stream.next_id {
            return Ok(Vec::new());
        }
        match stream.buffer.front() {
            Some(oldest) if last_event_id + 1 >= oldest.id => Ok(stream
                .buffer
                .iter()
                .filter(|event| event.id > last_event_id)
                .cloned()
                .collect()),
            _ => Err(TransportError::Truncated),
        }
    }

    /// Atomically combine [`Self::replay_from`] and [`Self::subscribe`] under
    /// a single lock acquisition, so no event published between the two
    /// calls can be dropped from a resuming SSE client (§8 scenario 4).
    pub fn replay_and_subscribe(
        &self,
        stream_id: &str,
        last_event_id: u64,
    ) -> TransportResult<(Vec<StoredEvent>, mpsc::UnboundedReceiver<StoredEvent>)> {
        let mut streams = self.streams.lock();
        let stream = streams
            .entry(stream_id.to_string())
            .or_insert_with(|| Stream::new(self.capacity));

        let replayed = if last_event_id + 1 == stream.next_id {
            Vec::new()
        } else {
            match stream.buffer.front() {
                Some(oldest) if last_event_id + 1 >= oldest.id => stream
                    .buffer
                    .iter()
                    .filter(|event| event.id > last_event_id)
                    .cloned()
                    .collect(),
                _ => return Err(TransportError::Truncated),
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        stream.senders.push(tx);
        Ok((replayed, rx))
    }

    pub fn close(&self, stream_id: &str) {
        self.streams.lock().remove(stream_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_monotonic_within_a_stream() {
        let store = EventStore::new(10);
        let a = store.publish("s1", "message", "{}");
        let b = store.publish("s1", "message", "{}");
        assert!(b.id > a.id);
    }

    #[test]
    fn replay_after_last_event_id_returns_only_newer_events_in_order() {
        let store = EventStore::new(10);
        for _ in 0..7 {
            store.publish("s1", "message", "{}");
        }
        let replayed = store.replay_from("s1", 5).unwrap();
        let ids: Vec<u64> = replayed.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![6, 7]);
    }

    #[test]
    fn replay_with_no_gap_returns_empty() {
        let store = EventStore::new(10);
        store.publish("s1", "message", "{}");
        let replayed = store.replay_from("s1", 1).unwrap();
        assert!(replayed.is_empty());
    }

    #[test]
    fn replay_past_truncated_window_errors() {
        let store = EventStore::new(2);
        for _ in 0..5 {
            store.publish("s1", "message", "{}");
        }
        let result = store.replay_from("s1", 1);
        assert!(matches!(result, Err(TransportError::Truncated)));
    }

    #[test]
    fn live_subscriber_receives_events_published_after_subscribe() {
        let store = EventStore::new(10);
        let mut rx = store.subscribe("s1");
        store.publish("s1", "message", "hello");
        let event = rx.try_recv().unwrap();
        assert_eq!(event.data, "hello");
    }

    #[test]
    fn replay_and_subscribe_returns_replay_and_misses_nothing_published_after() {
        let store = EventStore::new(10);
        for _ in 0..3 {
            store.publish("s1", "message", "{}");
        }
        let (replayed, mut rx) = store.replay_and_subscribe("s1", 1).unwrap();
        let replayed_ids: Vec<u64> = replayed.iter().map(|e| e.id).collect();
        assert_eq!(replayed_ids, vec![2, 3]);

        let next = store.publish("s1", "message", "after");
        let received = rx.try_recv().unwrap();
        assert_eq!(received.id, next.id);
    }

    #[test]
    fn replay_and_subscribe_past_truncated_window_errors() {
        let store = EventStore::new(2);
        for _ in 0..5 {
            store.publish("s1", "message", "{}");
        }
        let result = store.replay_and_subscribe("s1", 1);
        assert!(matches!(result, Err(TransportError::Truncated)));
    }
}
