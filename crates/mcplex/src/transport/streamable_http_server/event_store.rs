//! Append-only log of the SSE events a session has emitted, consulted
//! when a client reconnects with `Last-Event-ID`.
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use thiserror::Error;

use crate::model::ServerJsonRpcMessage;

/// Identifies one SSE stream within a session. Stream `0` is the
/// standalone server→client stream; request-scoped streams count up
/// from `1`.
pub type StreamId = u64;

pub const STANDALONE_STREAM_ID: StreamId = 0;

/// A per-stream monotonic event id, written to the wire as
/// `<stream>/<seq>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    pub stream_id: StreamId,
    pub seq: u64,
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.stream_id, self.seq)
    }
}

impl std::str::FromStr for EventId {
    type Err = InvalidEventId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stream, seq) = s.split_once('/').ok_or(InvalidEventId)?;
        Ok(EventId {
            stream_id: stream.parse().map_err(|_| InvalidEventId)?,
            seq: seq.parse().map_err(|_| InvalidEventId)?,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid event id")]
pub struct InvalidEventId;

#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event_id: EventId,
    pub message: Arc<ServerJsonRpcMessage>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplayError {
    /// The stream id was never written to.
    #[error("unknown stream")]
    UnknownStream,
    /// The requested position has already been evicted from the window.
    #[error("event id below the replay window")]
    OutOfWindow,
}

/// Storage backing SSE resumability.
///
/// `append` must make the event visible for replay before the server
/// acknowledges it to any consumer, so a reconnect can never observe a
/// gap.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Assign the next id on the stream and retain the message.
    async fn append(&self, stream_id: StreamId, message: Arc<ServerJsonRpcMessage>) -> EventId;

    /// Every retained event with id strictly greater than `after`, in
    /// id order.
    async fn replay_after(&self, after: EventId) -> Result<Vec<StoredEvent>, ReplayError>;
}

#[derive(Debug, Default)]
struct StreamLog {
    next_seq: u64,
    events: VecDeque<StoredEvent>,
}

/// A bounded per-stream ring. The replay window is the `capacity` most
/// recent events of each stream; a `Last-Event-ID` that has fallen out
/// of the window fails with [`ReplayError::OutOfWindow`] rather than
/// replaying silently incomplete history.
#[derive(Debug)]
pub struct InMemoryEventStore {
    capacity: usize,
    streams: tokio::sync::Mutex<HashMap<StreamId, StreamLog>>,
}

impl InMemoryEventStore {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            streams: Default::default(),
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[async_trait::async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, stream_id: StreamId, message: Arc<ServerJsonRpcMessage>) -> EventId {
        let mut streams = self.streams.lock().await;
        let log = streams.entry(stream_id).or_default();
        log.next_seq += 1;
        let event_id = EventId {
            stream_id,
            seq: log.next_seq,
        };
        log.events.push_back(StoredEvent { event_id, message });
        while log.events.len() > self.capacity {
            log.events.pop_front();
        }
        event_id
    }

    async fn replay_after(&self, after: EventId) -> Result<Vec<StoredEvent>, ReplayError> {
        let streams = self.streams.lock().await;
        let log = streams.get(&after.stream_id).ok_or(ReplayError::UnknownStream)?;
        if let Some(first) = log.events.front()
            && after.seq + 1 < first.event_id.seq
        {
            return Err(ReplayError::OutOfWindow);
        }
        Ok(log
            .events
            .iter()
            .filter(|event| event.event_id.seq > after.seq)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RequestId, ServerJsonRpcMessage, ServerResult};

    fn message(n: u32) -> Arc<ServerJsonRpcMessage> {
        Arc::new(ServerJsonRpcMessage::response(
            ServerResult::empty(()),
            RequestId::Number(n),
        ))
    }

    #[tokio::test]
    async fn test_event_ids_are_monotonic_per_stream() {
        let store = InMemoryEventStore::default();
        let a = store.append(1, message(1)).await;
        let b = store.append(1, message(2)).await;
        let other = store.append(2, message(3)).await;
        assert_eq!(a, EventId { stream_id: 1, seq: 1 });
        assert_eq!(b, EventId { stream_id: 1, seq: 2 });
        assert_eq!(other, EventId { stream_id: 2, seq: 1 });
    }

    #[tokio::test]
    async fn test_replay_is_strictly_after() {
        let store = InMemoryEventStore::default();
        for n in 0..5 {
            store.append(1, message(n)).await;
        }
        let replayed = store
            .replay_after(EventId { stream_id: 1, seq: 2 })
            .await
            .unwrap();
        let seqs: Vec<u64> = replayed.iter().map(|e| e.event_id.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_replay_below_window_is_rejected() {
        let store = InMemoryEventStore::new(2);
        for n in 0..5 {
            store.append(1, message(n)).await;
        }
        // window holds seq 4..=5; seq 3 is the boundary (nothing missing
        // when resuming after it)
        assert!(store.replay_after(EventId { stream_id: 1, seq: 3 }).await.is_ok());
        assert_eq!(
            store.replay_after(EventId { stream_id: 1, seq: 1 }).await,
            Err(ReplayError::OutOfWindow)
        );
    }

    #[tokio::test]
    async fn test_unknown_stream() {
        let store = InMemoryEventStore::default();
        assert_eq!(
            store.replay_after(EventId { stream_id: 9, seq: 0 }).await,
            Err(ReplayError::UnknownStream)
        );
    }

    #[test]
    fn test_event_id_wire_format() {
        let id = EventId { stream_id: 3, seq: 17 };
        assert_eq!(id.to_string(), "3/17");
        assert_eq!("3/17".parse::<EventId>().unwrap(), id);
        assert!("nonsense".parse::<EventId>().is_err());
    }
}
