//! Notifications surfaced to the embedding application.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;

use crate::media::StreamKind;

/// Per-subscriber backlog before events are dropped.
const SUBSCRIBER_CAPACITY: usize = 256;

/// Events the server emits for UI/telemetry consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ServerEvent {
    /// A connection began streaming one media kind.
    StreamStarted { kind: StreamKind, id: u64 },
    /// The stream with this id ended.
    StreamStopped { kind: StreamKind, id: u64 },
    /// A control action for the capture/encoder side, from `POST /control`
    /// or from a video packetizer asking for a key frame (`video-sync`).
    ControlRequest { action: String, params: String },
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, monotonically increasing stream id.
pub fn next_stream_id() -> u64 {
    NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)
}

/// Fans events out to subscribers and tracks live streams.
#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Sender<ServerEvent>>>,
    active: Mutex<HashMap<u64, StreamKind>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new listener. Dropping the receiver unsubscribes it.
    pub fn subscribe(&self) -> Receiver<ServerEvent> {
        let (tx, rx) = crossbeam_channel::bounded(SUBSCRIBER_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn stream_started(&self, kind: StreamKind, id: u64) {
        self.active.lock().insert(id, kind);
        tracing::info!(%kind, id, "stream started");
        self.emit(ServerEvent::StreamStarted { kind, id });
    }

    pub fn stream_stopped(&self, kind: StreamKind, id: u64) {
        self.active.lock().remove(&id);
        tracing::info!(%kind, id, "stream stopped");
        self.emit(ServerEvent::StreamStopped { kind, id });
    }

    pub fn control(&self, action: &str, params: &str) {
        tracing::debug!(action, params, "control request");
        self.emit(ServerEvent::ControlRequest {
            action: action.to_string(),
            params: params.to_string(),
        });
    }

    /// Number of streams currently running across all connections.
    pub fn active_streams(&self) -> usize {
        self.active.lock().len()
    }

    fn emit(&self, event: ServerEvent) {
        self.subscribers
            .lock()
            .retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("event subscriber lagging, event dropped");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids_are_unique_and_increasing() {
        let a = next_stream_id();
        let b = next_stream_id();
        assert!(b > a);
    }

    #[test]
    fn subscribers_receive_events_in_order() {
        let hub = EventHub::new();
        let rx = hub.subscribe();
        hub.stream_started(StreamKind::H264, 7);
        assert_eq!(hub.active_streams(), 1);
        hub.control("video-sync", "send");
        hub.stream_stopped(StreamKind::H264, 7);
        assert_eq!(hub.active_streams(), 0);

        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::StreamStarted { kind: StreamKind::H264, id: 7 }
        );
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::ControlRequest { .. }));
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::StreamStopped { kind: StreamKind::H264, id: 7 }
        );
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let hub = EventHub::new();
        drop(hub.subscribe());
        hub.control("torch", "on");
        assert!(hub.subscribers.lock().is_empty());
    }
}
