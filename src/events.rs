use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::Extension;
use axum::http::header;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::models::CommandResult;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    InitialState,
    NodeRegistered,
    NodeUpdated,
    NodeUnregistered,
    CommandResult,
    UserRegistered,
    UserDeleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl Event {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Fan-out of state-change events to live subscribers. Sends are
/// non-blocking: a subscriber whose buffer is full is dropped so a slow
/// client can never stall a producer.
pub struct EventBroadcaster {
    subscribers: DashMap<u64, mpsc::Sender<Event>>,
    next_id: AtomicU64,
    buffer_size: usize,
}

impl EventBroadcaster {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn subscribe(self: &Arc<Self>) -> (SubscriberGuard, mpsc::Receiver<Event>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer_size);
        self.subscribers.insert(id, tx);
        (
            SubscriberGuard {
                broadcaster: Arc::clone(self),
                id,
            },
            rx,
        )
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn publish(&self, event: Event) {
        let mut evicted = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = *entry.key(), "dropping slow event subscriber");
                    evicted.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    evicted.push(*entry.key());
                }
            }
        }
        for id in evicted {
            self.subscribers.remove(&id);
        }
    }
}

pub struct SubscriberGuard {
    broadcaster: Arc<EventBroadcaster>,
    id: u64,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.broadcaster.subscribers.remove(&self.id);
    }
}

/// Single long-lived task relaying dispatched command results into the
/// event stream.
pub fn start_command_relay(
    broadcaster: Arc<EventBroadcaster>,
    mut rx: mpsc::Receiver<CommandResult>,
) {
    tokio::spawn(async move {
        while let Some(result) = rx.recv().await {
            broadcaster.publish(Event::new(
                EventType::CommandResult,
                json!({ "result": result }),
            ));
        }
    });
}

/// `GET /ws` — despite the path, this is Server-Sent Events, not a
/// websocket upgrade. The first frame carries the current node list.
pub async fn stream_events(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let nodes = state.registries.nodes.list().await.unwrap_or_default();
    let initial = Event::new(EventType::InitialState, json!({ "nodes": nodes }));
    let (guard, rx) = state.broadcaster.subscribe();

    // The guard lives inside the map closure; dropping the stream (client
    // disconnect) unsubscribes.
    let live = ReceiverStream::new(rx).map(move |event| {
        let _keep = &guard;
        event
    });
    let frames = stream::once(async move { initial })
        .chain(live)
        .map(|event| {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".into());
            Ok::<SseEvent, Infallible>(SseEvent::default().data(data))
        });
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(frames),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let broadcaster = Arc::new(EventBroadcaster::new(16));
        let (_guard, mut rx) = broadcaster.subscribe();
        for i in 0..5 {
            broadcaster.publish(Event::new(EventType::NodeUpdated, json!({ "seq": i })));
        }
        for i in 0..5 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.data["seq"], i);
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_and_others_keep_receiving() {
        let broadcaster = Arc::new(EventBroadcaster::new(2));
        let (_slow_guard, slow_rx) = broadcaster.subscribe();
        let (_fast_guard, mut fast_rx) = broadcaster.subscribe();

        // The slow subscriber never drains; its buffer of 2 overflows on
        // the third publish and it is removed from the set.
        for i in 0..4 {
            broadcaster.publish(Event::new(EventType::NodeUpdated, json!({ "seq": i })));
        }
        assert_eq!(broadcaster.subscriber_count(), 1);

        for i in 0..4 {
            let event = fast_rx.recv().await.unwrap();
            assert_eq!(event.data["seq"], i);
        }
        drop(slow_rx);
    }

    #[tokio::test]
    async fn dropped_guard_unsubscribes() {
        let broadcaster = Arc::new(EventBroadcaster::new(4));
        let (guard, rx) = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);
        drop(guard);
        drop(rx);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
