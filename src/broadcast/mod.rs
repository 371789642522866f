//! Broadcaster — fan-out of live events to UI subscribers
//!
//! Each subscriber owns a bounded queue; fan-out is strictly non-blocking.
//! A full queue drops the event for that subscriber only and bumps its
//! counter, so one stalled client can never hold back the others.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::{Direction, MessageEntry, ScenarioProgress};

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Event delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BroadcastEvent {
    Message(Box<MessageEntry>),
    Change {
        category: String,
        payload: Value,
    },
    ScenarioProgress(ScenarioProgress),
}

/// Per-subscriber event filter, applied before enqueue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriberFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl SubscriberFilter {
    fn matches_message(&self, entry: &MessageEntry) -> bool {
        if let Some(ref id) = self.station_id {
            if &entry.station_id != id {
                return false;
            }
        }
        if let Some(direction) = self.direction {
            if entry.direction != direction {
                return false;
            }
        }
        if let Some(ref action) = self.action {
            if entry.action.as_deref() != Some(action.as_str()) {
                return false;
            }
        }
        true
    }
}

struct Subscriber {
    tx: mpsc::Sender<BroadcastEvent>,
    filter: SubscriberFilter,
    dropped: AtomicU64,
}

/// Registry of UI subscribers.
pub struct Broadcaster {
    subscribers: DashMap<String, Subscriber>,
    capacity: usize,
}

/// Shared, reference-counted broadcaster
pub type SharedBroadcaster = Arc<Broadcaster>;

impl Broadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn shared() -> SharedBroadcaster {
        Arc::new(Self::new())
    }

    /// Register a subscriber; the returned receiver is drained by the
    /// client's outbound-writer task. An existing registration under the
    /// same id is replaced (its channel closes).
    pub fn register(
        &self,
        client_id: &str,
        filter: SubscriberFilter,
    ) -> mpsc::Receiver<BroadcastEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.insert(
            client_id.to_string(),
            Subscriber {
                tx,
                filter,
                dropped: AtomicU64::new(0),
            },
        );
        info!(client_id, total = self.subscribers.len(), "Subscriber registered");
        metrics::gauge!("ocpp_ui_subscribers").set(self.subscribers.len() as f64);
        rx
    }

    pub fn unregister(&self, client_id: &str) {
        if self.subscribers.remove(client_id).is_some() {
            info!(client_id, total = self.subscribers.len(), "Subscriber unregistered");
        }
        metrics::gauge!("ocpp_ui_subscribers").set(self.subscribers.len() as f64);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Messages a subscriber has lost to backpressure.
    pub fn dropped_for(&self, client_id: &str) -> u64 {
        self.subscribers
            .get(client_id)
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Fan a wire message out to every matching subscriber.
    pub fn broadcast_message(&self, entry: &MessageEntry) {
        for sub in self.subscribers.iter() {
            if !sub.filter.matches_message(entry) {
                continue;
            }
            Self::offer(
                &sub,
                BroadcastEvent::Message(Box::new(entry.clone())),
            );
        }
    }

    /// Fan a state-change event out to every subscriber.
    pub fn broadcast_change(&self, category: &str, payload: Value) {
        for sub in self.subscribers.iter() {
            Self::offer(
                &sub,
                BroadcastEvent::Change {
                    category: category.to_string(),
                    payload: payload.clone(),
                },
            );
        }
    }

    /// Fan scenario progress out to every subscriber.
    pub fn broadcast_scenario_progress(&self, progress: &ScenarioProgress) {
        for sub in self.subscribers.iter() {
            Self::offer(&sub, BroadcastEvent::ScenarioProgress(progress.clone()));
        }
    }

    fn offer(sub: &dashmap::mapref::multiple::RefMulti<'_, String, Subscriber>, event: BroadcastEvent) {
        if let Err(mpsc::error::TrySendError::Full(_)) = sub.tx.try_send(event) {
            sub.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("ocpp_broadcast_dropped_total").increment(1);
            debug!(client_id = sub.key().as_str(), "Subscriber queue full, event dropped");
        }
    }

    /// Close every subscriber channel.
    pub fn shutdown(&self) {
        let count = self.subscribers.len();
        self.subscribers.clear();
        if count > 0 {
            warn!(count, "Broadcaster shut down with active subscribers");
        }
        metrics::gauge!("ocpp_ui_subscribers").set(0.0);
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageType, OcppVersion};

    fn entry(station: &str, action: &str) -> MessageEntry {
        MessageEntry::new(
            station,
            Direction::Sent,
            MessageType::Call,
            uuid::Uuid::new_v4().to_string(),
            OcppVersion::V16,
            serde_json::json!({}),
            "[2,\"u\",\"X\",{}]",
        )
        .with_action(action)
    }

    #[tokio::test]
    async fn filtered_subscriber_sees_only_matches() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.register(
            "ui-1",
            SubscriberFilter {
                station_id: Some("CP-1".into()),
                ..Default::default()
            },
        );

        broadcaster.broadcast_message(&entry("CP-2", "Heartbeat"));
        broadcaster.broadcast_message(&entry("CP-1", "Heartbeat"));

        let event = rx.recv().await.unwrap();
        match event {
            BroadcastEvent::Message(m) => assert_eq!(m.station_id, "CP-1"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stalled_subscriber_does_not_block_others() {
        let broadcaster = Broadcaster::with_capacity(8);
        // Stalled: receiver kept but never drained
        let _stalled_rx = broadcaster.register("stalled", SubscriberFilter::default());
        let mut reader_rx = broadcaster.register("reader", SubscriberFilter::default());

        let reader_task = tokio::spawn(async move {
            let mut count = 0u64;
            while let Some(_event) = reader_rx.recv().await {
                count += 1;
                if count == 1_000 {
                    break;
                }
            }
            count
        });

        for i in 0..1_000 {
            broadcaster.broadcast_message(&entry("CP-1", &format!("A{}", i)));
            // Yield so the reader task can drain its queue
            if i % 4 == 0 {
                tokio::task::yield_now().await;
            }
        }

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), reader_task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, 1_000);
        assert!(broadcaster.dropped_for("stalled") > 0);
        assert_eq!(broadcaster.dropped_for("reader"), 0);
    }

    #[tokio::test]
    async fn unregister_and_shutdown_close_channels() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.register("ui-1", SubscriberFilter::default());
        broadcaster.unregister("ui-1");
        assert!(rx.recv().await.is_none());

        let mut rx2 = broadcaster.register("ui-2", SubscriberFilter::default());
        broadcaster.shutdown();
        assert!(rx2.recv().await.is_none());
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn change_events_reach_all_subscribers() {
        let broadcaster = Broadcaster::new();
        let mut a = broadcaster.register("a", SubscriberFilter::default());
        let mut b = broadcaster.register("b", SubscriberFilter::default());

        broadcaster.broadcast_change("station", serde_json::json!({"id": "CP-1"}));

        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                BroadcastEvent::Change { category, .. } => assert_eq!(category, "station"),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }
}
