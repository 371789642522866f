//! Message logging pipeline
//!
//! Every wire message is submitted here. A bounded buffer absorbs
//! submissions without blocking the hot path; a single consumer task fans
//! each entry out to registered listeners and flushes batches to the store
//! (100 entries or 5 s, whichever first). Store failures are recoverable:
//! the pending batch is retried on the next flush, capped so a long outage
//! cannot grow it without bound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::domain::{Direction, DomainResult, MessageEntry, MessageFilter, MessageType};
use crate::persistence::SharedStore;
use crate::shared::shutdown::ShutdownSignal;

pub const DEFAULT_BUFFER_CAPACITY: usize = 1_000;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Pending-batch ceiling while the store is unavailable.
const MAX_PENDING_BATCH_FACTOR: usize = 10;

/// Synchronous observer invoked for every consumed entry. Expected to be
/// cheap; heavy work must be offloaded (the broadcaster offloads to its
/// per-subscriber queues).
pub type Listener = Arc<dyn Fn(&MessageEntry) + Send + Sync>;

pub type ListenerId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogStats {
    pub total: u64,
    pub sent: u64,
    pub received: u64,
    pub calls: u64,
    pub call_results: u64,
    pub call_errors: u64,
    pub buffered: u64,
    pub dropped: u64,
    pub flush_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_flush_at: Option<DateTime<Utc>>,
}

/// Buffered, batched persistence of wire messages with live fan-out.
pub struct MessageLog {
    tx: mpsc::Sender<MessageEntry>,
    rx: Mutex<Option<mpsc::Receiver<MessageEntry>>>,
    store: SharedStore,
    listeners: std::sync::RwLock<HashMap<ListenerId, Listener>>,
    next_listener_id: AtomicU64,
    batch_size: usize,
    flush_interval: Duration,

    total: AtomicU64,
    sent: AtomicU64,
    received: AtomicU64,
    calls: AtomicU64,
    call_results: AtomicU64,
    call_errors: AtomicU64,
    buffered: AtomicU64,
    dropped: AtomicU64,
    flush_count: AtomicU64,
    last_flush_at: std::sync::RwLock<Option<DateTime<Utc>>>,
}

/// Shared, reference-counted message log
pub type SharedMessageLog = Arc<MessageLog>;

impl MessageLog {
    pub fn new(store: SharedStore) -> SharedMessageLog {
        Self::with_options(
            store,
            DEFAULT_BUFFER_CAPACITY,
            DEFAULT_BATCH_SIZE,
            DEFAULT_FLUSH_INTERVAL,
        )
    }

    pub fn with_options(
        store: SharedStore,
        capacity: usize,
        batch_size: usize,
        flush_interval: Duration,
    ) -> SharedMessageLog {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            store,
            listeners: std::sync::RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            batch_size: batch_size.max(1),
            flush_interval,
            total: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            call_results: AtomicU64::new(0),
            call_errors: AtomicU64::new(0),
            buffered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
            last_flush_at: std::sync::RwLock::new(None),
        })
    }

    /// Start the consumer task. Call once.
    pub fn start(self: &Arc<Self>, shutdown: ShutdownSignal) {
        let this = self.clone();
        tokio::spawn(async move {
            let rx = this.rx.lock().await.take();
            if let Some(rx) = rx {
                this.consume(rx, shutdown).await;
            }
        });
    }

    /// Submit one entry. Never blocks; increments the dropped counter when
    /// the buffer is saturated.
    pub fn log_message(&self, entry: MessageEntry) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match entry.direction {
            Direction::Sent => self.sent.fetch_add(1, Ordering::Relaxed),
            Direction::Received => self.received.fetch_add(1, Ordering::Relaxed),
        };
        match entry.message_type {
            MessageType::Call => self.calls.fetch_add(1, Ordering::Relaxed),
            MessageType::CallResult => self.call_results.fetch_add(1, Ordering::Relaxed),
            MessageType::CallError => self.call_errors.fetch_add(1, Ordering::Relaxed),
        };

        match self.tx.try_send(entry) {
            Ok(()) => {
                self.buffered.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("ocpp_log_dropped_total").increment(1);
            }
        }
    }

    // ── Listeners ──────────────────────────────────────────

    pub fn add_listener(&self, listener: Listener) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().unwrap().insert(id, listener);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.write().unwrap().remove(&id);
    }

    fn notify_listeners(&self, entry: &MessageEntry) {
        let listeners = self.listeners.read().unwrap();
        for listener in listeners.values() {
            listener(entry);
        }
    }

    // ── Queries (delegated to the store) ───────────────────

    pub async fn get_messages(&self, filter: &MessageFilter) -> DomainResult<Vec<MessageEntry>> {
        self.store.find_messages(filter).await
    }

    pub async fn search_messages(
        &self,
        term: &str,
        filter: &MessageFilter,
    ) -> DomainResult<Vec<MessageEntry>> {
        self.store.search_messages(term, filter).await
    }

    pub async fn count_messages(&self, filter: &MessageFilter) -> DomainResult<u64> {
        self.store.count_messages(filter).await
    }

    pub async fn delete_older_than(&self, age: Duration) -> DomainResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(age)
                .map_err(|e| crate::domain::DomainError::Other(e.to_string()))?;
        self.store.delete_messages_before(cutoff).await
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            total: self.total.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            calls: self.calls.load(Ordering::Relaxed),
            call_results: self.call_results.load(Ordering::Relaxed),
            call_errors: self.call_errors.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
            last_flush_at: *self.last_flush_at.read().unwrap(),
        }
    }

    // ── Consumer ───────────────────────────────────────────

    async fn consume(self: Arc<Self>, mut rx: mpsc::Receiver<MessageEntry>, shutdown: ShutdownSignal) {
        let mut batch: Vec<MessageEntry> = Vec::with_capacity(self.batch_size);
        let mut timer = tokio::time::interval(self.flush_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await; // immediate first tick
        let mut shutdown_watch = shutdown.watcher();

        debug!(
            batch_size = self.batch_size,
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            "Message log consumer started"
        );

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(entry) => {
                        self.accept(entry, &mut batch).await;
                    }
                    None => break,
                },
                _ = timer.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
                _ = shutdown_watch.stopped() => break,
            }
        }

        // Residual drain on shutdown
        while let Ok(entry) = rx.try_recv() {
            self.accept(entry, &mut batch).await;
        }
        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }
        debug!("Message log consumer stopped");
    }

    async fn accept(&self, entry: MessageEntry, batch: &mut Vec<MessageEntry>) {
        self.buffered.fetch_sub(1, Ordering::Relaxed);
        self.notify_listeners(&entry);
        batch.push(entry);
        if batch.len() >= self.batch_size {
            self.flush(batch).await;
        }
    }

    async fn flush(&self, batch: &mut Vec<MessageEntry>) {
        match self.store.insert_messages(batch.clone()).await {
            Ok(()) => {
                batch.clear();
                self.flush_count.fetch_add(1, Ordering::Relaxed);
                *self.last_flush_at.write().unwrap() = Some(Utc::now());
            }
            Err(e) => {
                warn!(error = %e, pending = batch.len(), "Message flush failed; will retry");
                let cap = self.batch_size * MAX_PENDING_BATCH_FACTOR;
                if batch.len() > cap {
                    let overflow = batch.len() - cap;
                    batch.drain(..overflow);
                    self.dropped.fetch_add(overflow as u64, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OcppVersion;
    use crate::persistence::{EmulatorStore, MemoryStore};

    fn entry(station: &str, direction: Direction) -> MessageEntry {
        MessageEntry::new(
            station,
            direction,
            MessageType::Call,
            uuid::Uuid::new_v4().to_string(),
            OcppVersion::V16,
            serde_json::json!({}),
            "[2,\"u\",\"Heartbeat\",{}]",
        )
        .with_action("Heartbeat")
    }

    #[tokio::test]
    async fn entries_reach_store_when_batch_fills() {
        let store = MemoryStore::shared();
        let log = MessageLog::with_options(store.clone(), 100, 5, Duration::from_secs(60));
        let shutdown = ShutdownSignal::new();
        log.start(shutdown.clone());

        for _ in 0..5 {
            log.log_message(entry("CP-1", Direction::Sent));
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if store
                    .count_messages(&MessageFilter::default())
                    .await
                    .unwrap()
                    == 5
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("batch never flushed");

        assert_eq!(log.stats().flush_count, 1);
        shutdown.trigger();
    }

    #[tokio::test]
    async fn timer_flushes_partial_batch() {
        let store = MemoryStore::shared();
        let log = MessageLog::with_options(store.clone(), 100, 100, Duration::from_millis(50));
        let shutdown = ShutdownSignal::new();
        log.start(shutdown.clone());

        log.log_message(entry("CP-1", Direction::Received));

        tokio::time::timeout(Duration::from_secs(5), async {
            while store
                .count_messages(&MessageFilter::default())
                .await
                .unwrap()
                != 1
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timer flush never happened");
        shutdown.trigger();
    }

    #[tokio::test]
    async fn shutdown_flushes_residue() {
        let store = MemoryStore::shared();
        let log = MessageLog::with_options(store.clone(), 100, 100, Duration::from_secs(60));
        let shutdown = ShutdownSignal::new();
        log.start(shutdown.clone());

        log.log_message(entry("CP-1", Direction::Sent));
        log.log_message(entry("CP-1", Direction::Sent));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(5), async {
            while store
                .count_messages(&MessageFilter::default())
                .await
                .unwrap()
                != 2
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("residual flush never happened");
    }

    #[tokio::test]
    async fn saturated_buffer_drops_with_counter() {
        let store = MemoryStore::shared();
        // Capacity 2, consumer never started: third entry must drop.
        let log = MessageLog::with_options(store, 2, 100, Duration::from_secs(60));
        log.log_message(entry("CP-1", Direction::Sent));
        log.log_message(entry("CP-1", Direction::Sent));
        log.log_message(entry("CP-1", Direction::Sent));

        let stats = log.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.buffered, 2);
    }

    #[tokio::test]
    async fn listeners_observe_each_entry() {
        let store = MemoryStore::shared();
        let log = MessageLog::with_options(store, 100, 1, Duration::from_secs(60));
        let shutdown = ShutdownSignal::new();
        log.start(shutdown.clone());

        let seen = Arc::new(AtomicU64::new(0));
        let seen_in_listener = seen.clone();
        let id = log.add_listener(Arc::new(move |_entry| {
            seen_in_listener.fetch_add(1, Ordering::SeqCst);
        }));

        log.log_message(entry("CP-1", Direction::Sent));
        log.log_message(entry("CP-1", Direction::Received));

        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.load(Ordering::SeqCst) != 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("listener never invoked");

        log.remove_listener(id);
        log.log_message(entry("CP-1", Direction::Sent));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        shutdown.trigger();
    }

    #[tokio::test]
    async fn stats_track_direction_and_type() {
        let store = MemoryStore::shared();
        let log = MessageLog::with_options(store, 100, 100, Duration::from_secs(60));
        log.log_message(entry("CP-1", Direction::Sent));
        log.log_message(entry("CP-1", Direction::Received));
        let stats = log.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.received, 1);
        assert_eq!(stats.calls, 2);
    }
}
