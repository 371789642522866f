//! In-memory store adapter
//!
//! Used by tests and as the fallback when no external store is configured.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::{
    Direction, DomainResult, MessageEntry, MessageFilter, MessageType, MeterSample, SessionRecord,
    StationSnapshot, Transaction,
};

use super::traits::{EmulatorStore, MessageStats};

#[derive(Default)]
struct Collections {
    stations: HashMap<String, StationSnapshot>,
    messages: Vec<MessageEntry>,
    transactions: HashMap<(String, i64), Transaction>,
    sessions: Vec<SessionRecord>,
    meter_values: Vec<MeterSample>,
}

/// In-memory implementation of [`EmulatorStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new())
    }
}

fn apply_filter<'a>(
    messages: impl Iterator<Item = &'a MessageEntry>,
    filter: &MessageFilter,
) -> Vec<MessageEntry> {
    let mut out: Vec<MessageEntry> = messages.filter(|m| filter.matches(m)).cloned().collect();
    if let Some(limit) = filter.limit {
        if out.len() > limit {
            let skip = out.len() - limit;
            out.drain(..skip);
        }
    }
    out
}

#[async_trait]
impl EmulatorStore for MemoryStore {
    async fn upsert_station(&self, snapshot: StationSnapshot) -> DomainResult<()> {
        let mut inner = self.inner.write().await;
        inner.stations.insert(snapshot.config.id.clone(), snapshot);
        Ok(())
    }

    async fn get_station(&self, id: &str) -> DomainResult<Option<StationSnapshot>> {
        Ok(self.inner.read().await.stations.get(id).cloned())
    }

    async fn delete_station(&self, id: &str) -> DomainResult<()> {
        self.inner.write().await.stations.remove(id);
        Ok(())
    }

    async fn list_stations(&self) -> DomainResult<Vec<StationSnapshot>> {
        Ok(self.inner.read().await.stations.values().cloned().collect())
    }

    async fn insert_messages(&self, entries: Vec<MessageEntry>) -> DomainResult<()> {
        self.inner.write().await.messages.extend(entries);
        Ok(())
    }

    async fn find_messages(&self, filter: &MessageFilter) -> DomainResult<Vec<MessageEntry>> {
        Ok(apply_filter(self.inner.read().await.messages.iter(), filter))
    }

    async fn search_messages(
        &self,
        term: &str,
        filter: &MessageFilter,
    ) -> DomainResult<Vec<MessageEntry>> {
        let needle = term.to_lowercase();
        let inner = self.inner.read().await;
        Ok(apply_filter(
            inner
                .messages
                .iter()
                .filter(|m| m.raw.to_lowercase().contains(&needle)),
            filter,
        ))
    }

    async fn count_messages(&self, filter: &MessageFilter) -> DomainResult<u64> {
        let inner = self.inner.read().await;
        Ok(inner.messages.iter().filter(|m| filter.matches(m)).count() as u64)
    }

    async fn delete_messages_before(&self, cutoff: DateTime<Utc>) -> DomainResult<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.messages.len();
        inner.messages.retain(|m| m.timestamp >= cutoff);
        Ok((before - inner.messages.len()) as u64)
    }

    async fn message_stats(&self) -> DomainResult<MessageStats> {
        let inner = self.inner.read().await;
        let mut stats = MessageStats {
            total: inner.messages.len() as u64,
            ..Default::default()
        };
        for m in &inner.messages {
            match m.direction {
                Direction::Sent => stats.sent += 1,
                Direction::Received => stats.received += 1,
            }
            match m.message_type {
                MessageType::Call => stats.calls += 1,
                MessageType::CallResult => stats.call_results += 1,
                MessageType::CallError => stats.call_errors += 1,
            }
        }
        Ok(stats)
    }

    async fn upsert_transaction(&self, transaction: Transaction) -> DomainResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .transactions
            .insert((transaction.station_id.clone(), transaction.id), transaction);
        Ok(())
    }

    async fn get_transaction(&self, station_id: &str, id: i64) -> DomainResult<Option<Transaction>> {
        Ok(self
            .inner
            .read()
            .await
            .transactions
            .get(&(station_id.to_string(), id))
            .cloned())
    }

    async fn list_transactions(&self, station_id: Option<&str>) -> DomainResult<Vec<Transaction>> {
        let inner = self.inner.read().await;
        let mut out: Vec<Transaction> = inner
            .transactions
            .values()
            .filter(|t| station_id.map(|s| t.station_id == s).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by_key(|t| t.started_at);
        Ok(out)
    }

    async fn upsert_session(&self, session: SessionRecord) -> DomainResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.sessions.iter_mut().find(|s| s.id == session.id) {
            *existing = session;
        } else {
            inner.sessions.push(session);
        }
        Ok(())
    }

    async fn list_sessions(&self, station_id: &str) -> DomainResult<Vec<SessionRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .sessions
            .iter()
            .filter(|s| s.station_id == station_id)
            .cloned()
            .collect())
    }

    async fn insert_meter_samples(&self, samples: Vec<MeterSample>) -> DomainResult<()> {
        self.inner.write().await.meter_values.extend(samples);
        Ok(())
    }

    async fn list_meter_samples(
        &self,
        station_id: &str,
        connector_id: Option<u32>,
    ) -> DomainResult<Vec<MeterSample>> {
        Ok(self
            .inner
            .read()
            .await
            .meter_values
            .iter()
            .filter(|s| {
                s.station_id == station_id
                    && connector_id.map(|c| s.connector_id == c).unwrap_or(true)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OcppVersion;

    fn entry(station: &str, direction: Direction, action: &str) -> MessageEntry {
        MessageEntry::new(
            station,
            direction,
            MessageType::Call,
            uuid::Uuid::new_v4().to_string(),
            OcppVersion::V16,
            serde_json::json!({"idTag": "T1"}),
            format!("[2,\"u\",\"{}\",{{\"idTag\":\"T1\"}}]", action),
        )
        .with_action(action)
    }

    #[tokio::test]
    async fn message_filter_and_count() {
        let store = MemoryStore::new();
        store
            .insert_messages(vec![
                entry("CP-1", Direction::Sent, "Heartbeat"),
                entry("CP-1", Direction::Received, "Reset"),
                entry("CP-2", Direction::Sent, "Heartbeat"),
            ])
            .await
            .unwrap();

        let filter = MessageFilter {
            station_id: Some("CP-1".into()),
            ..Default::default()
        };
        assert_eq!(store.count_messages(&filter).await.unwrap(), 2);

        let sent = MessageFilter {
            direction: Some(Direction::Sent),
            ..Default::default()
        };
        assert_eq!(store.find_messages(&sent).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn search_matches_raw_text() {
        let store = MemoryStore::new();
        store
            .insert_messages(vec![entry("CP-1", Direction::Sent, "Authorize")])
            .await
            .unwrap();
        let hits = store
            .search_messages("idtag", &MessageFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(store
            .search_messages("nothing-here", &MessageFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn delete_older_than_cutoff() {
        let store = MemoryStore::new();
        let mut old = entry("CP-1", Direction::Sent, "Heartbeat");
        old.timestamp = Utc::now() - chrono::Duration::hours(2);
        store
            .insert_messages(vec![old, entry("CP-1", Direction::Sent, "Heartbeat")])
            .await
            .unwrap();

        let deleted = store
            .delete_messages_before(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(
            store.count_messages(&MessageFilter::default()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn transactions_keyed_by_station_and_id() {
        let store = MemoryStore::new();
        store
            .upsert_transaction(Transaction::start(1, "CP-1", 1, "T1", 0))
            .await
            .unwrap();
        store
            .upsert_transaction(Transaction::start(1, "CP-2", 1, "T1", 0))
            .await
            .unwrap();

        assert!(store.get_transaction("CP-1", 1).await.unwrap().is_some());
        assert_eq!(store.list_transactions(None).await.unwrap().len(), 2);
        assert_eq!(
            store.list_transactions(Some("CP-1")).await.unwrap().len(),
            1
        );
    }
}
