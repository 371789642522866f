//! Store trait definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    DomainResult, MessageEntry, MessageFilter, MeterSample, SessionRecord, StationSnapshot,
    Transaction,
};

/// Aggregate statistics over the messages collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageStats {
    pub total: u64,
    pub sent: u64,
    pub received: u64,
    pub calls: u64,
    pub call_results: u64,
    pub call_errors: u64,
}

/// Document-store contract consumed by the core.
///
/// Implementations must index messages on (station id, timestamp) and
/// transactions on (station id, transaction id).
#[async_trait]
pub trait EmulatorStore: Send + Sync {
    // Station operations
    async fn upsert_station(&self, snapshot: StationSnapshot) -> DomainResult<()>;
    async fn get_station(&self, id: &str) -> DomainResult<Option<StationSnapshot>>;
    async fn delete_station(&self, id: &str) -> DomainResult<()>;
    async fn list_stations(&self) -> DomainResult<Vec<StationSnapshot>>;

    // Message operations
    async fn insert_messages(&self, entries: Vec<MessageEntry>) -> DomainResult<()>;
    async fn find_messages(&self, filter: &MessageFilter) -> DomainResult<Vec<MessageEntry>>;
    async fn search_messages(
        &self,
        term: &str,
        filter: &MessageFilter,
    ) -> DomainResult<Vec<MessageEntry>>;
    async fn count_messages(&self, filter: &MessageFilter) -> DomainResult<u64>;
    async fn delete_messages_before(&self, cutoff: DateTime<Utc>) -> DomainResult<u64>;
    async fn message_stats(&self) -> DomainResult<MessageStats>;

    // Transaction operations
    async fn upsert_transaction(&self, transaction: Transaction) -> DomainResult<()>;
    async fn get_transaction(&self, station_id: &str, id: i64) -> DomainResult<Option<Transaction>>;
    async fn list_transactions(&self, station_id: Option<&str>) -> DomainResult<Vec<Transaction>>;

    // Session operations
    async fn upsert_session(&self, session: SessionRecord) -> DomainResult<()>;
    async fn list_sessions(&self, station_id: &str) -> DomainResult<Vec<SessionRecord>>;

    // Meter value operations
    async fn insert_meter_samples(&self, samples: Vec<MeterSample>) -> DomainResult<()>;
    async fn list_meter_samples(
        &self,
        station_id: &str,
        connector_id: Option<u32>,
    ) -> DomainResult<Vec<MeterSample>>;
}
