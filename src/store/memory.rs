//! Process-local store.
//!
//! Behaves like the shared store but lives in one process, so it only
//! enforces limits for a single instance. Used in tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::{NewRecord, RateLimitRecord, RecordId, RequestStore};
use crate::clock::Clock;
use crate::error::Result;

pub struct MemoryStore {
    records: RwLock<HashMap<RecordId, RateLimitRecord>>,
    /// Plays the role of the store server's clock
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Insert a fully-formed record, bypassing server time assignment.
    pub fn insert_record(&self, record: RateLimitRecord) {
        self.records.write().insert(record.id, record);
    }

    /// Snapshot of every stored record.
    pub fn records(&self) -> Vec<RateLimitRecord> {
        self.records.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("records", &self.len())
            .finish()
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn insert(&self, record: NewRecord) -> Result<()> {
        let stored = RateLimitRecord {
            id: Uuid::new_v4(),
            client_identity: record.client_identity,
            endpoint_category: record.endpoint_category,
            observed_at: self.clock.now(),
            expires_at: record.expires_at,
        };
        self.insert_record(stored);
        Ok(())
    }

    async fn count_since(
        &self,
        client_identity: &str,
        endpoint_category: &str,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let records = self.records.read();
        let count = records
            .values()
            .filter(|r| {
                r.client_identity == client_identity
                    && r.endpoint_category == endpoint_category
                    && r.observed_at >= since
            })
            .count();
        Ok(count as u64)
    }

    async fn expired_ids(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<RecordId>> {
        // Page order is irrelevant to the sweeper; stop at the first `limit` hits.
        let records = self.records.read();
        Ok(records
            .values()
            .filter(|r| r.expires_at <= cutoff)
            .take(limit)
            .map(|r| r.id)
            .collect())
    }

    async fn delete_batch(&self, ids: &[RecordId]) -> Result<u64> {
        // One write lock for the whole batch keeps it all-or-nothing.
        let mut records = self.records.write();
        let deleted = ids.iter().filter(|id| records.remove(*id).is_some()).count();
        Ok(deleted as u64)
    }
}
