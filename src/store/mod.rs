//! The shared counted-request store.
//!
//! Every request handler instance talks to the same store; it is the only
//! shared mutable state in the system.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::SystemClock;
use crate::config::{StoreBackend, StoreConfig};
use crate::error::{Result, TollgateError};

pub use memory::MemoryStore;
pub use postgres::PgRequestStore;

/// Identifier of a stored record.
pub type RecordId = Uuid;

/// One accepted request, as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRecord {
    pub id: RecordId,
    pub client_identity: String,
    pub endpoint_category: String,
    /// Assigned by the store's clock on insert
    pub observed_at: DateTime<Utc>,
    /// Only consulted by the sweeper
    pub expires_at: DateTime<Utc>,
}

/// A record about to be inserted. The store assigns `observed_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub client_identity: String,
    pub endpoint_category: String,
    pub expires_at: DateTime<Utc>,
}

/// Operations the limiter and sweeper need from the shared store.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a record stamped with the store's own time.
    async fn insert(&self, record: NewRecord) -> Result<()>;

    /// Count records for a client and category observed at or after `since`.
    async fn count_since(
        &self,
        client_identity: &str,
        endpoint_category: &str,
        since: DateTime<Utc>,
    ) -> Result<u64>;

    /// Up to `limit` ids of records whose expiry is at or before `cutoff`.
    async fn expired_ids(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<RecordId>>;

    /// Delete the given records as one atomic batch. Missing ids are ignored.
    async fn delete_batch(&self, ids: &[RecordId]) -> Result<u64>;
}

/// Build the configured store.
pub async fn build_store(config: &StoreConfig) -> Result<Arc<dyn RequestStore>> {
    match config.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; limits are not shared between instances");
            Ok(Arc::new(MemoryStore::new(Arc::new(SystemClock))))
        }
        StoreBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                TollgateError::Config("store.database_url is required for postgres".to_string())
            })?;
            let store =
                PgRequestStore::connect(url, config.max_connections, config.query_timeout())
                    .await?;
            if config.run_migrations {
                store.migrate().await?;
            }
            info!(max_connections = config.max_connections, "Connected to PostgreSQL store");
            Ok(Arc::new(store))
        }
    }
}
