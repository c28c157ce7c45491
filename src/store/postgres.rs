//! PostgreSQL-backed shared store.
//!
//! `observed_at` defaults to the database's `now()`, so every instance
//! stamps records with the same clock regardless of local skew.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{NewRecord, RecordId, RequestStore};
use crate::error::Result;

const CREATE_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS rate_limit_records (
        id UUID PRIMARY KEY,
        client_identity TEXT NOT NULL,
        endpoint_category TEXT NOT NULL,
        observed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        expires_at TIMESTAMPTZ NOT NULL
    )
"#;

const CREATE_WINDOW_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS rate_limit_records_window_idx
        ON rate_limit_records (client_identity, endpoint_category, observed_at)
"#;

const CREATE_EXPIRY_INDEX: &str = r#"
    CREATE INDEX IF NOT EXISTS rate_limit_records_expiry_idx
        ON rate_limit_records (expires_at)
"#;

/// Store backed by a `rate_limit_records` table.
#[derive(Clone)]
pub struct PgRequestStore {
    pool: PgPool,
}

impl PgRequestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool against `database_url`.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create the records table and its indexes if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        for statement in [CREATE_TABLE, CREATE_WINDOW_INDEX, CREATE_EXPIRY_INDEX] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Rate limit schema is up to date");
        Ok(())
    }
}

#[async_trait]
impl RequestStore for PgRequestStore {
    async fn insert(&self, record: NewRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_records (id, client_identity, endpoint_category, expires_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&record.client_identity)
        .bind(&record.endpoint_category)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count_since(
        &self,
        client_identity: &str,
        endpoint_category: &str,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM rate_limit_records
            WHERE client_identity = $1
              AND endpoint_category = $2
              AND observed_at >= $3
            "#,
        )
        .bind(client_identity)
        .bind(endpoint_category)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn expired_ids(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<RecordId>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM rate_limit_records
            WHERE expires_at <= $1
            ORDER BY expires_at
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn delete_batch(&self, ids: &[RecordId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM rate_limit_records WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        debug!(requested = ids.len(), deleted = deleted, "Deleted record batch");
        Ok(deleted)
    }
}
