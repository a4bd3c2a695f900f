//! SQLite-backed response cache.
//!
//! Records live in a `cache` table shaped `{ request, response, cached_at }`,
//! with `cached_at` stored as Unix milliseconds. Lookups ignore records older
//! than the TTL even before the pruning task has deleted them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{CacheEntry, CacheError, CacheStore};

const MAX_CONNECTIONS: u32 = 5;

/// Response cache persisted in SQLite
#[derive(Debug, Clone)]
pub struct SqliteCacheStore {
    pool: SqlitePool,
    ttl: Duration,
}

impl SqliteCacheStore {
    /// Connect to the database, creating the file and schema if needed
    pub async fn connect(database_url: &str, ttl: Duration) -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;

        Self::from_pool(pool, ttl).await
    }

    /// Wrap an existing pool, creating the schema if needed
    pub async fn from_pool(pool: SqlitePool, ttl: Duration) -> Result<Self, CacheError> {
        let store = Self { pool, ttl };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<(), CacheError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request TEXT NOT NULL,
                response BLOB NOT NULL,
                cached_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cache_request_cached_at ON cache (request, cached_at)",
        )
        .execute(&self.pool)
        .await?;

        info!("Response cache table ready");
        Ok(())
    }

    fn oldest_fresh_millis(&self) -> i64 {
        let ttl_millis = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        Utc::now().timestamp_millis().saturating_sub(ttl_millis)
    }
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let row = sqlx::query(
            "SELECT request, response, cached_at FROM cache
             WHERE request = ? AND cached_at >= ?
             ORDER BY cached_at DESC, id DESC
             LIMIT 1",
        )
        .bind(key)
        .bind(self.oldest_fresh_millis())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let cached_at_millis: i64 = row.try_get("cached_at")?;
        let cached_at = DateTime::<Utc>::from_timestamp_millis(cached_at_millis).ok_or_else(|| {
            CacheError::InvalidRecord(format!("timestamp out of range: {}", cached_at_millis))
        })?;

        Ok(Some(CacheEntry {
            key: row.try_get("request")?,
            response_body: row.try_get("response")?,
            cached_at,
        }))
    }

    async fn store(&self, key: &str, response_body: &[u8]) -> Result<(), CacheError> {
        sqlx::query("INSERT INTO cache (request, response, cached_at) VALUES (?, ?, ?)")
            .bind(key)
            .bind(response_body)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn prune(&self) -> Result<u64, CacheError> {
        let result = sqlx::query("DELETE FROM cache WHERE cached_at < ?")
            .bind(self.oldest_fresh_millis())
            .execute(&self.pool)
            .await?;

        debug!("Pruned {} expired cache records", result.rows_affected());
        Ok(result.rows_affected())
    }
}
