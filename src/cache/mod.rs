//! # Response Cache Module
//!
//! Stores upstream responses so identical queries can be answered without
//! another upstream round trip.
//!
//! ## Keys
//!
//! The cache key is the rewritten request path and query with the `api_key`
//! parameter removed. The upstream key is re-encrypted with a fresh IV for every
//! request, so leaving it in the key would make every lookup a miss.
//! [`cache_key`] is the only place a key is derived; lookups and writes both go
//! through it.
//!
//! ## Stores
//!
//! - `sqlite`: records in a SQLite table, pruned in the background
//! - `memory`: in-process map with the same contract
//!
//! Records are append-only and a lookup returns the most recent record younger
//! than the store's TTL.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use memory::MemoryCacheStore;
pub use sqlite::SqliteCacheStore;

/// Default record lifetime in seconds
pub const DEFAULT_CACHE_TTL: u64 = 600;

/// Cache URL selecting the in-process store
pub const MEMORY_CACHE_URL: &str = "memory";

const API_KEY_PARAM: &str = "api_key";

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// A cached upstream response
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub response_body: Vec<u8>,
    pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: &str, response_body: &[u8]) -> Self {
        Self {
            key: key.to_string(),
            response_body: response_body.to_vec(),
            cached_at: Utc::now(),
        }
    }

    /// Whether the entry is younger than `ttl`
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        Utc::now()
            .signed_duration_since(self.cached_at)
            .to_std()
            // negative age means a clock step backwards
            .map_or(true, |age| age < ttl)
    }
}

/// Errors raised by cache stores
#[derive(Debug)]
pub enum CacheError {
    Database(String),
    InvalidRecord(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Database(msg) => write!(f, "Cache database error: {}", msg),
            CacheError::InvalidRecord(msg) => write!(f, "Invalid cache record: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        CacheError::Database(err.to_string())
    }
}

/// Storage backend for cached responses
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Most recent fresh entry for `key`
    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Append a new entry stamped with the current time
    async fn store(&self, key: &str, response_body: &[u8]) -> Result<(), CacheError>;

    /// Remove entries older than the TTL, returning how many were removed
    async fn prune(&self) -> Result<u64, CacheError>;
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Derive the cache key for a request path and raw query string
pub fn cache_key(path: &str, query: &str) -> String {
    let query = query.strip_prefix('?').unwrap_or(query);
    let remaining: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty() && !is_api_key(pair))
        .collect();

    if remaining.is_empty() {
        path.to_string()
    } else {
        format!("{}?{}", path, remaining.join("&"))
    }
}

/// Open the store selected by `database_url`
pub async fn open_store(
    database_url: &str,
    ttl: Duration,
) -> Result<Arc<dyn CacheStore>, CacheError> {
    if database_url == MEMORY_CACHE_URL {
        info!("Using in-process response cache (ttl: {}s)", ttl.as_secs());
        return Ok(Arc::new(MemoryCacheStore::new(ttl)));
    }

    info!(
        "Using SQLite response cache at {} (ttl: {}s)",
        database_url,
        ttl.as_secs()
    );
    let store = SqliteCacheStore::connect(database_url, ttl).await?;
    Ok(Arc::new(store))
}

///////////////////////////////////////////////////////////////////////////////
//****                       Private Functions                           ****//
///////////////////////////////////////////////////////////////////////////////

fn is_api_key(pair: &str) -> bool {
    pair.split('=').next() == Some(API_KEY_PARAM)
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
