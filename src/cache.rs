//! Content-hash memoization used for change detection.
//!
//! The indexing service stores `content_hash:{id}` → SHA-256 of the last
//! indexed text. Two backends implement [`HashCache`]:
//!
//! - [`InMemoryHashCache`]: process-local, lost on exit.
//! - [`SqliteHashCache`]: persistent `content_hashes` table via `sqlx`.
//!
//! Racing writers are tolerated; the last write wins.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

use crate::config::CacheConfig;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported cache backend: {0}")]
    Unsupported(String),
}

#[async_trait]
pub trait HashCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value` under `key`, expiring after `ttl` when given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Build the backend named by `[cache] backend`.
pub async fn create_cache(config: &CacheConfig) -> Result<Arc<dyn HashCache>, CacheError> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryHashCache::new())),
        "sqlite" => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| CacheError::Unsupported("sqlite backend without a path".into()))?;
            Ok(Arc::new(SqliteHashCache::open(path).await?))
        }
        other => Err(CacheError::Unsupported(other.to_string())),
    }
}

// ============ In-memory backend ============

#[derive(Debug, Default)]
pub struct InMemoryHashCache {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl InMemoryHashCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Option<Instant>)>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl HashCache for InMemoryHashCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries();
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some((_, Some(deadline))) => Instant::now() >= *deadline,
            Some((_, None)) => false,
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.entries()
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries().remove(key);
        Ok(())
    }
}

// ============ SQLite backend ============

pub struct SqliteHashCache {
    pool: SqlitePool,
}

impl SqliteHashCache {
    /// Open (creating if missing) the cache database at `path`.
    pub async fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS content_hashes (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl HashCache for SqliteHashCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT value FROM content_hashes WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.map(|ttl| Utc::now().timestamp() + ttl.as_secs() as i64);
        sqlx::query(
            r#"
            INSERT INTO content_hashes (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM content_hashes WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
