//! SQL-backed caches. Both share the `spam_cache` table layout; timestamps
//! are stored as Unix milliseconds so the same queries work on either engine.

use super::{CacheLookup, CacheRepository};
use crate::error::CacheError;
use crate::model::{normalize_sender, CacheEntry};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

const SELECT_ENTRY: &str = "SELECT sender_email, is_spam, score, last_seen, expires_at \
     FROM spam_cache WHERE sender_email = ?";
const DELETE_ENTRY: &str = "DELETE FROM spam_cache WHERE sender_email = ?";
const DELETE_EXPIRED: &str = "DELETE FROM spam_cache WHERE expires_at <= ?";

#[derive(Debug, sqlx::FromRow)]
struct CacheRow {
    sender_email: String,
    is_spam: bool,
    score: f64,
    last_seen: i64,
    expires_at: i64,
}

impl CacheRow {
    fn into_lookup(self, now: DateTime<Utc>) -> Result<CacheLookup, CacheError> {
        let entry = CacheEntry {
            sender_email: self.sender_email,
            is_spam: self.is_spam,
            score: self.score,
            last_seen: from_millis(self.last_seen)?,
            expires_at: from_millis(self.expires_at)?,
        };
        if entry.is_expired_at(now) {
            Ok(CacheLookup::Expired)
        } else {
            Ok(CacheLookup::Hit(entry))
        }
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, CacheError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| CacheError::Unavailable(format!("stored timestamp out of range: {}", ms)))
}

fn lookup(row: Option<CacheRow>) -> Result<CacheLookup, CacheError> {
    match row {
        Some(row) => row.into_lookup(Utc::now()),
        None => Ok(CacheLookup::NotFound),
    }
}

pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    /// Open (creating if needed) the database file and its parent directory.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CacheError::Unavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS spam_cache (
                sender_email TEXT PRIMARY KEY,
                is_spam INTEGER NOT NULL,
                score REAL NOT NULL,
                last_seen INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_expires_at ON spam_cache(expires_at)")
            .execute(&pool)
            .await?;

        log::debug!("SQLite cache ready at {}", path.display());
        Ok(SqliteCache { pool })
    }
}

#[async_trait]
impl CacheRepository for SqliteCache {
    async fn get(&self, sender: &str) -> Result<CacheLookup, CacheError> {
        let row = sqlx::query_as::<_, CacheRow>(SELECT_ENTRY)
            .bind(normalize_sender(sender))
            .fetch_optional(&self.pool)
            .await?;
        lookup(row)
    }

    async fn set(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        sqlx::query(
            "INSERT INTO spam_cache (sender_email, is_spam, score, last_seen, expires_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(sender_email) DO UPDATE SET
                is_spam = excluded.is_spam,
                score = excluded.score,
                last_seen = excluded.last_seen,
                expires_at = excluded.expires_at",
        )
        .bind(normalize_sender(&entry.sender_email))
        .bind(entry.is_spam)
        .bind(entry.score)
        .bind(entry.last_seen.timestamp_millis())
        .bind(entry.expires_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, sender: &str) -> Result<(), CacheError> {
        sqlx::query(DELETE_ENTRY)
            .bind(normalize_sender(sender))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cleanup(&self) -> Result<u64, CacheError> {
        let result = sqlx::query(DELETE_EXPIRED)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

pub struct MySqlCache {
    pool: MySqlPool,
}

impl MySqlCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS spam_cache (
                sender_email VARCHAR(255) PRIMARY KEY,
                is_spam BOOLEAN NOT NULL,
                score DOUBLE NOT NULL,
                last_seen BIGINT NOT NULL,
                expires_at BIGINT NOT NULL,
                INDEX idx_expires_at (expires_at)
            )",
        )
        .execute(&pool)
        .await?;

        Ok(MySqlCache { pool })
    }
}

#[async_trait]
impl CacheRepository for MySqlCache {
    async fn get(&self, sender: &str) -> Result<CacheLookup, CacheError> {
        let row = sqlx::query_as::<_, CacheRow>(SELECT_ENTRY)
            .bind(normalize_sender(sender))
            .fetch_optional(&self.pool)
            .await?;
        lookup(row)
    }

    async fn set(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        sqlx::query(
            "INSERT INTO spam_cache (sender_email, is_spam, score, last_seen, expires_at)
             VALUES (?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE
                is_spam = VALUES(is_spam),
                score = VALUES(score),
                last_seen = VALUES(last_seen),
                expires_at = VALUES(expires_at)",
        )
        .bind(normalize_sender(&entry.sender_email))
        .bind(entry.is_spam)
        .bind(entry.score)
        .bind(entry.last_seen.timestamp_millis())
        .bind(entry.expires_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, sender: &str) -> Result<(), CacheError> {
        sqlx::query(DELETE_ENTRY)
            .bind(normalize_sender(sender))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cleanup(&self) -> Result<u64, CacheError> {
        let result = sqlx::query(DELETE_EXPIRED)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn backend(&self) -> &'static str {
        "mysql"
    }
}
