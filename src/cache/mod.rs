//! Per-sender memo of past decisions.
//!
//! Backends are chosen once at startup from [`CacheType`]; the rest of the
//! pipeline only sees [`CacheRepository`].

mod memory;
mod sql;
mod sweeper;

pub use memory::MemoryCache;
pub use sql::{MySqlCache, SqliteCache};
pub use sweeper::CacheSweeper;

use crate::config::{CacheConfig, CacheType};
use crate::error::CacheError;
use crate::model::CacheEntry;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CacheEntry),
    NotFound,
    /// A row exists but its expiry has passed.
    Expired,
}

#[async_trait]
pub trait CacheRepository: Send + Sync {
    async fn get(&self, sender: &str) -> Result<CacheLookup, CacheError>;

    /// Insert or overwrite the entry for `entry.sender_email`.
    async fn set(&self, entry: &CacheEntry) -> Result<(), CacheError>;

    async fn delete(&self, sender: &str) -> Result<(), CacheError>;

    /// Remove every entry whose expiry is at or before now.
    async fn cleanup(&self) -> Result<u64, CacheError>;

    async fn close(&self) {}

    fn backend(&self) -> &'static str;
}

/// Open the backend named by the configuration.
pub async fn open(config: &CacheConfig) -> Result<Arc<dyn CacheRepository>, CacheError> {
    let cache: Arc<dyn CacheRepository> = match config.cache_type {
        CacheType::Memory => Arc::new(MemoryCache::new()),
        CacheType::Sqlite => Arc::new(SqliteCache::open(&config.sqlite_path).await?),
        CacheType::Mysql => {
            let url = config
                .mysql_url
                .as_deref()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| CacheError::Unavailable("mysql_url is not set".to_string()))?;
            Arc::new(MySqlCache::connect(url).await?)
        }
    };
    log::info!("Opened {} result cache", cache.backend());
    Ok(cache)
}
