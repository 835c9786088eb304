use super::{CacheLookup, CacheRepository};
use crate::error::CacheError;
use crate::model::{normalize_sender, CacheEntry};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// In-process cache; contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, CacheEntry>>, CacheError> {
        self.entries
            .read()
            .map_err(|_| CacheError::Unavailable("memory cache lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, CacheEntry>>, CacheError> {
        self.entries
            .write()
            .map_err(|_| CacheError::Unavailable("memory cache lock poisoned".to_string()))
    }
}

#[async_trait]
impl CacheRepository for MemoryCache {
    async fn get(&self, sender: &str) -> Result<CacheLookup, CacheError> {
        let key = normalize_sender(sender);
        let map = self.read()?;
        Ok(match map.get(&key) {
            Some(entry) if entry.is_expired_at(Utc::now()) => CacheLookup::Expired,
            Some(entry) => CacheLookup::Hit(entry.clone()),
            None => CacheLookup::NotFound,
        })
    }

    async fn set(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let mut entry = entry.clone();
        entry.sender_email = normalize_sender(&entry.sender_email);
        self.write()?.insert(entry.sender_email.clone(), entry);
        Ok(())
    }

    async fn delete(&self, sender: &str) -> Result<(), CacheError> {
        self.write()?.remove(&normalize_sender(sender));
        Ok(())
    }

    async fn cleanup(&self) -> Result<u64, CacheError> {
        let now = Utc::now();
        let mut map = self.write()?;
        let before = map.len();
        map.retain(|_, entry| !entry.is_expired_at(now));
        Ok((before - map.len()) as u64)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_then_get() {
        let cache = MemoryCache::new();
        let entry = CacheEntry::new("bar@unknown.com", true, 0.9, Duration::hours(1));
        cache.set(&entry).await.unwrap();

        match cache.get("BAR@unknown.com").await.unwrap() {
            CacheLookup::Hit(found) => assert_eq!(found, entry),
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_entry_and_cleanup() {
        let cache = MemoryCache::new();
        let mut stale = CacheEntry::new("old@x.com", false, 0.1, Duration::hours(1));
        stale.expires_at = Utc::now() - Duration::seconds(1);
        cache.set(&stale).await.unwrap();
        cache
            .set(&CacheEntry::new("fresh@x.com", false, 0.1, Duration::hours(1)))
            .await
            .unwrap();

        assert_eq!(cache.get("old@x.com").await.unwrap(), CacheLookup::Expired);
        assert_eq!(cache.cleanup().await.unwrap(), 1);
        assert_eq!(cache.get("old@x.com").await.unwrap(), CacheLookup::NotFound);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_set_overwrites_and_delete_removes() {
        let cache = MemoryCache::new();
        cache
            .set(&CacheEntry::new("a@x.com", false, 0.2, Duration::hours(1)))
            .await
            .unwrap();
        cache
            .set(&CacheEntry::new("a@x.com", true, 0.95, Duration::hours(1)))
            .await
            .unwrap();
        match cache.get("a@x.com").await.unwrap() {
            CacheLookup::Hit(found) => assert!(found.is_spam),
            other => panic!("expected hit, got {:?}", other),
        }

        cache.delete("A@X.COM").await.unwrap();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_distinct_senders() {
        let cache = Arc::new(MemoryCache::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                let sender = format!("user{}@x.com", i);
                let score = i as f64 / 32.0;
                cache
                    .set(&CacheEntry::new(&sender, false, score, Duration::hours(1)))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for i in 0..32 {
            match cache.get(&format!("user{}@x.com", i)).await.unwrap() {
                CacheLookup::Hit(found) => assert_eq!(found.score, i as f64 / 32.0),
                other => panic!("expected hit, got {:?}", other),
            }
        }
    }
}
