use llm_spam_filter::cache::{self, CacheLookup, CacheRepository, SqliteCache};
use llm_spam_filter::config::{CacheConfig, CacheType};
use llm_spam_filter::CacheEntry;
use tempfile::TempDir;

async fn open_temp() -> (TempDir, SqliteCache) {
    let dir = TempDir::new().unwrap();
    let cache = SqliteCache::open(dir.path().join("nested/spam_cache.db"))
        .await
        .unwrap();
    (dir, cache)
}

#[tokio::test]
async fn test_set_get_and_overwrite() {
    let (_dir, cache) = open_temp().await;

    assert_eq!(cache.get("a@b.com").await.unwrap(), CacheLookup::NotFound);

    cache
        .set(&CacheEntry::new("A@B.com", false, 0.2, chrono::Duration::hours(1)))
        .await
        .unwrap();
    match cache.get("a@b.com").await.unwrap() {
        CacheLookup::Hit(entry) => {
            assert_eq!(entry.sender_email, "a@b.com");
            assert!(!entry.is_spam);
            assert_eq!(entry.score, 0.2);
        }
        other => panic!("expected hit, got {:?}", other),
    }

    cache
        .set(&CacheEntry::new("a@b.com", true, 0.9, chrono::Duration::hours(1)))
        .await
        .unwrap();
    match cache.get("a@b.com").await.unwrap() {
        CacheLookup::Hit(entry) => {
            assert!(entry.is_spam);
            assert_eq!(entry.score, 0.9);
        }
        other => panic!("expected hit, got {:?}", other),
    }

    cache.delete("a@b.com").await.unwrap();
    assert_eq!(cache.get("a@b.com").await.unwrap(), CacheLookup::NotFound);
    cache.close().await;
}

#[tokio::test]
async fn test_expired_entries_are_reported_and_swept() {
    let (_dir, cache) = open_temp().await;

    cache
        .set(&CacheEntry::new("old@x.com", true, 0.8, chrono::Duration::seconds(-5)))
        .await
        .unwrap();
    cache
        .set(&CacheEntry::new("new@x.com", false, 0.1, chrono::Duration::hours(1)))
        .await
        .unwrap();

    assert_eq!(cache.get("old@x.com").await.unwrap(), CacheLookup::Expired);
    assert_eq!(cache.cleanup().await.unwrap(), 1);
    assert_eq!(cache.get("old@x.com").await.unwrap(), CacheLookup::NotFound);
    assert!(matches!(cache.get("new@x.com").await.unwrap(), CacheLookup::Hit(_)));
    assert_eq!(cache.cleanup().await.unwrap(), 0);
}

#[tokio::test]
async fn test_entries_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("spam_cache.db");

    let first = SqliteCache::open(&path).await.unwrap();
    first
        .set(&CacheEntry::new("keep@x.com", false, 0.3, chrono::Duration::hours(1)))
        .await
        .unwrap();
    first.close().await;

    let second = SqliteCache::open(&path).await.unwrap();
    assert!(matches!(second.get("keep@x.com").await.unwrap(), CacheLookup::Hit(_)));
}

#[tokio::test]
async fn test_open_from_config() {
    let dir = TempDir::new().unwrap();
    let config = CacheConfig {
        cache_type: CacheType::Sqlite,
        sqlite_path: dir.path().join("cache.db").to_string_lossy().into_owned(),
        ..Default::default()
    };
    let cache = cache::open(&config).await.unwrap();
    assert_eq!(cache.backend(), "sqlite");

    let mysql = CacheConfig {
        cache_type: CacheType::Mysql,
        mysql_url: None,
        ..Default::default()
    };
    assert!(cache::open(&mysql).await.is_err());
}
