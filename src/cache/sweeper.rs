use super::CacheRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Background task that purges expired entries on a fixed interval.
///
/// The backend only holds its write lock (or runs its DELETE) for the
/// duration of one `cleanup()` call, never across the sleep.
pub struct CacheSweeper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl CacheSweeper {
    pub fn spawn(cache: Arc<dyn CacheRepository>, every: Duration) -> Self {
        let token = CancellationToken::new();
        let handle = tokio::spawn(run(cache, every, token.clone()));
        CacheSweeper { token, handle }
    }

    /// Stop the task and wait for it to finish its current pass.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            log::warn!("Cache sweeper ended abnormally: {}", e);
        }
    }
}

async fn run(cache: Arc<dyn CacheRepository>, every: Duration, token: CancellationToken) {
    log::info!(
        "Starting cache sweeper: backend={} interval={:?}",
        cache.backend(),
        every
    );
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => match cache.cleanup().await {
                Ok(0) => log::debug!("Cache sweep removed nothing"),
                Ok(removed) => log::info!("Cache sweep removed {} expired entries", removed),
                Err(e) => log::error!("Cache sweep failed: {}", e),
            },
        }
    }

    log::info!("Cache sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheLookup, MemoryCache};
    use crate::model::CacheEntry;
    use chrono::Utc;

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let cache = Arc::new(MemoryCache::new());
        let mut stale = CacheEntry::new("old@x.com", true, 0.9, chrono::Duration::hours(1));
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
        cache.set(&stale).await.unwrap();

        let sweeper = CacheSweeper::spawn(cache.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        sweeper.shutdown().await;

        assert_eq!(cache.get("old@x.com").await.unwrap(), CacheLookup::NotFound);
    }

    #[tokio::test]
    async fn test_shutdown_is_prompt() {
        let cache = Arc::new(MemoryCache::new());
        let sweeper = CacheSweeper::spawn(cache, Duration::from_secs(3600));
        tokio::time::timeout(Duration::from_secs(1), sweeper.shutdown())
            .await
            .expect("sweeper did not stop");
    }
}
