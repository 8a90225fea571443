//! Stale Purge Task
//!
//! Background task that periodically removes stale cache entries.

use std::hash::Hash;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::LruCache;

/// Spawns a background task that periodically purges stale entries.
///
/// The task holds only a weak handle and ends on its own once every strong
/// handle to the cache has been dropped.
///
/// # Arguments
/// * `cache` - The cache to sweep
/// * `interval` - Time between sweeps
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during shutdown.
///
/// # Example
/// ```ignore
/// let cache = LruCache::new(CacheOptions::new().max(100).ttl(1_000))?;
/// let purge_handle = spawn_purge_task(&cache, Duration::from_secs(1));
/// // Later, during shutdown:
/// purge_handle.abort();
/// ```
pub fn spawn_purge_task<K, V, C>(cache: &LruCache<K, V, C>, interval: Duration) -> JoinHandle<()>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    let weak = cache.downgrade();

    tokio::spawn(async move {
        info!(
            "Starting stale purge task with interval of {} ms",
            interval.as_millis()
        );

        loop {
            tokio::time::sleep(interval).await;

            let Some(cache) = weak.upgrade() else {
                debug!("Cache dropped, stopping purge task");
                break;
            };

            let before = cache.len();
            if cache.purge_stale() {
                info!(
                    "Stale purge: removed {} entries",
                    before.saturating_sub(cache.len())
                );
            } else {
                debug!("Stale purge: no stale entries found");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOptions;

    fn ttl_cache() -> LruCache<String, String> {
        LruCache::new(CacheOptions::new().max(100).ttl_resolution(0)).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_task_removes_stale_entries() {
        let cache = ttl_cache();
        cache
            .set_with(
                "expire_soon".to_string(),
                Some("value".to_string()),
                crate::cache::SetOptions::default().ttl(100),
            )
            .unwrap();

        let handle = spawn_purge_task(&cache, Duration::from_millis(250));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(cache.len(), 0, "Stale entry should have been purged");
        assert_eq!(cache.stats().expirations, 1);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_task_preserves_fresh_entries() {
        let cache = ttl_cache();
        cache
            .set_with(
                "long_lived".to_string(),
                Some("value".to_string()),
                crate::cache::SetOptions::default().ttl(3_600_000),
            )
            .unwrap();

        let handle = spawn_purge_task(&cache, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(350)).await;

        assert_eq!(cache.get(&"long_lived".to_string()), Some("value".to_string()));

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_task_stops_when_cache_dropped() {
        let cache = ttl_cache();
        let handle = spawn_purge_task(&cache, Duration::from_millis(10));

        drop(cache);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(handle.is_finished(), "Task should end once the cache is gone");
    }
}
