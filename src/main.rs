//! bytecache demo
//!
//! Builds a cache from environment configuration, runs a few concurrent
//! fetches against a slow simulated loader and prints the resulting stats and
//! a JSON snapshot.

use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bytecache::cache::{DisposeReason, FetcherOptions};
use bytecache::{spawn_purge_task, CacheOptions, Config, FetchOptions, LruCache};

/// Simulated upstream lookup.
async fn load_profile(user: String, _stale: Option<String>, options: FetcherOptions<()>) -> anyhow::Result<Option<String>> {
    tokio::select! {
        _ = options.signal.cancelled() => {
            warn!(%user, "load cancelled");
            Ok(None)
        }
        _ = tokio::time::sleep(Duration::from_millis(200)) => {
            info!(%user, "loaded from upstream");
            Ok(Some(format!("profile of {user}")))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bytecache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    info!(
        "Configuration loaded: max_entries={}, max_size={}, default_ttl={}ms, purge_interval={}ms",
        config.max_entries, config.max_size, config.default_ttl_ms, config.purge_interval_ms
    );

    let mut options = CacheOptions::from_config(&config)
        .dispose_after(|value: String, key: String, reason: DisposeReason| {
            info!(%key, %value, ?reason, "entry removed");
        })
        .fetch_method(load_profile);
    if config.max_size != 0 {
        options = options.size_calculation(|value: &String, _: &String| value.len().max(1));
    }
    let cache: LruCache<String, String> =
        LruCache::new(options).context("invalid cache configuration")?;

    let purge_handle = spawn_purge_task(&cache, Duration::from_millis(config.purge_interval_ms));

    // Five concurrent fetches for two keys: two loader calls in total
    let users = ["alice", "bob", "alice", "alice", "bob"];
    let results = join_all(
        users
            .iter()
            .map(|user| cache.fetch(user.to_string(), FetchOptions::new())),
    )
    .await;
    for (user, result) in users.iter().zip(results) {
        let value = result?;
        info!(%user, ?value, "fetch finished");
    }

    // Served from the cache
    let again = cache.fetch("alice".to_string(), FetchOptions::new()).await?;
    info!(value = ?again, "cached fetch");

    cache.delete(&"bob".to_string());

    let stats = cache.stats();
    info!("Hit rate: {:.2}", stats.hit_rate());
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).context("serializing stats")?
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&cache.dump()).context("serializing dump")?
    );

    purge_handle.abort();
    info!("Demo complete");
    Ok(())
}
