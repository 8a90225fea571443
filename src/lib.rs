//! bytecache - A bounded in-process LRU cache
//!
//! Strict least-recently-used eviction over a fixed slot arena, optional size
//! accounting, TTL staleness with lazy or eager purge, and `fetch` with
//! coalesced, cancellable asynchronous population.

pub mod cache;
pub mod config;
pub mod error;
pub mod tasks;

pub use cache::{CacheOptions, CacheStats, Entry, FetchOptions, LruCache, RemainingTtl};
pub use config::Config;
pub use error::{CacheError, CancelReason, Result};
pub use tasks::spawn_purge_task;
