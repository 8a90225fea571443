//! Cache Module
//!
//! Provides a bounded in-process LRU cache with size accounting, TTL
//! staleness and coalesced asynchronous fetches.

mod arena;
mod clock;
mod dispose;
mod entry;
mod fetch;
mod lru;
mod options;
mod size;
mod stats;
mod store;
mod ttl;


// Re-export public types
pub use dispose::{DisposeReason, InsertReason};
pub use entry::Entry;
pub use lru::{LruCache, WeakLruCache};
pub use options::{
    CacheOptions, DisposeAfter, Disposer, FetchFuture, FetchOptions, Fetcher, FetcherOptions,
    GetOptions, HasOptions, Inserter, MemoOptions, Memoizer, MemoizerOptions, PeekOptions,
    SetOptions, SizeCalculator,
};
pub use stats::CacheStats;
pub use ttl::RemainingTtl;
