//! Cache Statistics Module
//!
//! In-process counters for hits, misses, evictions and fetch activity.

use serde::Serialize;

// == Cache Stats ==
/// Tracks cache performance metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed cache retrievals (key not found or stale)
    pub misses: u64,
    /// Stale values returned because stale reads were allowed
    pub stale_hits: u64,
    /// Entries evicted by the count or size limit
    pub evictions: u64,
    /// Entries removed because their TTL elapsed
    pub expirations: u64,
    /// Sets dropped for exceeding the per-entry size limit
    pub size_rejections: u64,
    /// Loader invocations started by `fetch`
    pub fetches: u64,
    /// Fetches that joined an in-flight load instead of starting one
    pub coalesced_fetches: u64,
    /// Loads that failed or were cancelled
    pub fetch_failures: u64,
    /// Current number of entries in the cache
    pub total_entries: usize,
    /// Current aggregate size, 0 without size tracking
    pub calculated_size: usize,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Share of reads answered with a value, stale or not.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        match served + self.misses {
            0 => 0.0,
            reads => served as f64 / reads as f64,
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_stale_hit(&mut self) {
        self.stale_hits += 1;
    }

    pub fn record_eviction(&mut self) {
        self.evictions += 1;
    }

    pub fn record_expiration(&mut self) {
        self.expirations += 1;
    }

    pub fn record_size_rejection(&mut self) {
        self.size_rejections += 1;
    }

    pub fn record_fetch(&mut self) {
        self.fetches += 1;
    }

    pub fn record_coalesced(&mut self) {
        self.coalesced_fetches += 1;
    }

    pub fn record_fetch_failure(&mut self) {
        self.fetch_failures += 1;
    }

    // == Update Gauges ==
    /// Updates the entry count and aggregate size.
    pub fn set_gauges(&mut self, entries: usize, calculated_size: usize) {
        self.total_entries = entries;
        self.calculated_size = calculated_size;
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = CacheStats::new();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.total_entries, 0);
    }

    #[test]
    fn test_hit_rate_no_requests() {
        let stats = CacheStats::new();
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let mut stats = CacheStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        assert_eq!(stats.hit_rate(), 0.75);
    }

    #[test]
    fn test_hit_rate_counts_stale_hits() {
        let mut stats = CacheStats::new();
        stats.record_stale_hit();
        stats.record_miss();
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_fetch_counters() {
        let mut stats = CacheStats::new();
        stats.record_fetch();
        stats.record_coalesced();
        stats.record_coalesced();
        stats.record_fetch_failure();
        assert_eq!(stats.fetches, 1);
        assert_eq!(stats.coalesced_fetches, 2);
        assert_eq!(stats.fetch_failures, 1);
    }

    #[test]
    fn test_set_gauges() {
        let mut stats = CacheStats::new();
        stats.set_gauges(42, 1_024);
        assert_eq!(stats.total_entries, 42);
        assert_eq!(stats.calculated_size, 1_024);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["total_entries"], 42);
    }
}
