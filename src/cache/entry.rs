//! Cache Entry Module
//!
//! Portable snapshot of a single entry, used by `dump`, `load` and `info`.

use chrono::Utc;
use serde::{Deserialize, Serialize};

// == Entry ==
/// A cache entry with its metadata.
///
/// `start` is a wall-clock timestamp (Unix milliseconds), so a snapshot taken
/// by one cache can be loaded into another created at a different time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<V> {
    /// The stored value
    pub value: V,
    /// Lifetime in milliseconds; `Some(0)` = tracked without expiry.
    /// From `info` this is the remaining lifetime and may be negative.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    /// Start of the lifetime (Unix milliseconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    /// Calculated size, when size tracking is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
}

impl<V> Entry<V> {
    // == Constructor ==
    /// Creates an entry without TTL or size metadata.
    pub fn new(value: V) -> Self {
        Self {
            value,
            ttl: None,
            start: None,
            size: None,
        }
    }

    pub fn with_ttl(mut self, ttl_ms: i64, start: i64) -> Self {
        self.ttl = Some(ttl_ms);
        self.start = Some(start);
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    // == Expires At ==
    /// Wall-clock expiry in Unix milliseconds, `None` if the entry never expires.
    pub fn expires_at(&self) -> Option<i64> {
        match (self.ttl, self.start) {
            (Some(ttl), Some(start)) if ttl != 0 => Some(start + ttl),
            _ => None,
        }
    }

    // == Is Expired ==
    /// Checks the entry against the current wall clock.
    ///
    /// Matches the cache's staleness rule: stale only once strictly more than
    /// `ttl` has elapsed.
    pub fn is_expired(&self) -> bool {
        self.expires_at()
            .map(|expires| Utc::now().timestamp_millis() > expires)
            .unwrap_or(false)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_without_ttl_never_expires() {
        let entry = Entry::new("value".to_string());
        assert_eq!(entry.expires_at(), None);
        assert!(!entry.is_expired());

        let tracked = Entry::new(1).with_ttl(0, 0);
        assert_eq!(tracked.expires_at(), None);
    }

    #[test]
    fn test_entry_expired() {
        let now = Utc::now().timestamp_millis();
        let old = Entry::new(1).with_ttl(100, now - 1_000);
        assert!(old.is_expired());

        let fresh = Entry::new(1).with_ttl(60_000, now);
        assert!(!fresh.is_expired());
        assert_eq!(fresh.expires_at(), Some(now + 60_000));
    }

    #[test]
    fn test_entry_serialization_skips_missing_metadata() {
        let entry = Entry::new("v".to_string()).with_size(3);
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"value":"v","size":3}"#);

        let back: Entry<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
