//! Size Tracking Module
//!
//! Per-slot sizes and the running total used for size-triggered eviction.

use crate::cache::options::SizeCalculator;
use crate::error::{CacheError, Result};

// == Size Tracker ==
#[derive(Debug)]
pub(crate) struct SizeTracker {
    sizes: Vec<usize>,
    total: usize,
    /// Aggregate limit, 0 = unbounded
    max_size: usize,
    max_entry_size: usize,
}

impl SizeTracker {
    pub(crate) fn new(max_size: usize, max_entry_size: usize, capacity: usize) -> Self {
        Self {
            sizes: vec![0; capacity],
            total: 0,
            max_size,
            max_entry_size,
        }
    }

    pub(crate) fn total(&self) -> usize {
        self.total
    }

    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    pub(crate) fn size_of(&self, index: usize) -> usize {
        self.sizes.get(index).copied().unwrap_or(0)
    }

    /// True if a single entry of `size` may never be stored.
    pub(crate) fn exceeds_entry_limit(&self, size: usize) -> bool {
        self.max_entry_size != 0 && size > self.max_entry_size
    }

    /// True while charging `size` would overflow the aggregate limit.
    pub(crate) fn needs_room(&self, size: usize) -> bool {
        self.max_size != 0 && self.total > 0 && self.total + size > self.max_size
    }

    /// Records `size` for a slot. The caller has already made room.
    pub(crate) fn charge(&mut self, index: usize, size: usize) {
        if self.sizes.len() <= index {
            self.sizes.resize(index + 1, 0);
        }
        self.sizes[index] = size;
        self.total += size;
    }

    /// Releases whatever size a slot was charged.
    pub(crate) fn remove(&mut self, index: usize) {
        if let Some(size) = self.sizes.get_mut(index) {
            self.total -= *size;
            *size = 0;
        }
    }

    pub(crate) fn reset(&mut self) {
        self.sizes.iter_mut().for_each(|size| *size = 0);
        self.total = 0;
    }
}

// == Require Size ==
/// Resolves the size of an entry from an explicit size or the calculator.
pub(crate) fn require_size<K, V>(
    key: &K,
    value: &V,
    explicit: Option<usize>,
    calculator: Option<&SizeCalculator<K, V>>,
) -> Result<usize> {
    if let Some(size) = explicit.filter(|size| *size > 0) {
        return Ok(size);
    }
    let calculator = calculator.ok_or_else(|| {
        CacheError::InvalidSize(
            "size tracking is enabled but no size or size_calculation was given".to_string(),
        )
    })?;
    match calculator(value, key) {
        0 => Err(CacheError::InvalidSize(
            "size_calculation must return a positive integer".to_string(),
        )),
        size => Ok(size),
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_charge_and_remove() {
        let mut tracker = SizeTracker::new(100, 100, 4);
        tracker.charge(0, 30);
        tracker.charge(2, 20);
        assert_eq!(tracker.total(), 50);
        assert_eq!(tracker.size_of(2), 20);

        tracker.remove(0);
        assert_eq!(tracker.total(), 20);
        assert_eq!(tracker.size_of(0), 0);

        // removing twice is harmless
        tracker.remove(0);
        assert_eq!(tracker.total(), 20);
    }

    #[test]
    fn test_needs_room() {
        let mut tracker = SizeTracker::new(10, 10, 2);
        assert!(!tracker.needs_room(10), "empty tracker never evicts");

        tracker.charge(0, 6);
        assert!(tracker.needs_room(5));
        assert!(!tracker.needs_room(4));
    }

    #[test]
    fn test_unbounded_total() {
        let mut tracker = SizeTracker::new(0, 10, 0);
        tracker.charge(5, 10);
        assert!(!tracker.needs_room(1_000));
        assert!(tracker.exceeds_entry_limit(11));
        assert!(!tracker.exceeds_entry_limit(10));
    }

    #[test]
    fn test_require_size() {
        let calc: SizeCalculator<&str, String> = Arc::new(|v: &String, _: &&str| v.len());

        let value = "hello".to_string();
        assert_eq!(require_size(&"k", &value, Some(3), Some(&calc)).unwrap(), 3);
        assert_eq!(require_size(&"k", &value, None, Some(&calc)).unwrap(), 5);

        let err = require_size::<&str, String>(&"k", &value, None, None).unwrap_err();
        assert!(matches!(err, CacheError::InvalidSize(_)));

        let empty = String::new();
        let err = require_size(&"k", &empty, None, Some(&calc)).unwrap_err();
        assert!(matches!(err, CacheError::InvalidSize(_)));
    }

    #[test]
    fn test_reset() {
        let mut tracker = SizeTracker::new(100, 100, 2);
        tracker.charge(0, 40);
        tracker.reset();
        assert_eq!(tracker.total(), 0);
        assert_eq!(tracker.size_of(0), 0);
    }
}
