//! TTL Tracking Module
//!
//! Per-slot lifetimes and start times, the lazy staleness predicate, and the
//! optional eager purge timers.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::trace;

/// Called by an eager purge timer with the key and slot it was armed for.
pub(crate) type PurgeHook<K> = Arc<dyn Fn(K, usize) + Send + Sync>;

// == Remaining TTL ==
/// Result of [`crate::cache::LruCache::remaining_ttl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemainingTtl {
    /// The key is not in the cache
    Absent,
    /// The key is present and never goes stale
    Unlimited,
    /// Milliseconds left before the entry goes stale; negative once stale
    Millis(i64),
}

impl RemainingTtl {
    /// Milliseconds left, with `Absent` as 0 and `Unlimited` as `None`.
    pub fn as_millis(&self) -> Option<i64> {
        match self {
            RemainingTtl::Absent => Some(0),
            RemainingTtl::Unlimited => None,
            RemainingTtl::Millis(ms) => Some(*ms),
        }
    }
}

// == TTL Tracker ==
pub(crate) struct TtlTracker<K> {
    ttls: Vec<u64>,
    starts: Vec<i64>,
    /// Present only with autopurge
    timers: Option<Vec<Option<AbortHandle>>>,
    purge: Option<PurgeHook<K>>,
}

impl<K> std::fmt::Debug for TtlTracker<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlTracker")
            .field("slots", &self.ttls.len())
            .field("autopurge", &self.timers.is_some())
            .finish()
    }
}

impl<K: Clone + Send + 'static> TtlTracker<K> {
    pub(crate) fn new(capacity: usize, purge: Option<PurgeHook<K>>) -> Self {
        Self {
            ttls: vec![0; capacity],
            starts: vec![0; capacity],
            timers: purge.as_ref().map(|_| Vec::with_capacity(capacity)),
            purge,
        }
    }

    pub(crate) fn ttl(&self, index: usize) -> u64 {
        self.ttls.get(index).copied().unwrap_or(0)
    }

    pub(crate) fn start(&self, index: usize) -> i64 {
        self.starts.get(index).copied().unwrap_or(0)
    }

    // == Set ==
    /// Records a lifetime for a slot and, with autopurge, arms its timer.
    ///
    /// A zero `ttl` clears the slot's lifetime.
    pub(crate) fn set(&mut self, index: usize, key: &K, ttl: u64, start: i64) {
        self.ensure_slot(index);
        self.ttls[index] = ttl;
        self.starts[index] = if ttl != 0 { start } else { 0 };
        self.clear_timer(index);

        if ttl == 0 {
            return;
        }
        let (Some(purge), Some(timers)) = (self.purge.as_ref(), self.timers.as_mut()) else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            trace!("no runtime available, skipping purge timer");
            return;
        };

        let purge = Arc::clone(purge);
        let key = key.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(ttl + 1)).await;
            purge(key, index);
        });
        if timers.len() <= index {
            timers.resize_with(index + 1, || None);
        }
        timers[index] = Some(task.abort_handle());
    }

    /// Restarts a slot's lifetime at `now`.
    pub(crate) fn update_age(&mut self, index: usize, now: i64) {
        if self.ttl(index) != 0 {
            self.ensure_slot(index);
            self.starts[index] = now;
        }
    }

    /// Lazy staleness predicate.
    pub(crate) fn is_stale(&self, index: usize, now: i64) -> bool {
        let ttl = self.ttl(index);
        ttl != 0 && now - self.start(index) > ttl as i64
    }

    pub(crate) fn remaining(&self, index: usize, now: i64) -> RemainingTtl {
        match self.ttl(index) {
            0 => RemainingTtl::Unlimited,
            ttl => RemainingTtl::Millis(ttl as i64 - (now - self.start(index))),
        }
    }

    /// Forgets a slot's lifetime and aborts its timer.
    pub(crate) fn remove(&mut self, index: usize) {
        if index < self.ttls.len() {
            self.ttls[index] = 0;
            self.starts[index] = 0;
        }
        self.clear_timer(index);
    }

    pub(crate) fn clear_timer(&mut self, index: usize) {
        if let Some(timer) = self
            .timers
            .as_mut()
            .and_then(|timers| timers.get_mut(index))
            .and_then(Option::take)
        {
            timer.abort();
        }
    }

    pub(crate) fn reset(&mut self) {
        self.ttls.iter_mut().for_each(|ttl| *ttl = 0);
        self.starts.iter_mut().for_each(|start| *start = 0);
        self.abort_all();
    }

    fn abort_all(&mut self) {
        if let Some(timers) = self.timers.as_mut() {
            for timer in timers.iter_mut().filter_map(Option::take) {
                timer.abort();
            }
        }
    }

    fn ensure_slot(&mut self, index: usize) {
        if self.ttls.len() <= index {
            self.ttls.resize(index + 1, 0);
            self.starts.resize(index + 1, 0);
        }
    }
}

impl<K> Drop for TtlTracker<K> {
    fn drop(&mut self) {
        if let Some(timers) = self.timers.as_mut() {
            for timer in timers.iter_mut().filter_map(Option::take) {
                timer.abort();
            }
        }
    }
}
