//! LRU Cache Handle Module
//!
//! The public, cheaply clonable cache handle. Every operation locks the store,
//! runs synchronously, releases the lock and only then delivers deferred
//! disposal notifications.

use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cache::arena::SlotValue;
use crate::cache::dispose::{self, DisposeReason};
use crate::cache::entry::Entry;
use crate::cache::options::{
    CacheOptions, DisposeAfter, Fetcher, Flags, GetOptions, HasOptions, Memoizer, MemoOptions,
    MemoizerOptions, PeekOptions, SetOptions,
};
use crate::cache::stats::CacheStats;
use crate::cache::store::Store;
use crate::cache::ttl::{PurgeHook, RemainingTtl};
use crate::error::{CacheError, Result};

// == Shared State ==
pub(crate) struct Inner<K, V, C> {
    pub(crate) store: Mutex<Store<K, V>>,
    pub(crate) flags: Flags,
    pub(crate) fetch_method: Option<Fetcher<K, V, C>>,
    pub(crate) memo_method: Option<Memoizer<K, V, C>>,
    pub(crate) dispose_after: Option<DisposeAfter<K, V>>,
}

impl<K, V, C> Inner<K, V, C>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone,
{
    /// Runs `op` under the lock, then delivers queued disposals unlocked.
    pub(crate) fn locked<R>(&self, op: impl FnOnce(&mut Store<K, V>) -> R) -> R {
        let (out, tasks) = {
            let mut store = self.store.lock();
            let out = op(&mut store);
            (out, store.take_outbox())
        };
        if let Some(hook) = &self.dispose_after {
            if !tasks.is_empty() {
                dispose::deliver(hook, tasks);
            }
        }
        out
    }
}

// == LRU Cache ==
/// A bounded least-recently-used cache with optional size accounting, TTL
/// staleness and coalesced asynchronous fetches.
///
/// Clones share the same cache.
///
/// # Example
/// ```
/// use bytecache::{CacheOptions, LruCache};
///
/// let cache: LruCache<&str, u32> = LruCache::new(CacheOptions::new().max(2)).unwrap();
/// cache.set("a", 1).unwrap().set("b", 2).unwrap().set("c", 3).unwrap();
///
/// assert_eq!(cache.get(&"a"), None);
/// assert_eq!(cache.get(&"c"), Some(3));
/// ```
pub struct LruCache<K, V, C = ()> {
    pub(crate) inner: Arc<Inner<K, V, C>>,
}

impl<K, V, C> Clone for LruCache<K, V, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, C> fmt::Debug for LruCache<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("flags", &self.inner.flags)
            .field("fetch_method", &self.inner.fetch_method.is_some())
            .finish_non_exhaustive()
    }
}

/// Weak reference to a cache, see [`LruCache::downgrade`].
pub struct WeakLruCache<K, V, C = ()> {
    inner: Weak<Inner<K, V, C>>,
}

impl<K, V, C> Clone for WeakLruCache<K, V, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<K, V, C> WeakLruCache<K, V, C> {
    /// Returns the cache if it is still alive.
    pub fn upgrade(&self) -> Option<LruCache<K, V, C>> {
        self.inner.upgrade().map(|inner| LruCache { inner })
    }
}

impl<K, V, C> LruCache<K, V, C>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    // == Constructor ==
    /// Creates a cache, validating the options.
    pub fn new(options: CacheOptions<K, V, C>) -> Result<Self> {
        options.validate()?;
        info!(
            max = options.max,
            max_size = options.max_size,
            ttl = options.flags.ttl,
            ttl_autopurge = options.ttl_autopurge,
            "creating cache"
        );

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<K, V, C>>| {
            let purge_hook = options.ttl_autopurge.then(|| purge_hook(weak.clone()));
            Inner {
                store: Mutex::new(Store::new(&options, purge_hook)),
                flags: options.flags,
                fetch_method: options.fetch_method.clone(),
                memo_method: options.memo_method.clone(),
                dispose_after: options.dispose_after.clone(),
            }
        });
        Ok(Self { inner })
    }

    /// Returns a weak handle that does not keep the cache alive.
    pub fn downgrade(&self) -> WeakLruCache<K, V, C> {
        WeakLruCache {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn locked<R>(&self, op: impl FnOnce(&mut Store<K, V>) -> R) -> R {
        self.inner.locked(op)
    }

    // == Get ==
    /// Returns the value for `key`, marking it most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_with(key, GetOptions::default())
    }

    pub fn get_with(&self, key: &K, options: GetOptions) -> Option<V> {
        let params = self.inner.flags.get_params(&options);
        self.locked(|store| store.get(key, params))
    }

    // == Set ==
    /// Stores a value with the cache-wide defaults.
    pub fn set(&self, key: K, value: V) -> Result<&Self> {
        self.set_with(key, Some(value), SetOptions::default())
    }

    /// Stores a value; `None` deletes the key.
    ///
    /// Fails with [`CacheError::InvalidSize`] when size tracking is enabled
    /// and no size can be determined. An entry larger than the per-entry limit
    /// is silently not stored and any previous value is removed.
    pub fn set_with(&self, key: K, value: Option<V>, options: SetOptions) -> Result<&Self> {
        let params = self.inner.flags.set_params(&options);
        match value {
            Some(value) => {
                self.locked(|store| store.insert(key, SlotValue::Ready(value), &params))?;
            }
            None => {
                self.locked(|store| store.delete(&key, DisposeReason::Delete));
            }
        }
        Ok(self)
    }

    // == Has ==
    /// True if `key` is present and not stale. Does not update recency.
    pub fn has(&self, key: &K) -> bool {
        self.has_with(key, HasOptions::default())
    }

    pub fn has_with(&self, key: &K, options: HasOptions) -> bool {
        let params = self.inner.flags.has_params(&options);
        self.locked(|store| store.has(key, params))
    }

    // == Peek ==
    /// Returns the value without updating recency or deleting stale entries.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.peek_with(key, PeekOptions::default())
    }

    pub fn peek_with(&self, key: &K, options: PeekOptions) -> Option<V> {
        let allow_stale = self.inner.flags.peek_allow_stale(&options);
        self.locked(|store| store.peek(key, allow_stale))
    }

    // == Delete ==
    /// Removes `key`; true if it was present.
    pub fn delete(&self, key: &K) -> bool {
        self.locked(|store| store.delete(key, DisposeReason::Delete))
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.locked(|store| store.clear(DisposeReason::Delete));
    }

    /// Removes every stale entry; true if anything was removed.
    pub fn purge_stale(&self) -> bool {
        self.locked(|store| store.purge_stale())
    }

    /// Evicts and returns the least recently used value.
    pub fn pop(&self) -> Option<V> {
        self.locked(|store| store.pop())
    }

    // == Memo ==
    /// Returns the cached value or computes and stores it with the configured
    /// memo method. The memo method runs without the cache lock held.
    pub fn memo(&self, key: &K, options: MemoOptions<C>) -> Result<V> {
        let memo = self
            .inner
            .memo_method
            .clone()
            .ok_or(CacheError::MissingMethod("memo"))?;

        let MemoOptions {
            get,
            set,
            force_refresh,
            context,
        } = options;
        let current = self.get_with(key, get);
        if let (Some(value), false) = (&current, force_refresh) {
            return Ok(value.clone());
        }

        let value = memo(
            key,
            current.as_ref(),
            MemoizerOptions {
                context,
                force_refresh,
            },
        );
        self.set_with(key.clone(), Some(value.clone()), set)?;
        Ok(value)
    }

    // == Traversal ==
    /// `(key, value)` pairs from most to least recently used.
    ///
    /// Stale entries are included only when `allow_stale` is configured;
    /// entries whose fetch has no value yet are skipped.
    pub fn entries(&self) -> Vec<(K, V)> {
        let allow_stale = self.inner.flags.allow_stale;
        self.locked(|store| store.pairs(store.indexes(allow_stale)))
    }

    /// `(key, value)` pairs from least to most recently used.
    pub fn rentries(&self) -> Vec<(K, V)> {
        let allow_stale = self.inner.flags.allow_stale;
        self.locked(|store| store.pairs(store.rindexes(allow_stale)))
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries().into_iter().map(|(key, _)| key).collect()
    }

    pub fn rkeys(&self) -> Vec<K> {
        self.rentries().into_iter().map(|(key, _)| key).collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.entries().into_iter().map(|(_, value)| value).collect()
    }

    pub fn rvalues(&self) -> Vec<V> {
        self.rentries().into_iter().map(|(_, value)| value).collect()
    }

    /// Returns the first value, most recently used first, matching `pred`.
    ///
    /// A match is read with `get`, so it becomes most recently used.
    pub fn find(&self, pred: impl Fn(&V, &K) -> bool, options: GetOptions) -> Option<V> {
        let key = self
            .entries()
            .into_iter()
            .find(|(key, value)| pred(value, key))
            .map(|(key, _)| key)?;
        self.get_with(&key, options)
    }

    // == Dump / Load ==
    /// Portable snapshot of every entry, least recently used first.
    pub fn dump(&self) -> Vec<(K, Entry<V>)> {
        self.locked(|store| store.dump())
    }

    /// Clears the cache and inserts the given entries in order.
    ///
    /// Wall-clock starts are converted to this cache's clock, so remaining
    /// lifetimes carry over. Entries reporting a negative TTL are skipped.
    pub fn load(&self, entries: Vec<(K, Entry<V>)>) -> Result<()> {
        self.clear();
        let count = entries.len();
        for (key, entry) in entries {
            let ttl = match entry.ttl {
                Some(ttl) if ttl < 0 => {
                    debug!("skipping expired entry in load");
                    continue;
                }
                ttl => ttl.map(|ttl| ttl as u64),
            };
            let start = entry
                .start
                .map(|wall| self.locked(|store| store.clock().from_wall(wall)));
            let options = SetOptions {
                ttl,
                start,
                size: entry.size,
                ..SetOptions::default()
            };
            self.set_with(key, Some(entry.value), options)?;
        }
        debug!(count, "cache loaded");
        Ok(())
    }

    // == Introspection ==
    /// Entry metadata for `key`, stale entries included.
    ///
    /// `ttl` is the remaining lifetime (negative once stale) and `start` is
    /// the current wall-clock time.
    pub fn info(&self, key: &K) -> Option<Entry<V>> {
        self.locked(|store| store.info(key))
    }

    pub fn remaining_ttl(&self, key: &K) -> RemainingTtl {
        self.locked(|store| store.remaining_ttl(key))
    }

    /// Number of entries, stale and pending ones included.
    pub fn len(&self) -> usize {
        self.locked(|store| store.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate size of all entries, 0 without size tracking.
    pub fn calculated_size(&self) -> usize {
        self.locked(|store| store.calculated_size())
    }

    /// Count limit, 0 = unbounded by count.
    pub fn max(&self) -> usize {
        self.locked(|store| store.capacity())
    }

    /// Size limit, 0 = unbounded by size.
    pub fn max_size(&self) -> usize {
        self.locked(|store| store.max_size())
    }

    pub fn stats(&self) -> CacheStats {
        self.locked(|store| store.stats())
    }
}

/// Eager purge callback holding only a weak reference to the cache.
fn purge_hook<K, V, C>(weak: Weak<Inner<K, V, C>>) -> PurgeHook<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    Arc::new(move |key: K, index: usize| {
        if let Some(inner) = weak.upgrade() {
            inner.locked(|store| store.expire_slot(&key, index));
        }
    })
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::dispose::InsertReason;

    fn cache(max: usize) -> LruCache<String, String> {
        LruCache::new(CacheOptions::new().max(max)).unwrap()
    }

    fn key(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn test_new_rejects_unbounded() {
        let result: Result<LruCache<String, String>> = LruCache::new(CacheOptions::new());
        assert!(matches!(result, Err(CacheError::Configuration(_))));
    }

    #[test]
    fn test_set_and_get() {
        let cache = cache(10);
        cache.set(key("a"), "1".into()).unwrap();

        assert_eq!(cache.get(&key("a")), Some("1".to_string()));
        assert_eq!(cache.get(&key("missing")), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_overwrite_keeps_len() {
        let cache = cache(10);
        cache.set(key("a"), "1".into()).unwrap();
        cache.set(key("a"), "2".into()).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key("a")), Some("2".to_string()));
    }

    #[test]
    fn test_set_none_deletes() {
        let cache = cache(10);
        cache.set(key("a"), "1".into()).unwrap();
        cache.set_with(key("a"), None, SetOptions::default()).unwrap();

        assert!(!cache.has(&key("a")));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = cache(3);
        for k in ["a", "b", "c"] {
            cache.set(key(k), k.to_string()).unwrap();
        }

        // Access "a" so "b" becomes least recently used
        cache.get(&key("a"));
        cache.set(key("d"), "d".into()).unwrap();

        assert!(!cache.has(&key("b")));
        assert_eq!(cache.keys(), vec![key("d"), key("a"), key("c")]);
        assert_eq!(cache.rkeys(), vec![key("c"), key("a"), key("d")]);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_peek_and_has_do_not_touch_recency() {
        let cache = cache(2);
        cache.set(key("a"), "a".into()).unwrap();
        cache.set(key("b"), "b".into()).unwrap();

        assert_eq!(cache.peek(&key("a")), Some("a".to_string()));
        assert!(cache.has(&key("a")));
        cache.set(key("c"), "c".into()).unwrap();

        assert!(!cache.has(&key("a")), "peek/has must not protect from eviction");
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = cache(5);
        cache.set(key("a"), "a".into()).unwrap();
        cache.set(key("b"), "b".into()).unwrap();

        assert!(cache.delete(&key("a")));
        assert!(!cache.delete(&key("a")));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.keys(), Vec::<String>::new());
    }

    #[test]
    fn test_delete_reuses_slots() {
        let cache = cache(2);
        cache.set(key("a"), "a".into()).unwrap();
        cache.set(key("b"), "b".into()).unwrap();
        cache.delete(&key("a"));
        cache.set(key("c"), "c".into()).unwrap();

        assert!(cache.has(&key("b")), "free slot used instead of evicting");
        assert!(cache.has(&key("c")));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_pop_returns_lru() {
        let cache = cache(3);
        cache.set(key("a"), "1".into()).unwrap();
        cache.set(key("b"), "2".into()).unwrap();

        assert_eq!(cache.pop(), Some("1".to_string()));
        assert_eq!(cache.pop(), Some("2".to_string()));
        assert_eq!(cache.pop(), None);
    }

    #[test]
    fn test_dispose_and_insert_hooks() {
        let disposed = Arc::new(Mutex::new(Vec::new()));
        let inserted = Arc::new(Mutex::new(Vec::new()));
        let (d, i) = (disposed.clone(), inserted.clone());
        let cache: LruCache<String, String> = LruCache::new(
            CacheOptions::new()
                .max(1)
                .dispose(move |v: &String, k: &String, r: DisposeReason| {
                    d.lock().push((k.clone(), v.clone(), r))
                })
                .on_insert(move |_: &String, k: &String, r: InsertReason| {
                    i.lock().push((k.clone(), r))
                }),
        )
        .unwrap();

        cache.set(key("a"), "1".into()).unwrap();
        cache.set(key("a"), "2".into()).unwrap();
        cache.set(key("b"), "3".into()).unwrap();

        assert_eq!(
            *disposed.lock(),
            vec![
                (key("a"), "1".to_string(), DisposeReason::Set),
                (key("a"), "2".to_string(), DisposeReason::Evict),
            ]
        );
        assert_eq!(
            *inserted.lock(),
            vec![
                (key("a"), InsertReason::Add),
                (key("a"), InsertReason::Replace),
                (key("b"), InsertReason::Add),
            ]
        );
    }

    #[test]
    fn test_no_dispose_on_set() {
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let cache: LruCache<String, String> = LruCache::new(
            CacheOptions::new()
                .max(5)
                .no_dispose_on_set(true)
                .dispose(move |_: &String, _: &String, _: DisposeReason| *c.lock() += 1),
        )
        .unwrap();

        cache.set(key("a"), "1".into()).unwrap();
        cache.set(key("a"), "2".into()).unwrap();
        assert_eq!(*count.lock(), 0);

        cache.delete(&key("a"));
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_size_tracking_and_entry_limit() {
        let cache: LruCache<String, String> = LruCache::new(
            CacheOptions::new()
                .max_size(10)
                .max_entry_size(5)
                .size_calculation(|v: &String, _: &String| v.len()),
        )
        .unwrap();

        cache.set(key("a"), "1234".into()).unwrap();
        cache.set(key("b"), "1234".into()).unwrap();
        assert_eq!(cache.calculated_size(), 8);

        // Over the entry limit: not stored, existing value removed
        cache.set(key("a"), "123456".into()).unwrap();
        assert!(!cache.has(&key("a")));
        assert_eq!(cache.calculated_size(), 4);
        assert_eq!(cache.stats().size_rejections, 1);

        // Fits alongside "b"
        cache.set(key("c"), "12345".into()).unwrap();
        assert_eq!(cache.calculated_size(), 9);

        // Needs room: evicts from the head until it fits
        cache.set(key("d"), "12345".into()).unwrap();
        assert!(!cache.has(&key("b")));
        assert!(cache.has(&key("c")));
        assert_eq!(cache.calculated_size(), 10);
    }

    #[test]
    fn test_missing_size_is_an_error() {
        let cache: LruCache<String, String> =
            LruCache::new(CacheOptions::new().max_size(10)).unwrap();

        let err = cache.set(key("a"), "x".into()).unwrap_err();
        assert!(matches!(err, CacheError::InvalidSize(_)));
        assert!(cache.is_empty());

        cache
            .set_with(key("a"), Some("x".into()), SetOptions::default().size(3))
            .unwrap();
        assert_eq!(cache.calculated_size(), 3);
    }

    #[test]
    fn test_explicit_size_ignored_without_tracking() {
        let cache = cache(2);
        cache
            .set_with(key("a"), Some("x".into()), SetOptions::default().size(100))
            .unwrap();
        assert_eq!(cache.calculated_size(), 0);
        assert!(cache.has(&key("a")));
    }

    #[test]
    fn test_memo() {
        let cache: LruCache<String, usize> = LruCache::new(
            CacheOptions::new()
                .max(10)
                .memo_method(|k: &String, _: Option<&usize>, _: MemoizerOptions<()>| k.len()),
        )
        .unwrap();

        assert_eq!(cache.memo(&key("abc"), MemoOptions::new()).unwrap(), 3);
        assert_eq!(cache.get(&key("abc")), Some(3));

        cache.set(key("abc"), 99).unwrap();
        assert_eq!(cache.memo(&key("abc"), MemoOptions::new()).unwrap(), 99);
        assert_eq!(
            cache.memo(&key("abc"), MemoOptions::new().force_refresh()).unwrap(),
            3
        );
    }

    #[test]
    fn test_memo_without_method() {
        let cache = cache(2);
        let err = cache.memo(&key("a"), MemoOptions::new()).unwrap_err();
        assert!(matches!(err, CacheError::MissingMethod("memo")));
    }

    #[test]
    fn test_find_and_values() {
        let cache = cache(5);
        cache.set(key("a"), "apple".into()).unwrap();
        cache.set(key("b"), "banana".into()).unwrap();

        let found = cache.find(|v: &String, _: &String| v.starts_with('a'), GetOptions::default());
        assert_eq!(found, Some("apple".to_string()));
        assert_eq!(cache.values(), vec!["apple".to_string(), "banana".to_string()]);
        assert_eq!(cache.rvalues(), vec!["banana".to_string(), "apple".to_string()]);
    }

    #[test]
    fn test_downgrade() {
        let cache = cache(2);
        let weak = cache.downgrade();
        assert!(weak.upgrade().is_some());

        drop(cache);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_remaining_ttl_without_tracking() {
        let cache = cache(2);
        cache.set(key("a"), "a".into()).unwrap();

        assert_eq!(cache.remaining_ttl(&key("a")), RemainingTtl::Unlimited);
        assert_eq!(cache.remaining_ttl(&key("b")), RemainingTtl::Absent);
    }
}
