//! Cache Store Module
//!
//! The synchronous cache engine: slot arena, key index, recency list, size
//! and TTL trackers, and the single removal path shared by eviction, deletion,
//! expiry and overwrite.
//!
//! The store is always accessed under the handle's lock. Nothing here awaits.

use std::collections::HashMap;
use std::hash::Hash;

use tracing::{debug, trace};

use crate::cache::arena::{SlotArena, SlotValue};
use crate::cache::clock::{wall_now, TtlClock};
use crate::cache::dispose::{DisposeReason, DisposeTask, InsertReason};
use crate::cache::entry::Entry;
use crate::cache::fetch::InFlight;
use crate::cache::options::{
    CacheOptions, Disposer, GetParams, HasParams, Inserter, SetParams, SizeCalculator,
};
use crate::cache::size::{require_size, SizeTracker};
use crate::cache::stats::CacheStats;
use crate::cache::ttl::{PurgeHook, RemainingTtl, TtlTracker};
use crate::error::Result;

// == Cache Store ==
pub(crate) struct Store<K, V> {
    /// Keys, values and recency links per slot
    arena: SlotArena<K, V>,
    /// Key to slot; the source of truth for presence
    index: HashMap<K, usize>,
    sizes: Option<SizeTracker>,
    /// Created on demand the first time a TTL is written
    ttl: Option<TtlTracker<K>>,
    clock: TtlClock,
    purge_hook: Option<PurgeHook<K>>,
    size_calculation: Option<SizeCalculator<K, V>>,
    dispose: Option<Disposer<K, V>>,
    on_insert: Option<Inserter<K, V>>,
    /// Queue removals for `dispose_after`
    defer_disposal: bool,
    outbox: Vec<DisposeTask<K, V>>,
    stats: CacheStats,
    next_fetch_id: u64,
}

impl<K, V> Store<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone,
{
    // == Constructor ==
    /// Creates a store for validated options.
    ///
    /// `purge_hook` is given only when eager TTL purging is enabled.
    pub(crate) fn new<C>(options: &CacheOptions<K, V, C>, purge_hook: Option<PurgeHook<K>>) -> Self {
        let capacity = options.max;
        let sizes = options.tracks_size().then(|| {
            SizeTracker::new(options.max_size, options.effective_max_entry_size(), capacity)
        });
        let ttl = (options.flags.ttl != 0).then(|| TtlTracker::new(capacity, purge_hook.clone()));

        Self {
            arena: SlotArena::new(capacity),
            index: HashMap::with_capacity(capacity),
            sizes,
            ttl,
            clock: TtlClock::new(options.ttl_resolution),
            purge_hook,
            size_calculation: options.size_calculation.clone(),
            dispose: options.dispose.clone(),
            on_insert: options.on_insert.clone(),
            defer_disposal: options.dispose_after.is_some(),
            outbox: Vec::new(),
            stats: CacheStats::new(),
            next_fetch_id: 0,
        }
    }

    // == Accessors ==
    pub(crate) fn len(&self) -> usize {
        self.arena.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.arena.capacity()
    }

    pub(crate) fn calculated_size(&self) -> usize {
        self.sizes.as_ref().map_or(0, SizeTracker::total)
    }

    pub(crate) fn max_size(&self) -> usize {
        self.sizes.as_ref().map_or(0, SizeTracker::max_size)
    }

    pub(crate) fn clock(&self) -> &TtlClock {
        &self.clock
    }

    /// Snapshot of the counters with current gauges.
    pub(crate) fn stats(&self) -> CacheStats {
        let mut stats = self.stats.clone();
        stats.set_gauges(self.len(), self.calculated_size());
        stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut CacheStats {
        &mut self.stats
    }

    /// Drains the deferred disposal queue.
    pub(crate) fn take_outbox(&mut self) -> Vec<DisposeTask<K, V>> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn lookup(&self, key: &K) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub(crate) fn value(&self, index: usize) -> &SlotValue<V> {
        self.arena.value(index)
    }

    pub(crate) fn is_stale(&self, index: usize) -> bool {
        match &self.ttl {
            Some(ttl) => ttl.is_stale(index, self.clock.now()),
            None => false,
        }
    }

    /// True if the slot is live: its key maps back to it.
    fn is_valid(&self, index: usize) -> bool {
        self.arena
            .key(index)
            .and_then(|key| self.index.get(key))
            .is_some_and(|live| *live == index)
    }

    /// Marks a fresh slot as used by a read.
    pub(crate) fn touch(&mut self, index: usize, update_age: bool) {
        self.arena.move_to_tail(index);
        if update_age {
            self.update_age(index);
        }
    }

    fn update_age(&mut self, index: usize) {
        let now = self.clock.read();
        if let Some(ttl) = self.ttl.as_mut() {
            ttl.update_age(index, now);
        }
    }

    // == Get ==
    /// Reads a value, applying staleness and recency rules.
    pub(crate) fn get(&mut self, key: &K, params: GetParams) -> Option<V> {
        let Some(index) = self.lookup(key) else {
            self.stats.record_miss();
            return None;
        };

        if self.is_stale(index) {
            let value = self.arena.value(index).visible().cloned();
            if !self.arena.value(index).is_pending() && !params.no_delete_on_stale_get {
                self.delete(key, DisposeReason::Expire);
            }
            return match value {
                Some(value) if params.allow_stale => {
                    self.stats.record_stale_hit();
                    Some(value)
                }
                _ => {
                    self.stats.record_miss();
                    None
                }
            };
        }

        match self.arena.value(index) {
            // Only a forced refresh leaves a fresh stale fallback
            SlotValue::Pending(record) => {
                let value = record.stale.clone();
                match value {
                    Some(_) => self.stats.record_hit(),
                    None => self.stats.record_miss(),
                }
                value
            }
            SlotValue::Ready(value) => {
                let value = value.clone();
                self.touch(index, params.update_age_on_get);
                self.stats.record_hit();
                Some(value)
            }
            SlotValue::Empty => None,
        }
    }

    // == Insert ==
    /// Stores a value under `key`, evicting as needed.
    ///
    /// Returns the slot used, or `None` when the entry was too large to store.
    pub(crate) fn insert(
        &mut self,
        key: K,
        value: SlotValue<V>,
        params: &SetParams,
    ) -> Result<Option<usize>> {
        let size = match (&self.sizes, &value) {
            (Some(_), SlotValue::Ready(v)) => {
                require_size(&key, v, params.size, self.size_calculation.as_ref())?
            }
            _ => 0,
        };

        if self
            .sizes
            .as_ref()
            .is_some_and(|sizes| sizes.exceeds_entry_limit(size))
        {
            debug!(size, "entry exceeds max_entry_size, not stored");
            self.stats.record_size_rejection();
            self.delete(&key, DisposeReason::Set);
            return Ok(None);
        }

        let mut no_update_ttl = params.no_update_ttl;
        let index = match self.lookup(&key) {
            None => {
                let index = self.next_slot();
                self.arena.occupy(index, key.clone(), value);
                self.index.insert(key.clone(), index);
                self.add_item_size(index, size);
                no_update_ttl = false;
                self.notify_insert(index, &key, InsertReason::Add);
                index
            }
            Some(index) => {
                self.arena.move_to_tail(index);
                let old = self.arena.replace_value(index, value);
                self.release_value(old, key.clone(), DisposeReason::Set, params.no_dispose_on_set);
                if let Some(sizes) = self.sizes.as_mut() {
                    sizes.remove(index);
                }
                self.add_item_size(index, size);
                self.notify_insert(index, &key, InsertReason::Replace);
                index
            }
        };

        if params.ttl != 0 && self.ttl.is_none() {
            trace!("initializing TTL tracking");
            self.ttl = Some(TtlTracker::new(self.capacity(), self.purge_hook.clone()));
        }
        if !no_update_ttl {
            let start = params.start.unwrap_or_else(|| self.clock.read());
            if let Some(ttl) = self.ttl.as_mut() {
                ttl.set(index, &key, params.ttl, start);
            }
        }
        Ok(Some(index))
    }

    /// Picks the slot for a new key.
    fn next_slot(&mut self) -> usize {
        if self.arena.is_empty() {
            self.arena.tail()
        } else if let Some(free) = self.arena.pop_free() {
            free
        } else if self.arena.is_full() {
            self.evict(false)
        } else {
            self.arena.len()
        }
    }

    fn notify_insert(&self, index: usize, key: &K, reason: InsertReason) {
        if let (Some(hook), Some(value)) = (&self.on_insert, self.arena.value(index).ready()) {
            hook(value, key, reason);
        }
    }

    fn add_item_size(&mut self, index: usize, size: usize) {
        while self
            .sizes
            .as_ref()
            .is_some_and(|sizes| sizes.needs_room(size))
        {
            self.evict(true);
        }
        if let Some(sizes) = self.sizes.as_mut() {
            sizes.charge(index, size);
        }
    }

    // == Has ==
    pub(crate) fn has(&mut self, key: &K, params: HasParams) -> bool {
        let Some(index) = self.lookup(key) else {
            return false;
        };
        if self.arena.value(index).visible().is_none() {
            return false;
        }
        if self.is_stale(index) {
            return false;
        }
        if params.update_age_on_has {
            self.update_age(index);
        }
        true
    }

    // == Peek ==
    pub(crate) fn peek(&self, key: &K, allow_stale: bool) -> Option<V> {
        let index = self.lookup(key)?;
        if !allow_stale && self.is_stale(index) {
            return None;
        }
        self.arena.value(index).visible().cloned()
    }

    // == Delete ==
    /// Removes a key through the disposal pipeline.
    pub(crate) fn delete(&mut self, key: &K, reason: DisposeReason) -> bool {
        let Some(index) = self.lookup(key) else {
            return false;
        };
        if self.arena.len() == 1 {
            self.clear(reason);
            return true;
        }

        self.forget_slot(index);
        self.index.remove(key);
        let (key, value) = self.arena.detach(index);
        if let Some(key) = key {
            self.release_value(value, key, reason, false);
        }
        if reason == DisposeReason::Expire {
            self.stats.record_expiration();
        }
        true
    }

    // == Clear ==
    /// Removes every entry, LRU first.
    pub(crate) fn clear(&mut self, reason: DisposeReason) {
        for index in self.rindexes(true) {
            let (key, value) = self.arena.take(index);
            if let Some(key) = key {
                self.release_value(value, key, reason, false);
                if reason == DisposeReason::Expire {
                    self.stats.record_expiration();
                }
            }
        }

        self.index.clear();
        self.arena.reset();
        if let Some(ttl) = self.ttl.as_mut() {
            ttl.reset();
        }
        if let Some(sizes) = self.sizes.as_mut() {
            sizes.reset();
        }
    }

    // == Evict ==
    /// Removes the least recently used entry and returns its slot.
    ///
    /// With `free` the slot goes back on the free list; otherwise the caller
    /// reuses it immediately.
    pub(crate) fn evict(&mut self, free: bool) -> usize {
        let head = self.arena.head();
        self.forget_slot(head);
        let (head, key, value) = self.arena.pop_head(free);
        if let Some(key) = key {
            self.index.remove(&key);
            self.release_value(value, key, DisposeReason::Evict, false);
        }
        self.stats.record_eviction();
        head
    }

    /// Releases tracker state held for a slot.
    fn forget_slot(&mut self, index: usize) {
        if let Some(sizes) = self.sizes.as_mut() {
            sizes.remove(index);
        }
        if let Some(ttl) = self.ttl.as_mut() {
            ttl.remove(index);
        }
    }

    /// Runs the disposal steps for a value leaving its slot.
    ///
    /// An in-flight fetch is cancelled; its stale fallback, if any, is the
    /// value disposed. `quiet` suppresses the hooks but not cancellation.
    fn release_value(&mut self, value: SlotValue<V>, key: K, reason: DisposeReason, quiet: bool) {
        let value = match value {
            SlotValue::Empty => None,
            SlotValue::Ready(value) => Some(value),
            SlotValue::Pending(record) => {
                trace!(?reason, "cancelling in-flight fetch");
                record.signal.cancel(reason.cancel_reason());
                record.stale
            }
        };
        if quiet {
            return;
        }
        if let Some(value) = value {
            if let Some(dispose) = &self.dispose {
                dispose(&value, &key, reason);
            }
            if self.defer_disposal {
                self.outbox.push(DisposeTask { value, key, reason });
            }
        }
    }

    // == Purge Stale ==
    /// Deletes every stale entry; true if anything was removed.
    pub(crate) fn purge_stale(&mut self) -> bool {
        let stale: Vec<K> = self
            .rindexes(true)
            .into_iter()
            .filter(|index| self.is_stale(*index))
            .filter_map(|index| self.arena.key(index).cloned())
            .collect();

        for key in &stale {
            self.delete(key, DisposeReason::Expire);
        }
        !stale.is_empty()
    }

    /// Deletes a key on behalf of its purge timer if the slot is unchanged.
    pub(crate) fn expire_slot(&mut self, key: &K, index: usize) -> bool {
        // Bypass the debounced reading: the timer fires exactly once
        let stale = self
            .ttl
            .as_ref()
            .is_some_and(|ttl| ttl.is_stale(index, self.clock.read()));
        if self.lookup(key) == Some(index) && stale {
            trace!(index, "purge timer expired entry");
            self.delete(key, DisposeReason::Expire)
        } else {
            false
        }
    }

    // == Pop ==
    /// Evicts and returns the least recently used value.
    ///
    /// Pending entries without a stale value are evicted and skipped.
    pub(crate) fn pop(&mut self) -> Option<V> {
        while !self.arena.is_empty() {
            let value = self.arena.value(self.arena.head()).visible().cloned();
            self.evict(true);
            if value.is_some() {
                return value;
            }
        }
        None
    }

    // == Traversal ==
    /// Live slots from most to least recently used.
    pub(crate) fn indexes(&self, allow_stale: bool) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len());
        if self.arena.is_empty() {
            return out;
        }
        let mut index = self.arena.tail();
        loop {
            if !self.is_valid(index) {
                break;
            }
            if allow_stale || !self.is_stale(index) {
                out.push(index);
            }
            if index == self.arena.head() {
                break;
            }
            index = self.arena.prev(index);
        }
        out
    }

    /// Live slots from least to most recently used.
    pub(crate) fn rindexes(&self, allow_stale: bool) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len());
        if self.arena.is_empty() {
            return out;
        }
        let mut index = self.arena.head();
        loop {
            if !self.is_valid(index) {
                break;
            }
            if allow_stale || !self.is_stale(index) {
                out.push(index);
            }
            if index == self.arena.tail() {
                break;
            }
            index = self.arena.next(index);
        }
        out
    }

    /// Key and visible value for each slot, skipping pending placeholders.
    pub(crate) fn pairs(&self, indexes: Vec<usize>) -> Vec<(K, V)> {
        indexes
            .into_iter()
            .filter_map(|index| {
                let key = self.arena.key(index)?.clone();
                let value = self.arena.value(index).visible()?.clone();
                Some((key, value))
            })
            .collect()
    }

    // == Dump ==
    /// Portable snapshot, least recently used first, stale entries included.
    pub(crate) fn dump(&self) -> Vec<(K, Entry<V>)> {
        self.rindexes(true)
            .into_iter()
            .filter_map(|index| {
                let key = self.arena.key(index)?.clone();
                let mut entry = Entry::new(self.arena.value(index).visible()?.clone());
                if let Some(ttl) = &self.ttl {
                    let lifetime = ttl.ttl(index);
                    entry.ttl = Some(lifetime as i64);
                    if lifetime != 0 {
                        entry.start = Some(self.clock.to_wall(ttl.start(index)));
                    }
                }
                if let Some(sizes) = &self.sizes {
                    entry.size = Some(sizes.size_of(index));
                }
                Some((key, entry))
            })
            .collect()
    }

    // == Info ==
    /// Entry with remaining TTL and the current wall-clock time as start.
    pub(crate) fn info(&self, key: &K) -> Option<Entry<V>> {
        let index = self.lookup(key)?;
        let mut entry = Entry::new(self.arena.value(index).visible()?.clone());
        if let Some(ttl) = &self.ttl {
            if let RemainingTtl::Millis(remaining) = ttl.remaining(index, self.clock.read()) {
                entry.ttl = Some(remaining);
                entry.start = Some(wall_now());
            }
        }
        if let Some(sizes) = &self.sizes {
            entry.size = Some(sizes.size_of(index));
        }
        Some(entry)
    }

    pub(crate) fn remaining_ttl(&self, key: &K) -> RemainingTtl {
        let Some(index) = self.lookup(key) else {
            return RemainingTtl::Absent;
        };
        match &self.ttl {
            Some(ttl) => ttl.remaining(index, self.clock.now()),
            None => RemainingTtl::Unlimited,
        }
    }

    // == Fetch Support ==
    pub(crate) fn next_fetch_id(&mut self) -> u64 {
        self.next_fetch_id += 1;
        self.next_fetch_id
    }

    /// Takes a ready value out of its slot to become a fetch's stale fallback.
    ///
    /// The slot keeps its key, links and size; the caller must put a pending
    /// record back before releasing the lock.
    pub(crate) fn take_ready(&mut self, index: usize) -> Option<V> {
        match self.arena.replace_value(index, SlotValue::Empty) {
            SlotValue::Ready(value) => Some(value),
            other => {
                self.arena.replace_value(index, other);
                None
            }
        }
    }

    pub(crate) fn put_pending(&mut self, index: usize, record: InFlight<V>) {
        self.arena.replace_value(index, SlotValue::Pending(record));
    }

    /// The slot holding the fetch with `id` under `key`, if it is still there.
    pub(crate) fn holds_fetch(&self, key: &K, id: u64) -> Option<usize> {
        let index = self.lookup(key)?;
        match self.arena.value(index) {
            SlotValue::Pending(record) if record.id == id => Some(index),
            _ => None,
        }
    }

    pub(crate) fn has_stale(&self, index: usize) -> bool {
        matches!(self.arena.value(index), SlotValue::Pending(record) if record.stale.is_some())
    }

    /// Replaces a finished fetch record with its stale fallback.
    pub(crate) fn restore_stale(&mut self, index: usize) -> bool {
        match self.arena.replace_value(index, SlotValue::Empty) {
            SlotValue::Pending(InFlight {
                stale: Some(stale), ..
            }) => {
                self.arena.replace_value(index, SlotValue::Ready(stale));
                true
            }
            other => {
                self.arena.replace_value(index, other);
                false
            }
        }
    }
}
