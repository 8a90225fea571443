//! Slot Arena Module
//!
//! Fixed-capacity parallel vectors holding keys, values and recency links per
//! slot index, plus a free-list of reusable indices.
//!
//! Recency is an intrusive doubly linked list over slot indices:
//! - `head` = least recently used
//! - `tail` = most recently used
//!
//! The arena does not know which slots are live; the store's index map is the
//! source of truth and a slot is live iff the map points back at it.

use crate::cache::fetch::InFlight;

// == Slot Value ==
/// What a slot's value position holds.
#[derive(Debug)]
pub(crate) enum SlotValue<V> {
    Empty,
    Ready(V),
    Pending(InFlight<V>),
}

impl<V> Default for SlotValue<V> {
    fn default() -> Self {
        SlotValue::Empty
    }
}

impl<V> SlotValue<V> {
    pub(crate) fn is_pending(&self) -> bool {
        matches!(self, SlotValue::Pending(_))
    }

    pub(crate) fn ready(&self) -> Option<&V> {
        match self {
            SlotValue::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// The value readers may see: a ready value, or the stale fallback of a
    /// pending fetch.
    pub(crate) fn visible(&self) -> Option<&V> {
        match self {
            SlotValue::Ready(value) => Some(value),
            SlotValue::Pending(record) => record.stale.as_ref(),
            SlotValue::Empty => None,
        }
    }
}

// == Slot Arena ==
#[derive(Debug)]
pub(crate) struct SlotArena<K, V> {
    keys: Vec<Option<K>>,
    values: Vec<SlotValue<V>>,
    next: Vec<usize>,
    prev: Vec<usize>,
    head: usize,
    tail: usize,
    free: Vec<usize>,
    len: usize,
    /// Maximum live slots, 0 = grow on demand
    capacity: usize,
}

impl<K, V> SlotArena<K, V> {
    // == Constructor ==
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            keys: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            next: Vec::with_capacity(capacity),
            prev: Vec::with_capacity(capacity),
            head: 0,
            tail: 0,
            free: Vec::with_capacity(capacity),
            len: 0,
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.capacity != 0 && self.len == self.capacity
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn head(&self) -> usize {
        self.head
    }

    pub(crate) fn tail(&self) -> usize {
        self.tail
    }

    pub(crate) fn prev(&self, index: usize) -> usize {
        self.prev[index]
    }

    pub(crate) fn next(&self, index: usize) -> usize {
        self.next[index]
    }

    pub(crate) fn key(&self, index: usize) -> Option<&K> {
        self.keys.get(index).and_then(|key| key.as_ref())
    }

    pub(crate) fn value(&self, index: usize) -> &SlotValue<V> {
        &self.values[index]
    }

    /// Swaps in a new value, returning the previous one.
    pub(crate) fn replace_value(&mut self, index: usize, value: SlotValue<V>) -> SlotValue<V> {
        std::mem::replace(&mut self.values[index], value)
    }

    pub(crate) fn pop_free(&mut self) -> Option<usize> {
        self.free.pop()
    }

    // == Occupy ==
    /// Stores a new entry at `index` and links it as most recently used.
    pub(crate) fn occupy(&mut self, index: usize, key: K, value: SlotValue<V>) {
        self.ensure_slot(index);
        self.keys[index] = Some(key);
        self.values[index] = value;
        self.next[self.tail] = index;
        self.prev[index] = self.tail;
        self.tail = index;
        self.len += 1;
    }

    // == Move To Tail ==
    /// Marks a slot as most recently used.
    pub(crate) fn move_to_tail(&mut self, index: usize) {
        if index == self.tail {
            return;
        }
        if index == self.head {
            self.head = self.next[index];
        } else {
            self.connect(self.prev[index], self.next[index]);
        }
        self.connect(self.tail, index);
        self.tail = index;
    }

    // == Pop Head ==
    /// Unlinks the least recently used slot and takes its key and value.
    ///
    /// With `free` the index goes back on the free list; otherwise the caller
    /// reuses it immediately.
    pub(crate) fn pop_head(&mut self, free: bool) -> (usize, Option<K>, SlotValue<V>) {
        let head = self.head;
        let key = self.keys[head].take();
        let value = std::mem::take(&mut self.values[head]);
        if free {
            self.free.push(head);
        }
        if self.len == 1 {
            self.head = 0;
            self.tail = 0;
            self.free.clear();
        } else {
            self.head = self.next[head];
        }
        self.len -= 1;
        (head, key, value)
    }

    // == Detach ==
    /// Unlinks an arbitrary slot, takes its key and value and frees the index.
    ///
    /// Must not be used for the last live slot; the store clears instead.
    pub(crate) fn detach(&mut self, index: usize) -> (Option<K>, SlotValue<V>) {
        let key = self.keys[index].take();
        let value = std::mem::take(&mut self.values[index]);
        if index == self.tail {
            self.tail = self.prev[index];
        } else if index == self.head {
            self.head = self.next[index];
        } else {
            self.connect(self.prev[index], self.next[index]);
        }
        self.len -= 1;
        self.free.push(index);
        (key, value)
    }

    /// Takes the key and value of a slot without touching the links.
    pub(crate) fn take(&mut self, index: usize) -> (Option<K>, SlotValue<V>) {
        (
            self.keys[index].take(),
            std::mem::take(&mut self.values[index]),
        )
    }

    // == Reset ==
    pub(crate) fn reset(&mut self) {
        self.keys.iter_mut().for_each(|key| *key = None);
        self.values.iter_mut().for_each(|value| *value = SlotValue::Empty);
        self.head = 0;
        self.tail = 0;
        self.free.clear();
        self.len = 0;
    }

    fn connect(&mut self, prev: usize, next: usize) {
        self.prev[next] = prev;
        self.next[prev] = next;
    }

    fn ensure_slot(&mut self, index: usize) {
        while self.keys.len() <= index {
            self.keys.push(None);
            self.values.push(SlotValue::Empty);
            self.next.push(0);
            self.prev.push(0);
        }
    }
}
