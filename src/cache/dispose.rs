//! Disposal Module
//!
//! Removal reasons and the deferred disposal outbox.
//!
//! The synchronous `dispose` hook runs while the cache is locked. Deferred
//! notifications are queued in the store and delivered by the handle once the
//! lock has been released, so a `dispose_after` hook may call back into the
//! cache, including re-inserting the key it was told about.

use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::options::DisposeAfter;
use crate::error::CancelReason;

// == Dispose Reason ==
/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisposeReason {
    /// Removed to make room (count or size limit)
    Evict,
    /// Overwritten by a new value
    Set,
    /// Removed by `delete` or `clear`
    Delete,
    /// Removed because its TTL elapsed
    Expire,
    /// Removed because a fetch produced no value or failed
    Fetch,
}

impl DisposeReason {
    /// The cancellation reason reported to an in-flight fetch removed this way.
    pub(crate) fn cancel_reason(self) -> CancelReason {
        match self {
            DisposeReason::Evict => CancelReason::Evicted,
            DisposeReason::Set => CancelReason::Replaced,
            DisposeReason::Delete | DisposeReason::Expire | DisposeReason::Fetch => {
                CancelReason::Deleted
            }
        }
    }
}

// == Insert Reason ==
/// Why the insertion observer was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertReason {
    /// The key was not present before
    Add,
    /// An existing value was replaced
    Replace,
}

// == Dispose Task ==
/// A queued post-removal notification.
#[derive(Debug)]
pub(crate) struct DisposeTask<K, V> {
    pub(crate) value: V,
    pub(crate) key: K,
    pub(crate) reason: DisposeReason,
}

/// Delivers every queued notification, in order.
///
/// A panicking hook does not stop the batch: the remaining tasks are still
/// delivered and the first panic is resumed afterwards.
pub(crate) fn deliver<K, V>(hook: &DisposeAfter<K, V>, tasks: Vec<DisposeTask<K, V>>) {
    let mut first_panic = None;

    for task in tasks {
        let DisposeTask { value, key, reason } = task;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| hook(value, key, reason)));
        if let Err(payload) = outcome {
            if first_panic.is_none() {
                first_panic = Some(payload);
            } else {
                warn!(?reason, "dispose_after hook panicked again in the same batch");
            }
        }
    }

    if let Some(payload) = first_panic {
        panic::resume_unwind(payload);
    }
}
