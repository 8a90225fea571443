//! Fetch Coordinator Module
//!
//! Coalesced asynchronous population of cache entries.
//!
//! An in-flight fetch lives in the value slot of its key as a pending record.
//! Every caller that finds the record awaits the same shared result; the
//! loader itself runs in a spawned driver task that re-validates the record
//! before writing anything back.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::cache::arena::SlotValue;
use crate::cache::dispose::DisposeReason;
use crate::cache::lru::{Inner, LruCache};
use crate::cache::options::{
    FetchFuture, FetchOptions, FetchPolicy, Fetcher, FetcherOptions, GetParams, SetParams,
};
use crate::cache::store::Store;
use crate::error::{BoxError, CacheError, CancelReason, Result};

/// Result shared by every caller waiting on the same fetch.
pub(crate) type SharedFetch<V> = Shared<BoxFuture<'static, Result<Option<V>>>>;

// == Fetch Signal ==
/// Cancellation handle of one fetch, remembering why it was cancelled.
#[derive(Debug, Clone)]
pub(crate) struct FetchSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

impl FetchSignal {
    /// Creates a signal that also fires when `parent` is cancelled.
    pub(crate) fn new(parent: Option<&CancellationToken>) -> Self {
        Self {
            token: parent.map_or_else(CancellationToken::new, CancellationToken::child_token),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Cancels the fetch. The first reason given is kept.
    pub(crate) fn cancel(&self, reason: CancelReason) {
        self.reason.lock().get_or_insert(reason);
        self.token.cancel();
    }

    /// Why the fetch was cancelled; an external token counts as `Aborted`.
    pub(crate) fn reason(&self) -> CancelReason {
        self.reason.lock().unwrap_or(CancelReason::Aborted)
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

// == In-flight Record ==
/// Pending fetch stored in a value slot.
pub(crate) struct InFlight<V> {
    /// Identity of this fetch; a slot holds the fetch iff the ids match
    pub(crate) id: u64,
    /// Value being replaced, served while the fetch runs
    pub(crate) stale: Option<V>,
    pub(crate) signal: FetchSignal,
    pub(crate) result: SharedFetch<V>,
}

impl<V> fmt::Debug for InFlight<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("id", &self.id)
            .field("has_stale", &self.stale.is_some())
            .field("cancelled", &self.signal.is_cancelled())
            .finish()
    }
}

/// What a fetch call does once the lock is released.
enum Plan<V> {
    Resolved(Option<V>),
    Await(SharedFetch<V>),
}

// == Fetch Operations ==
impl<K, V, C> LruCache<K, V, C>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    /// Returns the cached value or loads it with the configured fetch method.
    ///
    /// Concurrent fetches of the same key share one load. Without a fetch
    /// method this behaves like [`LruCache::get_with`].
    pub async fn fetch(&self, key: K, options: FetchOptions<C>) -> Result<Option<V>> {
        let Some(fetcher) = self.inner.fetch_method.clone() else {
            return Ok(self.get_with(&key, options.get));
        };

        let flags = self.inner.flags;
        let get = flags.get_params(&options.get);
        let set = flags.set_params(&options.set);
        let policy = flags.fetch_policy(&options);
        let FetchOptions {
            force_refresh,
            context,
            signal,
            ..
        } = options;

        let (plan, driver) = self.inner.locked(|store| {
            plan_fetch(&self.inner, store, &key, get, set, policy, force_refresh, signal.as_ref())
        })?;

        if let Some(driver) = driver {
            driver.launch(&fetcher, context);
        }

        match plan {
            Plan::Resolved(value) => Ok(value),
            Plan::Await(result) => result.await,
        }
    }

    /// Like [`LruCache::fetch`], but a load that produces nothing is an error.
    pub async fn force_fetch(&self, key: K, options: FetchOptions<C>) -> Result<V> {
        self.fetch(key, options).await?.ok_or(CacheError::EmptyFetch)
    }
}

/// Decides the fetch under the lock, registering a new record if needed.
#[allow(clippy::too_many_arguments)]
fn plan_fetch<K, V, C>(
    inner: &Arc<Inner<K, V, C>>,
    store: &mut Store<K, V>,
    key: &K,
    get: GetParams,
    set: SetParams,
    policy: FetchPolicy,
    force_refresh: bool,
    signal: Option<&CancellationToken>,
) -> Result<(Plan<V>, Option<FetchDriver<K, V, C>>)>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    let Some(index) = store.lookup(key) else {
        trace!("fetch miss, dispatching loader");
        let (result, driver) = dispatch(inner, store, key, None, set, policy, signal)?;
        return Ok((Plan::Await(result), Some(driver)));
    };

    if let SlotValue::Pending(record) = store.value(index) {
        let stale = record.stale.clone();
        let result = record.result.clone();
        store.stats_mut().record_coalesced();
        return Ok(match stale {
            Some(stale) if get.allow_stale => (Plan::Resolved(Some(stale)), None),
            _ => (Plan::Await(result), None),
        });
    }

    if !force_refresh && !store.is_stale(index) {
        let value = store.value(index).ready().cloned();
        store.touch(index, get.update_age_on_get);
        store.stats_mut().record_hit();
        return Ok((Plan::Resolved(value), None));
    }

    let (result, driver) = dispatch(inner, store, key, Some(index), set, policy, signal)?;
    Ok(match driver.stale.clone() {
        Some(stale) if get.allow_stale => (Plan::Resolved(Some(stale)), Some(driver)),
        _ => (Plan::Await(result), Some(driver)),
    })
}

/// Puts a new pending record in place and prepares its driver.
fn dispatch<K, V, C>(
    inner: &Arc<Inner<K, V, C>>,
    store: &mut Store<K, V>,
    key: &K,
    index: Option<usize>,
    set: SetParams,
    policy: FetchPolicy,
    signal: Option<&CancellationToken>,
) -> Result<(SharedFetch<V>, FetchDriver<K, V, C>)>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    let id = store.next_fetch_id();
    let signal = FetchSignal::new(signal);
    let (tx, rx) = oneshot::channel();
    let result: SharedFetch<V> = rx
        .map(|received| received.unwrap_or(Err(CacheError::Cancelled(CancelReason::Aborted))))
        .boxed()
        .shared();

    let stale = index.and_then(|index| store.take_ready(index));
    let record = InFlight {
        id,
        stale: stale.clone(),
        signal: signal.clone(),
        result: result.clone(),
    };
    match index {
        Some(index) => store.put_pending(index, record),
        None => {
            store.insert(key.clone(), SlotValue::Pending(record), &set)?;
        }
    }
    store.stats_mut().record_fetch();
    debug!(id, refresh = index.is_some(), "fetch dispatched");

    let driver = FetchDriver {
        cache: Arc::downgrade(inner),
        key: key.clone(),
        id,
        stale,
        signal,
        policy,
        set,
        reply: Some(tx),
    };
    Ok((result, driver))
}

// == Fetch Driver ==
/// Runs one loader and settles its record.
struct FetchDriver<K, V, C> {
    cache: Weak<Inner<K, V, C>>,
    key: K,
    id: u64,
    stale: Option<V>,
    signal: FetchSignal,
    policy: FetchPolicy,
    set: SetParams,
    reply: Option<oneshot::Sender<Result<Option<V>>>>,
}

impl<K, V, C> FetchDriver<K, V, C>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    /// Calls the loader outside the cache lock and spawns the driver.
    fn launch(self, fetcher: &Fetcher<K, V, C>, context: Option<C>) {
        let options = FetcherOptions {
            signal: self.signal.token().clone(),
            context,
        };
        let loader = fetcher(self.key.clone(), self.stale.clone(), options);
        tokio::spawn(self.run(loader));
    }

    async fn run(mut self, loader: FetchFuture<V>) {
        let mut loader = AssertUnwindSafe(loader)
            .catch_unwind()
            .map(|outcome| {
                outcome.unwrap_or_else(|_| Err(BoxError::from("fetch method panicked")))
            })
            .boxed();
        let token = self.signal.token().clone();

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            res = &mut loader => Some(res),
        };

        let result = match outcome {
            Some(res) => self.settle(res),
            None if self.policy.ignore_fetch_abort && !self.policy.allow_stale_on_fetch_abort => {
                trace!(id = self.id, "cancellation ignored, waiting for loader");
                match loader.await {
                    Ok(Some(value)) => match self.write_back(&value, true) {
                        Ok(()) => Ok(Some(value)),
                        Err(err) => self.fail(err, false),
                    },
                    Ok(None) => self.fail(CacheError::Cancelled(self.signal.reason()), true),
                    Err(err) => self.fail(CacheError::population(err), true),
                }
            }
            None => {
                let result = self.fail(CacheError::Cancelled(self.signal.reason()), true);
                if self.policy.ignore_fetch_abort {
                    self.reply(result);
                    self.finish_in_background(loader.await);
                    return;
                }
                result
            }
        };
        self.reply(result);
    }

    fn reply(&mut self, result: Result<Option<V>>) {
        if let Some(tx) = self.reply.take() {
            // Nobody waiting is fine: the caller may have taken the stale value
            let _ = tx.send(result);
        }
    }

    // == Settle ==
    /// Handles a loader result that arrived without cancellation.
    fn settle(&self, res: std::result::Result<Option<V>, BoxError>) -> Result<Option<V>> {
        match res {
            Ok(Some(value)) => match self.write_back(&value, false) {
                Ok(()) => Ok(Some(value)),
                Err(err) => self.fail(err, false),
            },
            Ok(None) => {
                if let Some(cache) = self.cache.upgrade() {
                    cache.locked(|store| {
                        if let Some(index) = store.holds_fetch(&self.key, self.id) {
                            if !store.restore_stale(index) {
                                store.delete(&self.key, DisposeReason::Fetch);
                            }
                        }
                    });
                }
                Ok(None)
            }
            Err(err) => self.fail(CacheError::population(err), false),
        }
    }

    /// Stores the loaded value if the slot still holds this fetch.
    ///
    /// With `or_absent` the value is also stored when the key has been removed
    /// meanwhile; a slot holding anything else is never overwritten.
    fn write_back(&self, value: &V, or_absent: bool) -> Result<()> {
        let Some(cache) = self.cache.upgrade() else {
            return Ok(());
        };
        cache.locked(|store| {
            let held = store.holds_fetch(&self.key, self.id).is_some();
            if held || (or_absent && store.lookup(&self.key).is_none()) {
                store.insert(self.key.clone(), SlotValue::Ready(value.clone()), &self.set)?;
            } else {
                trace!(id = self.id, "fetch superseded, result not stored");
            }
            Ok(())
        })
    }

    /// Completes a load that outlived its cancellation.
    fn finish_in_background(&self, res: std::result::Result<Option<V>, BoxError>) {
        match res {
            Ok(Some(value)) => {
                if let Err(err) = self.write_back(&value, true) {
                    warn!(error = %err, "late fetch result could not be stored");
                    self.restore();
                }
            }
            _ => self.restore(),
        }
    }

    fn restore(&self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.locked(|store| {
                if let Some(index) = store.holds_fetch(&self.key, self.id) {
                    store.restore_stale(index);
                }
            });
        }
    }

    // == Fail ==
    /// Applies the failure policy and produces the caller's result.
    fn fail(&self, err: CacheError, aborted: bool) -> Result<Option<V>> {
        let allow_stale_aborted = aborted && self.policy.allow_stale_on_fetch_abort;
        let allow_stale =
            allow_stale_aborted || (!aborted && self.policy.allow_stale_on_fetch_rejection);
        let no_delete = allow_stale || self.policy.no_delete_on_fetch_rejection;
        debug!(id = self.id, error = %err, allow_stale, "fetch failed");

        if let Some(cache) = self.cache.upgrade() {
            cache.locked(|store| {
                store.stats_mut().record_fetch_failure();
                let Some(index) = store.holds_fetch(&self.key, self.id) else {
                    return;
                };
                if !no_delete || !store.has_stale(index) {
                    store.delete(&self.key, DisposeReason::Fetch);
                } else if !(allow_stale_aborted && self.policy.ignore_fetch_abort) {
                    store.restore_stale(index);
                }
            });
        }

        if allow_stale {
            Ok(self.stale.clone())
        } else {
            Err(err)
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_keeps_first_reason() {
        let signal = FetchSignal::new(None);
        assert!(!signal.is_cancelled());

        signal.cancel(CancelReason::Evicted);
        signal.cancel(CancelReason::Deleted);

        assert!(signal.is_cancelled());
        assert_eq!(signal.reason(), CancelReason::Evicted);
    }

    #[test]
    fn test_parent_token_cancels_as_aborted() {
        let parent = CancellationToken::new();
        let signal = FetchSignal::new(Some(&parent));

        parent.cancel();

        assert!(signal.is_cancelled());
        assert_eq!(signal.reason(), CancelReason::Aborted);
    }

    #[test]
    fn test_child_cancel_leaves_parent() {
        let parent = CancellationToken::new();
        let signal = FetchSignal::new(Some(&parent));

        signal.cancel(CancelReason::Replaced);

        assert!(!parent.is_cancelled());
    }
}
