//! Cache Options Module
//!
//! Construction options, per-call option overrides, and the callback types the
//! cache accepts.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, TryFutureExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cache::dispose::{DisposeReason, InsertReason};
use crate::config::Config;
use crate::error::{BoxError, CacheError, Result};

// == Callback Types ==
/// Synchronous removal hook, runs while the cache is locked.
pub type Disposer<K, V> = Arc<dyn Fn(&V, &K, DisposeReason) + Send + Sync>;
/// Deferred removal hook, runs after the cache lock is released.
pub type DisposeAfter<K, V> = Arc<dyn Fn(V, K, DisposeReason) + Send + Sync>;
/// Insertion observer.
pub type Inserter<K, V> = Arc<dyn Fn(&V, &K, InsertReason) + Send + Sync>;
/// Computes the size of an entry; must return a positive number.
pub type SizeCalculator<K, V> = Arc<dyn Fn(&V, &K) -> usize + Send + Sync>;
/// Future returned by a loader.
pub type FetchFuture<V> = BoxFuture<'static, std::result::Result<Option<V>, BoxError>>;
/// Asynchronous loader used by `fetch`.
pub type Fetcher<K, V, C> = Arc<dyn Fn(K, Option<V>, FetcherOptions<C>) -> FetchFuture<V> + Send + Sync>;
/// Synchronous compute function used by `memo`.
pub type Memoizer<K, V, C> = Arc<dyn Fn(&K, Option<&V>, MemoizerOptions<C>) -> V + Send + Sync>;

/// Arguments handed to the loader.
#[derive(Debug, Clone)]
pub struct FetcherOptions<C> {
    /// Fires when the fetch is cancelled; the loader may stop early
    pub signal: CancellationToken,
    /// Caller-supplied context
    pub context: Option<C>,
}

/// Arguments handed to the memoizer.
#[derive(Debug, Clone)]
pub struct MemoizerOptions<C> {
    pub context: Option<C>,
    pub force_refresh: bool,
}

// == Policy Flags ==
/// Cache-wide defaults for the per-call policies.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Flags {
    pub(crate) ttl: u64,
    pub(crate) allow_stale: bool,
    pub(crate) update_age_on_get: bool,
    pub(crate) update_age_on_has: bool,
    pub(crate) no_delete_on_stale_get: bool,
    pub(crate) no_dispose_on_set: bool,
    pub(crate) no_update_ttl: bool,
    pub(crate) no_delete_on_fetch_rejection: bool,
    pub(crate) allow_stale_on_fetch_rejection: bool,
    pub(crate) allow_stale_on_fetch_abort: bool,
    pub(crate) ignore_fetch_abort: bool,
}

impl Flags {
    pub(crate) fn get_params(&self, options: &GetOptions) -> GetParams {
        GetParams {
            allow_stale: options.allow_stale.unwrap_or(self.allow_stale),
            update_age_on_get: options.update_age_on_get.unwrap_or(self.update_age_on_get),
            no_delete_on_stale_get: options
                .no_delete_on_stale_get
                .unwrap_or(self.no_delete_on_stale_get),
        }
    }

    pub(crate) fn set_params(&self, options: &SetOptions) -> SetParams {
        SetParams {
            ttl: options.ttl.unwrap_or(self.ttl),
            start: options.start,
            size: options.size,
            no_dispose_on_set: options.no_dispose_on_set.unwrap_or(self.no_dispose_on_set),
            no_update_ttl: options.no_update_ttl.unwrap_or(self.no_update_ttl),
        }
    }

    pub(crate) fn has_params(&self, options: &HasOptions) -> HasParams {
        HasParams {
            update_age_on_has: options.update_age_on_has.unwrap_or(self.update_age_on_has),
        }
    }

    pub(crate) fn peek_allow_stale(&self, options: &PeekOptions) -> bool {
        options.allow_stale.unwrap_or(self.allow_stale)
    }

    pub(crate) fn fetch_policy<C>(&self, options: &FetchOptions<C>) -> FetchPolicy {
        FetchPolicy {
            no_delete_on_fetch_rejection: options
                .no_delete_on_fetch_rejection
                .unwrap_or(self.no_delete_on_fetch_rejection),
            allow_stale_on_fetch_rejection: options
                .allow_stale_on_fetch_rejection
                .unwrap_or(self.allow_stale_on_fetch_rejection),
            allow_stale_on_fetch_abort: options
                .allow_stale_on_fetch_abort
                .unwrap_or(self.allow_stale_on_fetch_abort),
            ignore_fetch_abort: options.ignore_fetch_abort.unwrap_or(self.ignore_fetch_abort),
        }
    }
}

// == Resolved Parameters ==
#[derive(Debug, Clone, Copy)]
pub(crate) struct GetParams {
    pub(crate) allow_stale: bool,
    pub(crate) update_age_on_get: bool,
    pub(crate) no_delete_on_stale_get: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SetParams {
    pub(crate) ttl: u64,
    pub(crate) start: Option<i64>,
    pub(crate) size: Option<usize>,
    pub(crate) no_dispose_on_set: bool,
    pub(crate) no_update_ttl: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct HasParams {
    pub(crate) update_age_on_has: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FetchPolicy {
    pub(crate) no_delete_on_fetch_rejection: bool,
    pub(crate) allow_stale_on_fetch_rejection: bool,
    pub(crate) allow_stale_on_fetch_abort: bool,
    pub(crate) ignore_fetch_abort: bool,
}

// == Per-call Options ==
/// Overrides for `get`. `None` falls back to the cache-wide setting.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    pub allow_stale: Option<bool>,
    pub update_age_on_get: Option<bool>,
    pub no_delete_on_stale_get: Option<bool>,
}

impl GetOptions {
    pub fn allow_stale(mut self, allow: bool) -> Self {
        self.allow_stale = Some(allow);
        self
    }

    pub fn update_age_on_get(mut self, update: bool) -> Self {
        self.update_age_on_get = Some(update);
        self
    }

    pub fn no_delete_on_stale_get(mut self, keep: bool) -> Self {
        self.no_delete_on_stale_get = Some(keep);
        self
    }
}

/// Overrides for `set`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Lifetime in milliseconds, 0 = never stale
    pub ttl: Option<u64>,
    /// Start of the lifetime on the cache's monotonic clock
    pub start: Option<i64>,
    /// Explicit entry size; ignored unless size tracking is enabled
    pub size: Option<usize>,
    pub no_dispose_on_set: Option<bool>,
    pub no_update_ttl: Option<bool>,
}

impl SetOptions {
    pub fn ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl = Some(ttl_ms);
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn no_dispose_on_set(mut self, skip: bool) -> Self {
        self.no_dispose_on_set = Some(skip);
        self
    }

    pub fn no_update_ttl(mut self, keep: bool) -> Self {
        self.no_update_ttl = Some(keep);
        self
    }
}

/// Overrides for `has`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HasOptions {
    pub update_age_on_has: Option<bool>,
}

/// Overrides for `peek`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeekOptions {
    pub allow_stale: Option<bool>,
}

/// Options for `fetch`.
#[derive(Debug, Clone)]
pub struct FetchOptions<C> {
    pub get: GetOptions,
    /// Applied when the fetched value is written back
    pub set: SetOptions,
    pub no_delete_on_fetch_rejection: Option<bool>,
    pub allow_stale_on_fetch_rejection: Option<bool>,
    pub allow_stale_on_fetch_abort: Option<bool>,
    pub ignore_fetch_abort: Option<bool>,
    /// Reload even if a fresh value is cached
    pub force_refresh: bool,
    pub context: Option<C>,
    /// External cancellation; firing it aborts this fetch
    pub signal: Option<CancellationToken>,
}

impl<C> Default for FetchOptions<C> {
    fn default() -> Self {
        Self {
            get: GetOptions::default(),
            set: SetOptions::default(),
            no_delete_on_fetch_rejection: None,
            allow_stale_on_fetch_rejection: None,
            allow_stale_on_fetch_abort: None,
            ignore_fetch_abort: None,
            force_refresh: false,
            context: None,
            signal: None,
        }
    }
}

impl<C> FetchOptions<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_stale(mut self, allow: bool) -> Self {
        self.get.allow_stale = Some(allow);
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn context(mut self, context: C) -> Self {
        self.context = Some(context);
        self
    }

    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn ttl(mut self, ttl_ms: u64) -> Self {
        self.set.ttl = Some(ttl_ms);
        self
    }

    pub fn allow_stale_on_fetch_rejection(mut self, allow: bool) -> Self {
        self.allow_stale_on_fetch_rejection = Some(allow);
        self
    }

    pub fn allow_stale_on_fetch_abort(mut self, allow: bool) -> Self {
        self.allow_stale_on_fetch_abort = Some(allow);
        self
    }

    pub fn no_delete_on_fetch_rejection(mut self, keep: bool) -> Self {
        self.no_delete_on_fetch_rejection = Some(keep);
        self
    }

    pub fn ignore_fetch_abort(mut self, ignore: bool) -> Self {
        self.ignore_fetch_abort = Some(ignore);
        self
    }
}

/// Options for `memo`.
#[derive(Debug, Clone)]
pub struct MemoOptions<C> {
    pub get: GetOptions,
    pub set: SetOptions,
    /// Recompute even if a fresh value is cached
    pub force_refresh: bool,
    pub context: Option<C>,
}

impl<C> Default for MemoOptions<C> {
    fn default() -> Self {
        Self {
            get: GetOptions::default(),
            set: SetOptions::default(),
            force_refresh: false,
            context: None,
        }
    }
}

impl<C> MemoOptions<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn context(mut self, context: C) -> Self {
        self.context = Some(context);
        self
    }
}

// == Cache Options ==
/// Construction options for [`crate::cache::LruCache`].
///
/// At least one of `max`, `max_size` or `ttl` must be set.
pub struct CacheOptions<K, V, C = ()> {
    pub(crate) max: usize,
    pub(crate) max_size: usize,
    pub(crate) max_entry_size: usize,
    pub(crate) ttl_resolution: u64,
    pub(crate) ttl_autopurge: bool,
    pub(crate) flags: Flags,
    pub(crate) size_calculation: Option<SizeCalculator<K, V>>,
    pub(crate) dispose: Option<Disposer<K, V>>,
    pub(crate) dispose_after: Option<DisposeAfter<K, V>>,
    pub(crate) on_insert: Option<Inserter<K, V>>,
    pub(crate) fetch_method: Option<Fetcher<K, V, C>>,
    pub(crate) memo_method: Option<Memoizer<K, V, C>>,
}

impl<K, V, C> Default for CacheOptions<K, V, C> {
    fn default() -> Self {
        Self {
            max: 0,
            max_size: 0,
            max_entry_size: 0,
            ttl_resolution: 1,
            ttl_autopurge: false,
            flags: Flags::default(),
            size_calculation: None,
            dispose: None,
            dispose_after: None,
            on_insert: None,
            fetch_method: None,
            memo_method: None,
        }
    }
}

impl<K, V, C> fmt::Debug for CacheOptions<K, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("max", &self.max)
            .field("max_size", &self.max_size)
            .field("max_entry_size", &self.max_entry_size)
            .field("ttl_resolution", &self.ttl_resolution)
            .field("ttl_autopurge", &self.ttl_autopurge)
            .field("flags", &self.flags)
            .field("fetch_method", &self.fetch_method.is_some())
            .field("memo_method", &self.memo_method.is_some())
            .finish_non_exhaustive()
    }
}

impl<K, V, C> CacheOptions<K, V, C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds options from environment-derived configuration.
    ///
    /// A non-zero `max_size` requires every `set` to carry an explicit size
    /// unless a `size_calculation` is added afterwards.
    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .max(config.max_entries)
            .max_size(config.max_size)
            .ttl(config.default_ttl_ms)
            .ttl_resolution(config.ttl_resolution_ms)
            .ttl_autopurge(config.ttl_autopurge)
    }

    // == Limits ==
    pub fn max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn max_entry_size(mut self, max_entry_size: usize) -> Self {
        self.max_entry_size = max_entry_size;
        self
    }

    // == TTL ==
    pub fn ttl(mut self, ttl_ms: u64) -> Self {
        self.flags.ttl = ttl_ms;
        self
    }

    pub fn ttl_resolution(mut self, resolution_ms: u64) -> Self {
        self.ttl_resolution = resolution_ms;
        self
    }

    pub fn ttl_autopurge(mut self, autopurge: bool) -> Self {
        self.ttl_autopurge = autopurge;
        self
    }

    // == Policies ==
    pub fn allow_stale(mut self, allow: bool) -> Self {
        self.flags.allow_stale = allow;
        self
    }

    pub fn update_age_on_get(mut self, update: bool) -> Self {
        self.flags.update_age_on_get = update;
        self
    }

    pub fn update_age_on_has(mut self, update: bool) -> Self {
        self.flags.update_age_on_has = update;
        self
    }

    pub fn no_delete_on_stale_get(mut self, keep: bool) -> Self {
        self.flags.no_delete_on_stale_get = keep;
        self
    }

    pub fn no_dispose_on_set(mut self, skip: bool) -> Self {
        self.flags.no_dispose_on_set = skip;
        self
    }

    pub fn no_update_ttl(mut self, keep: bool) -> Self {
        self.flags.no_update_ttl = keep;
        self
    }

    pub fn no_delete_on_fetch_rejection(mut self, keep: bool) -> Self {
        self.flags.no_delete_on_fetch_rejection = keep;
        self
    }

    pub fn allow_stale_on_fetch_rejection(mut self, allow: bool) -> Self {
        self.flags.allow_stale_on_fetch_rejection = allow;
        self
    }

    pub fn allow_stale_on_fetch_abort(mut self, allow: bool) -> Self {
        self.flags.allow_stale_on_fetch_abort = allow;
        self
    }

    pub fn ignore_fetch_abort(mut self, ignore: bool) -> Self {
        self.flags.ignore_fetch_abort = ignore;
        self
    }

    // == Callbacks ==
    pub fn size_calculation(mut self, calc: impl Fn(&V, &K) -> usize + Send + Sync + 'static) -> Self {
        self.size_calculation = Some(Arc::new(calc));
        self
    }

    pub fn dispose(mut self, hook: impl Fn(&V, &K, DisposeReason) + Send + Sync + 'static) -> Self {
        self.dispose = Some(Arc::new(hook));
        self
    }

    pub fn dispose_after(mut self, hook: impl Fn(V, K, DisposeReason) + Send + Sync + 'static) -> Self {
        self.dispose_after = Some(Arc::new(hook));
        self
    }

    pub fn on_insert(mut self, hook: impl Fn(&V, &K, InsertReason) + Send + Sync + 'static) -> Self {
        self.on_insert = Some(Arc::new(hook));
        self
    }

    /// Sets the loader used by `fetch`.
    ///
    /// Any error type convertible into a boxed error is accepted; it surfaces
    /// as [`CacheError::Population`].
    pub fn fetch_method<F, Fut, E>(mut self, loader: F) -> Self
    where
        F: Fn(K, Option<V>, FetcherOptions<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<V>, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
        K: 'static,
        V: Send + 'static,
        C: 'static,
    {
        let fetcher: Fetcher<K, V, C> = Arc::new(
            move |key: K, stale: Option<V>, options: FetcherOptions<C>| -> FetchFuture<V> {
                loader(key, stale, options).map_err(Into::into).boxed()
            },
        );
        self.fetch_method = Some(fetcher);
        self
    }

    pub fn memo_method(
        mut self,
        memo: impl Fn(&K, Option<&V>, MemoizerOptions<C>) -> V + Send + Sync + 'static,
    ) -> Self {
        self.memo_method = Some(Arc::new(memo));
        self
    }

    // == Validation ==
    /// Checks the construction invariants.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max == 0 && self.max_size == 0 && self.flags.ttl == 0 {
            return Err(CacheError::Configuration(
                "at least one of max, max_size, or ttl is required".to_string(),
            ));
        }
        if self.size_calculation.is_some() && self.max_size == 0 && self.max_entry_size == 0 {
            return Err(CacheError::Configuration(
                "cannot set size_calculation without setting max_size or max_entry_size".to_string(),
            ));
        }
        if self.max_size != 0 && self.max_entry_size > self.max_size {
            return Err(CacheError::Configuration(format!(
                "max_entry_size ({}) must not exceed max_size ({})",
                self.max_entry_size, self.max_size
            )));
        }
        if !self.ttl_autopurge && self.max == 0 && self.max_size == 0 {
            warn!("TTL caching without ttl_autopurge, max, or max_size can result in unbounded memory use");
        }
        Ok(())
    }

    /// The per-entry limit, defaulting to `max_size`.
    pub(crate) fn effective_max_entry_size(&self) -> usize {
        if self.max_entry_size != 0 {
            self.max_entry_size
        } else {
            self.max_size
        }
    }

    pub(crate) fn tracks_size(&self) -> bool {
        self.max_size != 0 || self.max_entry_size != 0
    }
}
