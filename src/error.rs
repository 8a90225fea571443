//! Error types for the cache
//!
//! Provides unified error handling using thiserror.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error returned by user-supplied loaders.
pub type BoxError = Box<dyn StdError + Send + Sync>;

// == Cancel Reason ==
/// Why an in-flight fetch was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The slot was evicted to make room for another entry
    Evicted,
    /// The key was overwritten by `set`
    Replaced,
    /// The key was deleted, expired or cleared
    Deleted,
    /// The caller's cancellation token fired
    Aborted,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CancelReason::Evicted => "evicted",
            CancelReason::Replaced => "replaced",
            CancelReason::Deleted => "deleted",
            CancelReason::Aborted => "aborted",
        };
        f.write_str(reason)
    }
}

// == Cache Error Enum ==
/// Unified error type for the cache.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Invalid capacity, size or TTL options at construction
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A size was required for the entry but could not be computed
    #[error("Invalid size: {0}")]
    InvalidSize(String),

    /// The in-flight fetch was cancelled before it produced a value
    #[error("Fetch cancelled: {0}")]
    Cancelled(CancelReason),

    /// The loader failed
    #[error("Fetch failed: {0}")]
    Population(Arc<dyn StdError + Send + Sync>),

    /// The operation needs a callback that was not configured
    #[error("No {0} method configured")]
    MissingMethod(&'static str),

    /// `force_fetch` resolved without a value
    #[error("Fetch resolved without a value")]
    EmptyFetch,
}

impl CacheError {
    /// Wraps a loader failure.
    pub fn population(err: BoxError) -> Self {
        CacheError::Population(Arc::from(err))
    }

    /// Returns true if this error is a fetch cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::Cancelled(_))
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::Cancelled(CancelReason::Evicted);
        assert_eq!(err.to_string(), "Fetch cancelled: evicted");

        let err = CacheError::MissingMethod("memo");
        assert_eq!(err.to_string(), "No memo method configured");
    }

    #[test]
    fn test_population_wraps_source() {
        let err = CacheError::population("upstream timed out".into());
        assert!(!err.is_cancelled());
        assert_eq!(err.to_string(), "Fetch failed: upstream timed out");

        // Clones share the same source
        let copy = err.clone();
        assert_eq!(copy.to_string(), err.to_string());
    }
}
