//! Configuration Module
//!
//! Handles loading cache limits and TTL settings from environment variables.

use std::env;
use std::str::FromStr;

/// Cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of entries the cache can hold (0 = unbounded by count)
    pub max_entries: usize,
    /// Maximum aggregate entry size (0 = unbounded by size)
    pub max_size: usize,
    /// Default TTL in milliseconds for entries without explicit TTL (0 = none)
    pub default_ttl_ms: u64,
    /// How long a clock read is reused for staleness checks, in milliseconds
    pub ttl_resolution_ms: u64,
    /// Arm a purge timer for every entry with a TTL
    pub ttl_autopurge: bool,
    /// Background sweep interval in milliseconds
    pub purge_interval_ms: u64,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `MAX_ENTRIES` - Maximum cache entries (default: 1000)
    /// - `MAX_SIZE` - Maximum aggregate size (default: 0)
    /// - `DEFAULT_TTL_MS` - Default TTL in milliseconds (default: 300000)
    /// - `TTL_RESOLUTION_MS` - Clock read debounce (default: 1)
    /// - `TTL_AUTOPURGE` - Eager per-entry purge, `true`/`false` (default: false)
    /// - `PURGE_INTERVAL_MS` - Sweep frequency in milliseconds (default: 1000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_entries: env_or("MAX_ENTRIES", defaults.max_entries),
            max_size: env_or("MAX_SIZE", defaults.max_size),
            default_ttl_ms: env_or("DEFAULT_TTL_MS", defaults.default_ttl_ms),
            ttl_resolution_ms: env_or("TTL_RESOLUTION_MS", defaults.ttl_resolution_ms),
            ttl_autopurge: env_or("TTL_AUTOPURGE", defaults.ttl_autopurge),
            purge_interval_ms: env_or("PURGE_INTERVAL_MS", defaults.purge_interval_ms),
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_size: 0,
            default_ttl_ms: 300_000,
            ttl_resolution_ms: 1,
            ttl_autopurge: false,
            purge_interval_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.max_entries, 1000);
        assert_eq!(config.max_size, 0);
        assert_eq!(config.default_ttl_ms, 300_000);
        assert_eq!(config.ttl_resolution_ms, 1);
        assert!(!config.ttl_autopurge);
        assert_eq!(config.purge_interval_ms, 1000);
    }

    #[test]
    fn test_config_from_env_defaults() {
        // Clear any existing env vars to test defaults
        for name in [
            "MAX_ENTRIES",
            "MAX_SIZE",
            "DEFAULT_TTL_MS",
            "TTL_RESOLUTION_MS",
            "TTL_AUTOPURGE",
            "PURGE_INTERVAL_MS",
        ] {
            env::remove_var(name);
        }

        let config = Config::from_env();
        assert_eq!(config.max_entries, 1000);
        assert_eq!(config.default_ttl_ms, 300_000);
        assert!(!config.ttl_autopurge);
    }

    #[test]
    fn test_env_or_ignores_unparseable_values() {
        env::set_var("BYTECACHE_TEST_BAD_NUMBER", "not-a-number");
        assert_eq!(env_or("BYTECACHE_TEST_BAD_NUMBER", 7usize), 7);
        env::remove_var("BYTECACHE_TEST_BAD_NUMBER");
    }
}
