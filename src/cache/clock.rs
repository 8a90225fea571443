//! Clock Module
//!
//! Monotonic milliseconds for staleness checks, debounced so hot reads do not
//! hit the system clock every time, plus conversion to and from portable
//! wall-clock timestamps used by snapshots.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Marker for "no cached reading".
const EMPTY: i64 = i64::MIN;

// == TTL Clock ==
/// Monotonic clock measured in milliseconds since the cache was created.
///
/// Readings taken through [`TtlClock::now`] are reused for `resolution`; a
/// short-lived tokio timer clears the cached reading. Without a runtime, or
/// with a zero resolution, every call reads the clock.
#[derive(Debug)]
pub(crate) struct TtlClock {
    origin: Instant,
    resolution: Duration,
    cached: Arc<AtomicI64>,
    reset: Mutex<Option<AbortHandle>>,
}

impl TtlClock {
    pub(crate) fn new(resolution_ms: u64) -> Self {
        Self {
            origin: Instant::now(),
            resolution: Duration::from_millis(resolution_ms),
            cached: Arc::new(AtomicI64::new(EMPTY)),
            reset: Mutex::new(None),
        }
    }

    // == Read ==
    /// Reads the clock without consulting the cache.
    pub(crate) fn read(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }

    // == Now ==
    /// Returns the cached reading if one is still valid, else reads the clock.
    pub(crate) fn now(&self) -> i64 {
        let cached = self.cached.load(Ordering::Acquire);
        if cached != EMPTY {
            return cached;
        }

        let now = self.read();
        if self.resolution.is_zero() {
            return now;
        }
        if let Ok(runtime) = Handle::try_current() {
            self.cached.store(now, Ordering::Release);
            let cell = Arc::downgrade(&self.cached);
            let resolution = self.resolution;
            let task = runtime.spawn(async move {
                tokio::time::sleep(resolution).await;
                if let Some(cell) = cell.upgrade() {
                    cell.store(EMPTY, Ordering::Release);
                }
            });
            if let Some(previous) = self.reset.lock().replace(task.abort_handle()) {
                previous.abort();
            }
        }
        now
    }

    // == Wall Clock Conversion ==
    /// Converts a monotonic timestamp into wall-clock milliseconds since the epoch.
    pub(crate) fn to_wall(&self, mono: i64) -> i64 {
        wall_now() - (self.read() - mono)
    }

    /// Converts wall-clock milliseconds since the epoch into this clock's timeline.
    ///
    /// The result may be negative when the timestamp predates this clock.
    pub(crate) fn from_wall(&self, wall: i64) -> i64 {
        self.read() - (wall_now() - wall)
    }
}

impl Drop for TtlClock {
    fn drop(&mut self) {
        if let Some(task) = self.reset.lock().take() {
            task.abort();
        }
    }
}

/// Returns current Unix timestamp in milliseconds.
pub(crate) fn wall_now() -> i64 {
    Utc::now().timestamp_millis()
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_zero_resolution_reads_every_time() {
        let clock = TtlClock::new(0);
        let first = clock.now();

        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(clock.now() >= first + 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_now_is_debounced() {
        let clock = TtlClock::new(50);
        let first = clock.now();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(clock.now(), first, "reading reused within resolution");
        assert!(clock.read() >= first + 10, "raw reads bypass the cache");

        // The reset timer fires at +50 before this sleep completes
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(clock.now() >= first + 70);
    }

    #[test]
    fn test_no_runtime_reads_directly() {
        let clock = TtlClock::new(1000);
        let first = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.now() >= first + 5);
    }

    #[test]
    fn test_wall_round_trip() {
        let clock = TtlClock::new(0);
        let mono = clock.read();
        let wall = clock.to_wall(mono);
        let back = clock.from_wall(wall);

        // Two wall-clock reads may straddle a millisecond boundary
        assert!((back - mono).abs() <= 2);
    }
}
