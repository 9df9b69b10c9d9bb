//! Clock sources.
//!
//! Every timeout in the broker (session deadlines, queue TTL, heartbeat
//! staleness, compilation stalls) is measured against a single injected
//! [`Clock`], so tests can drive time with [`ManualClock`].

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Wall-clock milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Convert a duration to milliseconds.
#[must_use]
pub const fn duration_ms(d: Duration) -> u128 {
    d.as_millis()
}

/// Source of the current time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds.
    fn now_ms(&self) -> u128;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Monotonic clock anchored to wall time at construction.
///
/// Readings never go backwards even if the system clock is adjusted,
/// which keeps session deadlines stable.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
    origin_ms: u128,
}

impl SystemClock {
    /// Anchor a new clock at the current wall time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            origin_ms: now_ms(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u128 {
        self.origin_ms + self.origin.elapsed().as_millis()
    }
}

/// Manually driven clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<u128>,
}

impl ManualClock {
    /// Create a clock frozen at `start_ms`.
    #[must_use]
    pub const fn new(start_ms: u128) -> Self {
        Self {
            now: Mutex::new(start_ms),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by.as_millis();
    }

    /// Jump to an absolute time. Going backwards is ignored.
    pub fn set(&self, at_ms: u128) {
        let mut now = self.now.lock();
        if at_ms > *now {
            *now = at_ms;
        }
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u128 {
        *self.now.lock()
    }
}
