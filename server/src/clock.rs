//! Time source for liveness bookkeeping.
//!
//! Liveness comparisons go through [`Clock`] instead of reading the wall
//! clock directly, so sweeps can be driven deterministically in tests.

#[cfg(test)]
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Millisecond time source.
pub trait Clock: Send + Sync {
    /// Current time in epoch milliseconds. Never decreases.
    fn now_ms(&self) -> i64;
}

/// Wall-clock anchored to a monotonic [`Instant`].
///
/// The epoch reading is taken once at construction; later readings add the
/// monotonic elapsed time, so NTP steps cannot move liveness backwards.
#[derive(Debug)]
pub struct SystemClock {
    anchor: Instant,
    anchor_ms: i64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
            anchor_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.anchor_ms.saturating_add(elapsed)
    }
}

/// Hand-driven clock for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
