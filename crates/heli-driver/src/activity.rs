//! Activity Monitor - tracks when a device last delivered a valid data frame
//!
//! Timestamps are microseconds on a monotonic clock anchored at first use,
//! so they fit in an `AtomicU64` and are unaffected by wall-clock changes.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static APP_START: OnceLock<Instant> = OnceLock::new();

/// Monotonic microseconds since the first call in this process
fn get_monotonic_micros() -> u64 {
    let start = APP_START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

/// Last-data timestamp for one device
#[derive(Debug)]
pub struct ActivityMonitor {
    last_data: AtomicU64,
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityMonitor {
    /// Starts as if data had just arrived
    pub fn new() -> Self {
        Self {
            last_data: AtomicU64::new(get_monotonic_micros()),
        }
    }

    /// Call after every successfully decoded data frame
    pub fn register_data(&self) {
        self.last_data
            .store(get_monotonic_micros(), Ordering::Relaxed);
    }

    pub fn time_since_last_data(&self) -> Duration {
        let last_us = self.last_data.load(Ordering::Relaxed);
        Duration::from_micros(get_monotonic_micros().saturating_sub(last_us))
    }

    /// True once the device has been quiet for longer than `threshold`
    pub fn is_silent(&self, threshold: Duration) -> bool {
        self.time_since_last_data() > threshold
    }
}
