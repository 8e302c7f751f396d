// SPDX-License-Identifier: MIT
#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Single logical clock shared by every stage of a session.
///
/// Frame timestamps, the scheduler's read target and the buffering countdown
/// are all expressed in nanoseconds on this clock.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        let nanos = self.origin.elapsed().as_nanos() as u64;
        nanos
    }
}

/// Clock that only moves when told to. Used to drive the pipeline
/// deterministically.
#[cfg(test)]
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

#[cfg(test)]
impl ManualClock {
    #[must_use]
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    pub fn advance(&self, by: std::time::Duration) {
        #[allow(clippy::cast_possible_truncation)]
        let nanos = by.as_nanos() as u64;
        self.now.fetch_add(nanos, Ordering::SeqCst);
    }

    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[must_use]
pub fn secs_to_ns(secs: u64) -> u64 {
    secs.saturating_mul(NANOS_PER_SECOND)
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn ns_to_secs_f64(ns: u64) -> f64 {
    ns as f64 / NANOS_PER_SECOND as f64
}
