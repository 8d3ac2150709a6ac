// SPDX-License-Identifier: Apache-2.0

//! Monotonic tick sources.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// The process-wide epoch for [`SystemTickSource`]. All tick reads are
/// deltas against this instant, so ticks are comparable across threads.
static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// A monotonic tick counter.
///
/// Tick sources never go backwards. The tick unit is implementation
/// defined; callers convert through [`TickSource::ticks_per_second`].
pub trait TickSource: Send + Sync {
    /// Returns the current tick count.
    fn ticks(&self) -> u64;

    /// Returns the number of ticks per second.
    fn ticks_per_second(&self) -> u64;
}

/// The default tick source: nanoseconds of monotonic time since process
/// start.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTickSource;

impl TickSource for SystemTickSource {
    fn ticks(&self) -> u64 {
        u64::try_from(PROCESS_EPOCH.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn ticks_per_second(&self) -> u64 {
        1_000_000_000
    }
}

/// A manually advanced tick source for tests.
#[derive(Debug)]
pub struct ManualTickSource {
    ticks: AtomicU64,
    ticks_per_second: u64,
}

impl ManualTickSource {
    /// Creates a source at tick zero with the given resolution.
    #[must_use]
    pub fn new(ticks_per_second: u64) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            ticks_per_second,
        }
    }

    /// Creates a millisecond-resolution source (one tick per millisecond).
    #[must_use]
    pub fn millis() -> Self {
        Self::new(1_000)
    }

    /// Advances the tick counter.
    pub fn advance(&self, ticks: u64) {
        let _ = self.ticks.fetch_add(ticks, Ordering::AcqRel);
    }
}

impl TickSource for ManualTickSource {
    fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    fn ticks_per_second(&self) -> u64 {
        self.ticks_per_second
    }
}
