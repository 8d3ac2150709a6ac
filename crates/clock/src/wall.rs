// SPDX-License-Identifier: Apache-2.0

//! Wall-clock sources.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock time, in milliseconds since the UNIX epoch.
pub trait WallClock: Send + Sync {
    /// Returns the current wall-clock time in milliseconds since the epoch.
    fn now_millis(&self) -> i64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn now_millis(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
            // The clock sits before the epoch; report the negative offset.
            Err(e) => -i64::try_from(e.duration().as_millis()).unwrap_or(i64::MAX),
        }
    }
}

/// A manually advanced wall clock for tests.
#[derive(Debug)]
pub struct ManualWallClock {
    millis: AtomicI64,
}

impl ManualWallClock {
    /// Creates a clock reading `start_millis`.
    #[must_use]
    pub fn new(start_millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_millis),
        }
    }

    /// Advances the clock.
    pub fn advance_millis(&self, millis: i64) {
        let _ = self.millis.fetch_add(millis, Ordering::AcqRel);
    }
}

impl WallClock for ManualWallClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::Acquire)
    }
}
