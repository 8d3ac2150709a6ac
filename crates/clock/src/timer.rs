// SPDX-License-Identifier: Apache-2.0

//! Elapsed-time trackers built on a [`TickSource`].

use crate::fatal;
use crate::tick::TickSource;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Measures elapsed ticks since construction (or the last [`reset`]).
///
/// The start tick lives in an atomic so `reset` may race concurrent reads;
/// ticks-per-millisecond is computed once at construction.
///
/// [`reset`]: TickTimer::reset
pub struct TickTimer {
    source: Arc<dyn TickSource>,
    ticks_per_millisecond: u64,
    start: AtomicU64,
}

impl TickTimer {
    /// Creates a timer capturing the current tick as its start point.
    ///
    /// Aborts if the source resolution is below one tick per millisecond.
    #[must_use]
    pub fn new(source: Arc<dyn TickSource>) -> Self {
        let ticks_per_millisecond = source.ticks_per_second() / 1_000;
        fatal::invariant(
            ticks_per_millisecond > 0,
            "tick source must have millisecond resolution or better",
        );
        let start = AtomicU64::new(source.ticks());
        Self {
            source,
            ticks_per_millisecond,
            start,
        }
    }

    /// Returns ticks elapsed since the start point.
    pub fn since_start_ticks(&self) -> u64 {
        self.source
            .ticks()
            .saturating_sub(self.start.load(Ordering::Acquire))
    }

    /// Returns elapsed time since the start point, at millisecond
    /// resolution.
    pub fn since_start(&self) -> Duration {
        Duration::from_millis(self.since_start_ticks() / self.ticks_per_millisecond)
    }

    /// Moves the start point to now.
    pub fn reset(&self) {
        self.start.store(self.source.ticks(), Ordering::Release);
    }

    /// Converts a tick count from this timer's source into microseconds.
    pub fn ticks_to_micros(&self, ticks: u64) -> u64 {
        ticks.saturating_mul(1_000) / self.ticks_per_millisecond
    }
}

struct CumulativeState {
    accumulator: u64,
    running: bool,
}

/// Accumulates total running ticks across start/stop cycles.
///
/// `mark_stopped` must be preceded by `mark_running`; violating that is a
/// programmer error and aborts. A concurrent `total` includes the in-flight
/// slice of a running timer.
pub struct CumulativeTickTimer {
    timer: TickTimer,
    state: Mutex<CumulativeState>,
}

impl CumulativeTickTimer {
    /// Creates a stopped timer with an empty accumulator.
    #[must_use]
    pub fn new(source: Arc<dyn TickSource>) -> Self {
        Self {
            timer: TickTimer::new(source),
            state: Mutex::new(CumulativeState {
                accumulator: 0,
                running: false,
            }),
        }
    }

    /// Opens a new slice.
    pub fn mark_running(&self) {
        let mut state = self.state.lock();
        fatal::invariant(!state.running, "cumulative timer already running");
        self.timer.reset();
        state.running = true;
    }

    /// Closes the current slice, folds it into the accumulator, and
    /// returns the slice length in ticks.
    pub fn mark_stopped(&self) -> u64 {
        let mut state = self.state.lock();
        fatal::invariant(state.running, "cumulative timer stopped while not running");
        state.running = false;
        let slice = self.timer.since_start_ticks();
        state.accumulator += slice;
        slice
    }

    /// Returns the accumulated ticks, including the open slice if the
    /// timer is currently running.
    pub fn total(&self) -> u64 {
        let state = self.state.lock();
        if !state.running {
            return state.accumulator;
        }
        state.accumulator + self.timer.since_start_ticks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tick::ManualTickSource;

    #[test]
    fn tick_timer_measures_elapsed_ticks() {
        let source = Arc::new(ManualTickSource::millis());
        let timer = TickTimer::new(source.clone());
        assert_eq!(timer.since_start_ticks(), 0);

        source.advance(25);
        assert_eq!(timer.since_start_ticks(), 25);
        assert_eq!(timer.since_start(), Duration::from_millis(25));

        timer.reset();
        assert_eq!(timer.since_start_ticks(), 0);
    }

    #[test]
    fn cumulative_timer_accumulates_slices() {
        let source = Arc::new(ManualTickSource::millis());
        let timer = CumulativeTickTimer::new(source.clone());
        assert_eq!(timer.total(), 0);

        timer.mark_running();
        source.advance(10);
        assert_eq!(timer.total(), 10);
        assert_eq!(timer.mark_stopped(), 10);

        source.advance(100); // not counted, the timer is stopped
        assert_eq!(timer.total(), 10);

        timer.mark_running();
        source.advance(7);
        assert_eq!(timer.total(), 17);
        assert_eq!(timer.mark_stopped(), 7);
        assert_eq!(timer.total(), 17);
    }

    #[test]
    fn open_slice_is_visible_to_total() {
        let source = Arc::new(ManualTickSource::millis());
        let timer = CumulativeTickTimer::new(source.clone());
        timer.mark_running();
        source.advance(3);
        assert_eq!(timer.total(), 3);
        source.advance(3);
        assert_eq!(timer.total(), 6);
    }
}
