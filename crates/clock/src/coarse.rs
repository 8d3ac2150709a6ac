// SPDX-License-Identifier: Apache-2.0

//! A cached wall clock refreshed by a background thread.
//!
//! Callers that read "now" at high frequency (per-task instrumentation,
//! queue-latency stamps) must not hit the OS clock on every read. The
//! [`CoarseClock`] stores the current time in an atomic that a background
//! thread refreshes once per granularity. The thread pauses itself when
//! nobody has read the clock for a full tick, and the first reader after a
//! pause wakes it back up.

use crate::fatal;
use crate::wall::{SystemWallClock, WallClock};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread;
use std::time::Duration;

struct TimerState {
    started: bool,
    in_shutdown: bool,
}

struct Shared {
    /// Milliseconds since the epoch; 0 means the timer thread is paused.
    current: AtomicI64,
    /// Set to `true` by the timer thread on every tick and back to `false`
    /// by readers. A tick that finds it still `true` pauses the thread.
    timer_will_pause: AtomicBool,
    state: Mutex<TimerState>,
    condition: Condvar,
    source: Arc<dyn WallClock>,
    granularity: Duration,
}

impl Shared {
    fn update_current(&self) -> i64 {
        let now = self.source.now_millis();
        if now == 0 {
            // 0 is reserved as the paused sentinel. A source reporting it
            // is either broken or it really is 1970.
            fatal::invariant_failed("wall clock source reported time 0");
        }
        self.current.store(now, Ordering::Release);
        now
    }
}

/// Shared cached wall time updated by a background thread at a configured
/// granularity; pauses when idle.
///
/// `now_millis()` never returns 0 and is never more than one granularity
/// stale relative to the underlying clock, modulo scheduling jitter.
pub struct CoarseClock {
    shared: Arc<Shared>,
    timer: Option<thread::JoinHandle<()>>,
}

impl CoarseClock {
    /// Creates a coarse clock over the system wall clock.
    #[must_use]
    pub fn new(granularity: Duration) -> Self {
        Self::with_source(Arc::new(SystemWallClock), granularity)
    }

    /// Creates a coarse clock over an arbitrary source.
    ///
    /// Returns only after the background thread has reached its first
    /// wait, so startup is predictable.
    #[must_use]
    pub fn with_source(source: Arc<dyn WallClock>, granularity: Duration) -> Self {
        let shared = Arc::new(Shared {
            current: AtomicI64::new(0),
            timer_will_pause: AtomicBool::new(true),
            state: Mutex::new(TimerState {
                started: false,
                in_shutdown: false,
            }),
            condition: Condvar::new(),
            source,
            granularity,
        });

        let timer = Self::start_timer_thread(shared.clone());
        Self {
            shared,
            timer: Some(timer),
        }
    }

    /// Returns the configured granularity.
    #[must_use]
    pub fn granularity(&self) -> Duration {
        self.shared.granularity
    }

    /// Returns the cached wall-clock time in milliseconds since the epoch.
    ///
    /// The common case is a single atomic load; the slow path (first read
    /// after a pause) takes a mutex and computes one fresh value inline.
    pub fn now_millis(&self) -> i64 {
        // Called very frequently by many threads; the common case must not
        // write to shared memory.
        if self.shared.timer_will_pause.load(Ordering::Acquire) {
            return self.slow_now();
        }
        let now = self.shared.current.load(Ordering::Acquire);
        if now == 0 {
            return self.slow_now();
        }
        now
    }

    // Called at most once per granularity per thread, and in common cases
    // by a single thread per granularity.
    fn slow_now(&self) -> i64 {
        self.shared.timer_will_pause.store(false, Ordering::Release);
        let mut now = self.shared.current.load(Ordering::Acquire);
        if now == 0 {
            let guard = self.shared.state.lock();
            // Reload after locking; someone else may have done this for us.
            now = self.shared.current.load(Ordering::Acquire);
            if now == 0 {
                // Wake the timer, but have it pause again if nothing reads
                // the clock for the next granularity.
                self.shared.condition.notify_one();
                self.shared.timer_will_pause.store(true, Ordering::Release);
                now = self.shared.update_current();
            }
            drop(guard);
        }
        now
    }

    fn start_timer_thread(shared: Arc<Shared>) -> thread::JoinHandle<()> {
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("coarse-clock".to_string())
            .spawn(move || {
                let shared = thread_shared;
                let mut guard = shared.state.lock();
                guard.started = true;
                shared.condition.notify_all();

                while !guard.in_shutdown {
                    if !shared.timer_will_pause.swap(true, Ordering::AcqRel) {
                        let _ = shared.update_current();
                    } else {
                        // Nothing read the time since the last update; park
                        // until the next reader resumes us.
                        shared.current.store(0, Ordering::Release);
                        shared.condition.wait_while(&mut guard, |state| {
                            !state.in_shutdown && shared.current.load(Ordering::Acquire) == 0
                        });
                        if guard.in_shutdown {
                            break;
                        }
                    }

                    let _ = shared
                        .condition
                        .wait_for(&mut guard, shared.granularity)
                        .timed_out();
                }
            });

        match handle {
            Ok(handle) => {
                // Block until the timer thread is at its first wait; this
                // keeps startup ordering predictable for callers and tests.
                let mut guard = shared.state.lock();
                shared
                    .condition
                    .wait_while(&mut guard, |state| !state.started);
                handle
            }
            Err(e) => fatal::invariant_failed(&format!("failed to spawn coarse clock thread: {e}")),
        }
    }

    #[cfg(test)]
    fn peek_current(&self) -> i64 {
        self.shared.current.load(Ordering::Acquire)
    }
}

impl WallClock for CoarseClock {
    fn now_millis(&self) -> i64 {
        CoarseClock::now_millis(self)
    }
}

impl Drop for CoarseClock {
    fn drop(&mut self) {
        {
            let mut guard = self.shared.state.lock();
            guard.in_shutdown = true;
            self.shared.condition.notify_all();
        }
        if let Some(timer) = self.timer.take() {
            if timer.join().is_err() {
                tracing::error!("coarse clock thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wall::ManualWallClock;
    use std::time::Instant;

    fn set_up(granularity: Duration) -> (Arc<ManualWallClock>, CoarseClock) {
        let source = Arc::new(ManualWallClock::new(0));
        // Make sure the source never reports time 0.
        source.advance_millis(i64::try_from(granularity.as_millis()).unwrap_or(1).max(1));
        let clock = CoarseClock::with_source(source.clone(), granularity);
        (source, clock)
    }

    fn wait_for_idle_detection(source: &ManualWallClock, clock: &CoarseClock) {
        let start = Instant::now();
        while clock.peek_current() != 0 {
            // If the thread doesn't notice idleness within a minute,
            // something is wrong.
            assert!(start.elapsed() < Duration::from_secs(60));
            source.advance_millis(1);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn create_and_terminate() {
        let (_source, clock) = set_up(Duration::from_millis(1));
        drop(clock);

        let (_source, clock) = set_up(Duration::from_secs(48 * 3600));
        drop(clock);
    }

    #[test]
    fn starts_paused() {
        let (_source, clock) = set_up(Duration::from_millis(1));
        assert_eq!(clock.peek_current(), 0);
    }

    #[test]
    fn time_keeping() {
        let (source, clock) = set_up(Duration::from_millis(1));
        assert_eq!(clock.now_millis(), source.now_millis());

        wait_for_idle_detection(&source, &clock);

        assert_eq!(clock.now_millis(), source.now_millis());
    }

    #[test]
    fn never_returns_zero() {
        let (_source, clock) = set_up(Duration::from_millis(5));
        for _ in 0..100 {
            assert_ne!(clock.now_millis(), 0);
        }
    }

    #[test]
    fn pauses_after_read() {
        let granularity = Duration::from_millis(5);
        let (source, clock) = set_up(granularity);

        // Wake it up.
        let now = clock.now_millis();
        assert_ne!(now, 0);

        wait_for_idle_detection(&source, &clock);
    }

    #[test]
    fn wakes_after_pause() {
        let granularity = Duration::from_millis(5);
        let (source, clock) = set_up(granularity);

        let now = clock.now_millis();
        assert_ne!(now, 0);

        wait_for_idle_detection(&source, &clock);

        // Wake it up again; the inline slow path must produce a fresh,
        // non-zero reading even before the thread's next tick.
        source.advance_millis(3);
        let later = clock.now_millis();
        assert_ne!(later, 0);
        assert_eq!(later, source.now_millis());
    }
}
