// SPDX-License-Identifier: Apache-2.0

//! The cooperative event loop driven by executor worker threads.
//!
//! A reactor owns a FIFO task queue and a timer heap. Worker threads drive
//! it in bounded slices via [`Reactor::run_for`]; the adaptive executor's
//! elasticity comes entirely from how many threads are driving at once.
//! Reactor internals are only ever touched under the reactor lock, and each
//! ready item is claimed and executed by exactly one driver, so tasks
//! posted to a single reactor start in FIFO order.

use crate::Task;
use crate::error::Error;
use finchdb_clock::{SystemWallClock, WallClock, fatal};
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a task is handed to the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Run the task inline when the caller is already on a thread driving
    /// this reactor; otherwise post it.
    Dispatch,
    /// Always post the task to the queue.
    Post,
}

type TimerCallback = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

struct TimerWait {
    /// Incremented on every arm; heap entries from earlier arms are stale.
    generation: u64,
    callback: Option<TimerCallback>,
}

struct TimerShared {
    wait: Mutex<TimerWait>,
}

impl TimerShared {
    /// Claims the armed callback if `generation` still matches.
    fn claim(&self, generation: u64) -> Option<TimerCallback> {
        let mut wait = self.wait.lock();
        if wait.generation != generation {
            return None;
        }
        wait.callback.take()
    }
}

struct TimerEntry {
    deadline: Instant,
    sequence: u64,
    generation: u64,
    shared: Arc<TimerShared>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the binary heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct ReactorState {
    queue: VecDeque<Task>,
    timers: BinaryHeap<TimerEntry>,
    next_sequence: u64,
    stopped: bool,
}

struct Inner {
    state: Mutex<ReactorState>,
    condition: Condvar,
    clock: Arc<dyn WallClock>,
}

thread_local! {
    /// Address of the reactor the current thread is driving, or 0.
    static ACTIVE_REACTOR: Cell<usize> = const { Cell::new(0) };
}

/// Restores the previously active reactor when a drive slice ends.
struct DriveGuard {
    previous: usize,
}

impl Drop for DriveGuard {
    fn drop(&mut self) {
        ACTIVE_REACTOR.set(self.previous);
    }
}

enum Ready {
    Timer(TimerCallback),
    Task(Task),
    Waited,
    Stopped,
}

/// A single-threaded-at-any-instant cooperative event loop.
///
/// Cloning yields another handle to the same reactor.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    /// Creates a reactor over the system wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemWallClock))
    }

    /// Creates a reactor whose [`now_millis`](Reactor::now_millis) reads
    /// from the given clock (typically the coarse clock).
    #[must_use]
    pub fn with_clock(clock: Arc<dyn WallClock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ReactorState {
                    queue: VecDeque::new(),
                    timers: BinaryHeap::new(),
                    next_sequence: 0,
                    stopped: false,
                }),
                condition: Condvar::new(),
                clock,
            }),
        }
    }

    /// Runs the event loop until [`stop`](Reactor::stop) is called.
    pub fn run(&self) {
        self.run_until(None);
    }

    /// Runs the event loop until `stop()` or until `window` elapses.
    pub fn run_for(&self, window: Duration) {
        self.run_until(Instant::now().checked_add(window));
    }

    /// Posts or dispatches a task.
    ///
    /// Tasks handed to a stopped reactor are dropped without invocation;
    /// the executor contract is explicit that scheduled tasks may not run
    /// if shutdown intervenes.
    pub fn schedule(&self, mode: ScheduleMode, task: Task) {
        if mode == ScheduleMode::Dispatch && self.on_reactor_thread() {
            task();
            return;
        }
        {
            let mut state = self.inner.state.lock();
            if state.stopped {
                return;
            }
            state.queue.push_back(task);
        }
        self.inner.condition.notify_one();
    }

    /// Stops the loop. All drivers return from `run`/`run_for`, and every
    /// outstanding timer wait resolves with [`Error::CallbackCancelled`].
    pub fn stop(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            state.stopped = true;
            std::mem::take(&mut state.timers)
        };
        self.inner.condition.notify_all();
        for entry in drained {
            if let Some(callback) = entry.shared.claim(entry.generation) {
                callback(Err(Error::CallbackCancelled));
            }
        }
    }

    /// Returns whether the current thread is inside this reactor's
    /// `run`/`run_for`.
    #[must_use]
    pub fn on_reactor_thread(&self) -> bool {
        ACTIVE_REACTOR.get() == Arc::as_ptr(&self.inner) as usize
    }

    /// Returns the reactor's wall-clock time in milliseconds since the
    /// epoch.
    pub fn now_millis(&self) -> i64 {
        self.inner.clock.now_millis()
    }

    /// Makes a timer tied to this reactor's event loop. Expiry callbacks
    /// run on a thread driving the loop.
    #[must_use]
    pub fn make_timer(&self) -> ReactorTimer {
        ReactorTimer {
            reactor: self.clone(),
            shared: Arc::new(TimerShared {
                wait: Mutex::new(TimerWait {
                    generation: 0,
                    callback: None,
                }),
            }),
        }
    }

    fn enter(&self) -> DriveGuard {
        let previous = ACTIVE_REACTOR.get();
        ACTIVE_REACTOR.set(Arc::as_ptr(&self.inner) as usize);
        DriveGuard { previous }
    }

    fn run_until(&self, deadline: Option<Instant>) {
        let _guard = self.enter();
        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return;
            }
            match self.next_ready(deadline) {
                Ready::Stopped => return,
                Ready::Waited => {}
                Ready::Task(task) => {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        fatal::invariant_failed("uncaught panic in reactor task");
                    }
                }
                Ready::Timer(callback) => {
                    if catch_unwind(AssertUnwindSafe(|| callback(Ok(())))).is_err() {
                        fatal::invariant_failed("uncaught panic in reactor timer callback");
                    }
                }
            }
        }
    }

    /// Claims the next ready item, or waits for one (bounded by the run
    /// deadline and the earliest timer).
    fn next_ready(&self, deadline: Option<Instant>) -> Ready {
        let mut state = self.inner.state.lock();
        loop {
            if state.stopped {
                return Ready::Stopped;
            }

            let now = Instant::now();
            if state.timers.peek().is_some_and(|e| e.deadline <= now) {
                if let Some(entry) = state.timers.pop() {
                    if let Some(callback) = entry.shared.claim(entry.generation) {
                        return Ready::Timer(callback);
                    }
                }
                // Stale entry (cancelled or re-armed); keep going.
                continue;
            }

            if let Some(task) = state.queue.pop_front() {
                return Ready::Task(task);
            }

            let mut wait_deadline = deadline;
            if let Some(entry) = state.timers.peek() {
                wait_deadline = Some(match wait_deadline {
                    Some(d) => d.min(entry.deadline),
                    None => entry.deadline,
                });
            }
            match wait_deadline {
                Some(until) => {
                    let result = self.inner.condition.wait_until(&mut state, until);
                    if result.timed_out() && deadline.is_some_and(|d| Instant::now() >= d) {
                        return Ready::Waited;
                    }
                }
                None => self.inner.condition.wait(&mut state),
            }
        }
    }
}

/// A timer handle tied to a [`Reactor`].
///
/// At most one wait is outstanding per timer: arming it again implicitly
/// cancels the previous wait. Dropping the timer cancels as well.
pub struct ReactorTimer {
    reactor: Reactor,
    shared: Arc<TimerShared>,
}

impl ReactorTimer {
    /// Arms the timer to fire after `timeout`.
    ///
    /// The callback receives `Ok(())` on expiry, or
    /// `Err(CallbackCancelled)` if the wait is cancelled by
    /// [`cancel`](ReactorTimer::cancel), by re-arming, by dropping the
    /// timer, or by reactor shutdown.
    pub fn wait_for<F>(&self, timeout: Duration, callback: F)
    where
        F: FnOnce(Result<(), Error>) + Send + 'static,
    {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.wait_until(deadline, callback),
            None => self.wait_until(Instant::now(), callback),
        }
    }

    /// Arms the timer to fire at `deadline`.
    pub fn wait_until<F>(&self, deadline: Instant, callback: F)
    where
        F: FnOnce(Result<(), Error>) + Send + 'static,
    {
        // Arming implicitly cancels any outstanding wait.
        self.cancel();

        let generation = {
            let mut wait = self.shared.wait.lock();
            wait.generation += 1;
            wait.callback = Some(Box::new(callback));
            wait.generation
        };

        let stopped = {
            let mut state = self.reactor.inner.state.lock();
            if state.stopped {
                true
            } else {
                state.next_sequence += 1;
                let sequence = state.next_sequence;
                state.timers.push(TimerEntry {
                    deadline,
                    sequence,
                    generation,
                    shared: self.shared.clone(),
                });
                false
            }
        };

        if stopped {
            // The loop will never fire it; resolve as cancelled.
            if let Some(callback) = self.shared.claim(generation) {
                callback(Err(Error::CallbackCancelled));
            }
            return;
        }
        // Wake a driver so it can adopt the (possibly earlier) deadline.
        self.reactor.inner.condition.notify_one();
    }

    /// Cancels the outstanding wait, if any, resolving it with
    /// [`Error::CallbackCancelled`] on the calling thread.
    pub fn cancel(&self) {
        let callback = self.shared.wait.lock().callback.take();
        if let Some(callback) = callback {
            callback(Err(Error::CallbackCancelled));
        }
    }
}

impl Drop for ReactorTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn posted_tasks_run_in_fifo_order() {
        let reactor = Reactor::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let order = order.clone();
            let stop_reactor = reactor.clone();
            reactor.schedule(
                ScheduleMode::Post,
                Box::new(move || {
                    order.lock().push(i);
                    if i == 7 {
                        stop_reactor.stop();
                    }
                }),
            );
        }
        reactor.run();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn run_for_returns_after_window() {
        let reactor = Reactor::new();
        let start = Instant::now();
        reactor.run_for(Duration::from_millis(50));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn dispatch_runs_inline_on_reactor_thread() {
        let reactor = Reactor::new();
        let inline = Arc::new(AtomicUsize::new(0));

        let inner_reactor = reactor.clone();
        let inner_inline = inline.clone();
        reactor.schedule(
            ScheduleMode::Post,
            Box::new(move || {
                assert!(inner_reactor.on_reactor_thread());
                let dispatched = inner_inline.clone();
                let before = dispatched.load(Ordering::Acquire);
                inner_reactor.schedule(
                    ScheduleMode::Dispatch,
                    Box::new(move || {
                        let _ = dispatched.fetch_add(1, Ordering::AcqRel);
                    }),
                );
                // Dispatch from the driving thread runs synchronously.
                assert_eq!(inner_inline.load(Ordering::Acquire), before + 1);
                inner_reactor.stop();
            }),
        );
        reactor.run();
        assert_eq!(inline.load(Ordering::Acquire), 1);
        assert!(!reactor.on_reactor_thread());
    }

    #[test]
    fn timer_fires_on_a_driver_thread() {
        let reactor = Reactor::new();
        let timer = reactor.make_timer();
        let (tx, rx) = mpsc::channel();
        timer.wait_for(Duration::from_millis(20), move |result| {
            tx.send(result).ok();
        });
        reactor.run_for(Duration::from_millis(500));
        let fired = rx.try_recv().expect("timer should have fired");
        assert!(fired.is_ok());
    }

    #[test]
    fn cancel_resolves_wait_with_cancelled() {
        let reactor = Reactor::new();
        let timer = reactor.make_timer();
        let (tx, rx) = mpsc::channel();
        timer.wait_for(Duration::from_secs(3600), move |result| {
            tx.send(result).ok();
        });
        timer.cancel();
        let result = rx.try_recv().expect("cancel resolves immediately");
        assert!(matches!(result, Err(Error::CallbackCancelled)));

        // The stale heap entry must not fire anything later.
        reactor.run_for(Duration::from_millis(10));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stop_cancels_outstanding_timers() {
        let reactor = Reactor::new();
        let timer = reactor.make_timer();
        let (tx, rx) = mpsc::channel();
        timer.wait_for(Duration::from_secs(3600), move |result| {
            tx.send(result).ok();
        });
        reactor.stop();
        let result = rx.try_recv().expect("stop resolves timer waits");
        assert!(matches!(result, Err(Error::CallbackCancelled)));
    }

    #[test]
    fn stop_unblocks_concurrent_drivers() {
        let reactor = Reactor::new();
        let driver = {
            let reactor = reactor.clone();
            thread::spawn(move || reactor.run())
        };
        thread::sleep(Duration::from_millis(20));
        reactor.stop();
        driver.join().expect("driver exits after stop");
    }

    #[test]
    fn tasks_posted_after_stop_are_dropped() {
        let reactor = Reactor::new();
        reactor.stop();
        let ran = Arc::new(AtomicUsize::new(0));
        let task_ran = ran.clone();
        reactor.schedule(
            ScheduleMode::Post,
            Box::new(move || {
                let _ = task_ran.fetch_add(1, Ordering::AcqRel);
            }),
        );
        reactor.run_for(Duration::from_millis(10));
        assert_eq!(ran.load(Ordering::Acquire), 0);
    }

    #[test]
    fn reactor_reads_its_configured_clock() {
        let clock = Arc::new(finchdb_clock::ManualWallClock::new(1_700_000_000_000));
        let reactor = Reactor::with_clock(clock.clone());
        assert_eq!(reactor.now_millis(), 1_700_000_000_000);
        clock.advance_millis(250);
        assert_eq!(reactor.now_millis(), 1_700_000_000_250);
    }

    #[test]
    fn many_drivers_each_claim_distinct_tasks() {
        let reactor = Reactor::new();
        let executed = Arc::new(AtomicUsize::new(0));
        const TASKS: usize = 64;
        for _ in 0..TASKS {
            let executed = executed.clone();
            reactor.schedule(
                ScheduleMode::Post,
                Box::new(move || {
                    let _ = executed.fetch_add(1, Ordering::AcqRel);
                }),
            );
        }
        let drivers: Vec<_> = (0..4)
            .map(|_| {
                let reactor = reactor.clone();
                thread::spawn(move || reactor.run_for(Duration::from_millis(200)))
            })
            .collect();
        for driver in drivers {
            driver.join().expect("driver finishes its window");
        }
        // Each task ran exactly once even with several concurrent drivers.
        assert_eq!(executed.load(Ordering::Acquire), TASKS);
    }
}
