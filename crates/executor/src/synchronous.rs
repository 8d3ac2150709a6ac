// SPDX-License-Identifier: Apache-2.0

//! The thread-per-connection baseline executor.
//!
//! Every session gets a dedicated worker thread owning a thread-local work
//! deque. Re-entrant submissions from inside a task either recurse inline
//! (bounded by the recursion limit) or append to the local deque; the
//! worker drains the deque until the session's work dries up, then exits.

use crate::error::Error;
use crate::idle::mark_thread_idle;
use crate::stats::SynchronousExecutorStats;
use crate::{ScheduleFlags, Task, TaskName};
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

thread_local! {
    static LOCAL_WORK_QUEUE: RefCell<VecDeque<Task>> = RefCell::new(VecDeque::new());
    static LOCAL_IN_WORKER: Cell<bool> = const { Cell::new(false) };
    static LOCAL_RECURSION_DEPTH: Cell<usize> = const { Cell::new(0) };
    static LOCAL_IDLE_COUNTER: Cell<u64> = const { Cell::new(0) };
}

/// Tunables for the synchronous executor.
#[derive(Debug, Clone)]
pub struct SynchronousOptions {
    /// Tasks scheduled with `MAY_RECURSE` run inline while the local
    /// recursion depth is below this value.
    pub recursion_limit: usize,
}

impl Default for SynchronousOptions {
    fn default() -> Self {
        Self { recursion_limit: 8 }
    }
}

struct SyncInner {
    still_running: AtomicBool,
    num_hardware_cores: AtomicUsize,
    num_running_workers: AtomicUsize,
    recursion_limit: usize,
    shutdown_mutex: Mutex<()>,
    shutdown_condition: Condvar,
}

/// One worker thread per session, blocking network I/O.
pub struct SynchronousServiceExecutor {
    inner: Arc<SyncInner>,
}

impl SynchronousServiceExecutor {
    /// Creates a stopped executor.
    #[must_use]
    pub fn new(options: SynchronousOptions) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                still_running: AtomicBool::new(false),
                num_hardware_cores: AtomicUsize::new(0),
                num_running_workers: AtomicUsize::new(0),
                recursion_limit: options.recursion_limit,
                shutdown_mutex: Mutex::new(()),
                shutdown_condition: Condvar::new(),
            }),
        }
    }

    /// Marks the executor running; worker threads spawn lazily on the
    /// first schedule of each connection.
    pub fn start(&self) -> Result<(), Error> {
        self.inner
            .num_hardware_cores
            .store(num_cpus::get(), Ordering::Release);
        self.inner.still_running.store(true, Ordering::Release);
        Ok(())
    }

    /// Schedules a task.
    ///
    /// A submission from inside a running task lands on the submitting
    /// worker (inline when `MAY_RECURSE` allows, at the deque tail
    /// otherwise). A fresh submission spawns the connection's worker
    /// thread.
    pub fn schedule(&self, task: Task, flags: ScheduleFlags, _name: TaskName) -> Result<(), Error> {
        if !self.inner.still_running.load(Ordering::Acquire) {
            return Err(Error::ShutdownInProgress);
        }

        if LOCAL_IN_WORKER.get() {
            // Yielding after each request produced measurably better
            // throughput when worker threads outnumber hardware cores.
            if flags.contains(ScheduleFlags::MAY_YIELD_BEFORE_SCHEDULE) {
                let counter = LOCAL_IDLE_COUNTER.get();
                LOCAL_IDLE_COUNTER.set(counter.wrapping_add(1));
                if counter & 0xf == 0 {
                    mark_thread_idle();
                }
                if self.inner.num_running_workers.load(Ordering::Relaxed)
                    > self.inner.num_hardware_cores.load(Ordering::Relaxed)
                {
                    thread::yield_now();
                }
            }

            if flags.contains(ScheduleFlags::MAY_RECURSE)
                && LOCAL_RECURSION_DEPTH.get() < self.inner.recursion_limit
            {
                LOCAL_RECURSION_DEPTH.set(LOCAL_RECURSION_DEPTH.get() + 1);
                task();
            } else {
                LOCAL_WORK_QUEUE.with_borrow_mut(|queue| queue.push_back(task));
            }
            return Ok(());
        }

        // First schedule for this connection: spawn the worker that will
        // drain the thread-local job queue.
        tracing::debug!("starting new executor thread in passthrough mode");
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name("passthrough-worker".to_string())
            .spawn(move || {
                let _ = inner.num_running_workers.fetch_add(1, Ordering::AcqRel);
                LOCAL_IN_WORKER.set(true);
                LOCAL_WORK_QUEUE.with_borrow_mut(|queue| queue.push_back(task));

                while inner.still_running.load(Ordering::Relaxed) {
                    let next = LOCAL_WORK_QUEUE.with_borrow_mut(|queue| queue.pop_front());
                    let Some(task) = next else { break };
                    LOCAL_RECURSION_DEPTH.set(1);
                    task();
                }

                LOCAL_IN_WORKER.set(false);
                LOCAL_WORK_QUEUE.with_borrow_mut(|queue| queue.clear());
                if inner.num_running_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
                    inner.shutdown_condition.notify_all();
                }
            });

        match spawned {
            Ok(_handle) => Ok(()),
            Err(source) => Err(Error::ThreadSpawnError {
                thread_name: "passthrough-worker".to_string(),
                source,
            }),
        }
    }

    /// Stops accepting work and waits up to `timeout` for worker threads
    /// to drain.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), Error> {
        tracing::debug!("shutting down passthrough executor");
        self.inner.still_running.store(false, Ordering::Release);

        let mut guard = self.inner.shutdown_mutex.lock();
        let result = self.inner.shutdown_condition.wait_while_for(
            &mut guard,
            |_| self.inner.num_running_workers.load(Ordering::Acquire) > 0,
            timeout,
        );
        drop(guard);

        if result.timed_out() && self.inner.num_running_workers.load(Ordering::Acquire) > 0 {
            return Err(Error::ExceededTimeLimit {
                message: "passthrough executor couldn't shutdown all worker threads within time \
                          limit"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Returns the stats section for the status surface.
    #[must_use]
    pub fn stats(&self) -> SynchronousExecutorStats {
        SynchronousExecutorStats {
            executor: "passthrough",
            threads_running: self.inner.num_running_workers.load(Ordering::Relaxed),
        }
    }

    /// The number of currently live worker threads.
    #[must_use]
    pub fn threads_running(&self) -> usize {
        self.inner.num_running_workers.load(Ordering::Acquire)
    }
}
