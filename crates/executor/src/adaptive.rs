// SPDX-License-Identifier: Apache-2.0

//! The adaptive service executor.
//!
//! An elastic pool of worker threads, each driving the shared reactor for a
//! bounded, jittered run window. A single controller thread retunes the
//! pool continuously:
//!
//! - **Starvation**: tasks queued longer than `max_queue_latency` while
//!   every worker is busy get a new thread.
//! - **Stuck detection**: if no task completes across a controller period
//!   while the queue is non-empty and all workers are occupied, a thread is
//!   added so the rest of the system keeps making progress past a blocking
//!   task.
//! - **Reserve**: the pool never drops below `reserved_threads`.
//!
//! Workers above the reserve exit on their own when they spend too little
//! of a run window executing. Run windows are jittered to prevent
//! synchronized thundering exits.

use crate::error::Error;
use crate::idle::mark_thread_idle;
use crate::reactor::{Reactor, ScheduleMode};
use crate::stats::{AdaptiveExecutorStats, TaskNameStats, ThreadsStartedBy};
use crate::{ScheduleFlags, Task, TaskName};
use finchdb_clock::{CumulativeTickTimer, SystemTickSource, TickSource, TickTimer, fatal};
use parking_lot::{Condvar, Mutex};
use rand::RngExt;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Tunables for the adaptive executor, immutable at construction.
#[derive(Debug, Clone)]
pub struct AdaptiveOptions {
    /// Minimum number of live workers, exempt from the idle-exit policy.
    pub reserved_threads: usize,
    /// How long a worker drives the reactor before re-evaluating whether
    /// to exit.
    pub worker_run_time: Duration,
    /// Run windows are offset by a uniform random value within this
    /// percentage of `worker_run_time` (whole milliseconds).
    pub run_time_jitter_pct: u32,
    /// The controller's poll period for forward-progress checks.
    pub stuck_thread_timeout: Duration,
    /// A task awaiting a thread longer than this is considered starved.
    pub max_queue_latency: Duration,
    /// A worker whose executing/running ratio over its last window falls
    /// below this percentage exits.
    pub idle_pct_threshold: u32,
    /// Maximum `MAY_RECURSE` depth before submissions are posted instead.
    pub recursion_limit: usize,
}

impl Default for AdaptiveOptions {
    fn default() -> Self {
        Self {
            reserved_threads: num_cpus::get(),
            worker_run_time: Duration::from_secs(1),
            run_time_jitter_pct: 20,
            stuck_thread_timeout: Duration::from_millis(250),
            max_queue_latency: Duration::from_micros(50),
            idle_pct_threshold: 60,
            recursion_limit: 8,
        }
    }
}

/// Why the controller started a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
enum ThreadCreationReason {
    StuckDetection = 0,
    Starvation = 1,
    ReserveMinimum = 2,
}

impl ThreadCreationReason {
    const COUNT: usize = 3;

    fn label(self) -> &'static str {
        match self {
            ThreadCreationReason::StuckDetection => "stuckDetection",
            ThreadCreationReason::Starvation => "starvation",
            ThreadCreationReason::ReserveMinimum => "reserveMinimum",
        }
    }
}

#[derive(Default)]
struct TaskMetrics {
    queued: AtomicU64,
    executed: AtomicU64,
    spent_queued_ticks: AtomicU64,
    spent_executing_ticks: AtomicU64,
}

type MetricsArray = [TaskMetrics; TaskName::COUNT];

fn new_metrics_array() -> MetricsArray {
    std::array::from_fn(|_| TaskMetrics::default())
}

/// Per-worker state, held in the executor's registry with stable identity.
/// The metrics fields are written only by the owning thread; stats readers
/// take relaxed snapshots under the registry lock and must tolerate an
/// open executing slice.
struct WorkerState {
    running: CumulativeTickTimer,
    executing: CumulativeTickTimer,
    executing_cur_run: AtomicU64,
    metrics: MetricsArray,
    mark_idle_counter: AtomicU64,
    recursion_depth: AtomicUsize,
}

impl WorkerState {
    fn new(source: Arc<dyn TickSource>) -> Self {
        Self {
            running: CumulativeTickTimer::new(source.clone()),
            executing: CumulativeTickTimer::new(source),
            executing_cur_run: AtomicU64::new(0),
            metrics: new_metrics_array(),
            mark_idle_counter: AtomicU64::new(0),
            recursion_depth: AtomicUsize::new(0),
        }
    }
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Arc<WorkerState>>> = const { RefCell::new(None) };
}

struct ThreadRegistry {
    workers: Vec<Arc<WorkerState>>,
    start_counters: [u64; ThreadCreationReason::COUNT],
    controller: Option<thread::JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy)]
enum QueueKind {
    /// Ran inline in the submitter's stack; never hit the queue gauges.
    Inline,
    /// Posted normally.
    Posted,
    /// Posted with the `DEFERRED` flag.
    Deferred,
}

struct AdaptiveInner {
    reactor: Reactor,
    options: AdaptiveOptions,
    tick_source: Arc<dyn TickSource>,

    threads: Mutex<ThreadRegistry>,
    is_running: AtomicBool,

    // Counters used to detect stuck threads and high task queuing.
    threads_running: AtomicUsize,
    threads_pending: AtomicUsize,
    threads_in_use: AtomicUsize,
    tasks_queued: AtomicUsize,
    deferred_tasks_queued: AtomicUsize,
    /// Tick stamp of when the task queue last became non-empty; 0 while
    /// empty. The controller compares its age against `max_queue_latency`.
    queue_nonempty_since: AtomicU64,
    last_schedule_timer: TickTimer,
    past_spent_executing: AtomicU64,
    past_spent_running: AtomicU64,

    // Reporting-only counters.
    total_queued: AtomicU64,
    total_executed: AtomicU64,
    total_spent_queued: AtomicU64,
    accumulated_metrics: MetricsArray,

    /// Workers signal this when they exit so shutdown can drain.
    death_condition: Condvar,

    /// Schedulers bump this and poke the controller so starvation checks
    /// happen within bounded latency.
    starvation_check_requests: AtomicUsize,
    schedule_mutex: Mutex<()>,
    schedule_condition: Condvar,

    thread_counter: AtomicUsize,
}

impl AdaptiveInner {
    fn ticks_to_micros(&self, ticks: u64) -> u64 {
        let micros =
            u128::from(ticks) * 1_000_000 / u128::from(self.tick_source.ticks_per_second().max(1));
        u64::try_from(micros).unwrap_or(u64::MAX)
    }

    /// The jittered run window for the next worker slice.
    fn run_window(&self) -> Duration {
        let base = self.options.worker_run_time;
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let jitter_ms = base_ms * u64::from(self.options.run_time_jitter_pct.min(100)) / 100;
        if jitter_ms == 0 {
            return base;
        }
        let bound = i64::try_from(jitter_ms).unwrap_or(i64::MAX);
        let offset = rand::rng().random_range(-bound..=bound);
        Duration::from_millis(base_ms.saturating_add_signed(offset).max(1))
    }

    /// Starved: a non-empty queue has waited past `max_queue_latency`
    /// while every live worker is occupied.
    fn is_starved(&self) -> bool {
        if self.tasks_queued.load(Ordering::Acquire) == 0 {
            return false;
        }
        let since = self.queue_nonempty_since.load(Ordering::Acquire);
        if since == 0 {
            return false;
        }
        let waited_ticks = self.tick_source.ticks().saturating_sub(since);
        let waited = Duration::from_micros(self.ticks_to_micros(waited_ticks));
        if waited <= self.options.max_queue_latency {
            return false;
        }
        self.threads_in_use.load(Ordering::Acquire) >= self.threads_running.load(Ordering::Acquire)
    }

    /// The wrapper every scheduled task runs through: it settles the queue
    /// gauges, records queue-wait and execution time against the running
    /// worker, and converts task panics into a log line instead of a dead
    /// worker.
    ///
    /// The worker's executing slice and the `threads_in_use` gauge span
    /// only the outermost task; recursive inline submissions nest inside
    /// it, gated by the recursion-depth counter.
    fn run_task(&self, task: Task, name: TaskName, queued_timer: TickTimer, kind: QueueKind) {
        let pending_ticks = queued_timer.since_start_ticks();
        let _ = self
            .total_spent_queued
            .fetch_add(pending_ticks, Ordering::Relaxed);
        match kind {
            QueueKind::Inline => {}
            QueueKind::Posted => {
                if self.tasks_queued.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.queue_nonempty_since.store(0, Ordering::Release);
                }
            }
            QueueKind::Deferred => {
                let _ = self.deferred_tasks_queued.fetch_sub(1, Ordering::AcqRel);
            }
        }

        let worker = CURRENT_WORKER.with_borrow(Clone::clone);
        let outermost = match &worker {
            Some(worker) => {
                let metrics = &worker.metrics[name as usize];
                let _ = metrics.queued.fetch_add(1, Ordering::Relaxed);
                let _ = metrics
                    .spent_queued_ticks
                    .fetch_add(pending_ticks, Ordering::Relaxed);
                let depth = worker.recursion_depth.load(Ordering::Relaxed);
                worker.recursion_depth.store(depth + 1, Ordering::Relaxed);
                depth == 0
            }
            None => true,
        };
        if outermost {
            if let Some(worker) = &worker {
                worker.executing.mark_running();
            }
            let _ = self.threads_in_use.fetch_add(1, Ordering::AcqRel);
        }

        let result = catch_unwind(AssertUnwindSafe(task));

        if let Some(worker) = &worker {
            let depth = worker.recursion_depth.load(Ordering::Relaxed) - 1;
            worker.recursion_depth.store(depth, Ordering::Relaxed);
            let metrics = &worker.metrics[name as usize];
            let _ = metrics.executed.fetch_add(1, Ordering::Relaxed);
            if depth == 0 {
                let slice = worker.executing.mark_stopped();
                let _ = metrics
                    .spent_executing_ticks
                    .fetch_add(slice, Ordering::Relaxed);
            }
        }
        if outermost {
            let _ = self.threads_in_use.fetch_sub(1, Ordering::AcqRel);
        }
        let _ = self.total_executed.fetch_add(1, Ordering::Relaxed);

        if result.is_err() {
            tracing::error!(
                task = name.stats_key(),
                "task failed inside the executor; abandoning it and continuing"
            );
        }
    }

    fn start_worker_thread(self: &Arc<Self>, reason: ThreadCreationReason) -> Result<(), Error> {
        let state = Arc::new(WorkerState::new(self.tick_source.clone()));
        {
            let mut registry = self.threads.lock();
            registry.workers.push(state.clone());
            registry.start_counters[reason as usize] += 1;
            let _ = self.threads_running.fetch_add(1, Ordering::AcqRel);
            let _ = self.threads_pending.fetch_add(1, Ordering::AcqRel);
        }
        tracing::debug!(reason = reason.label(), "starting a new adaptive worker");

        let thread_id = self.thread_counter.fetch_add(1, Ordering::AcqRel);
        let thread_name = format!("adaptive-worker-{thread_id}");
        let inner = self.clone();
        let worker_state = state.clone();
        let spawned = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || worker_routine(inner, worker_state));

        if let Err(source) = spawned {
            let mut registry = self.threads.lock();
            registry.workers.retain(|w| !Arc::ptr_eq(w, &state));
            registry.start_counters[reason as usize] -= 1;
            let _ = self.threads_running.fetch_sub(1, Ordering::AcqRel);
            let _ = self.threads_pending.fetch_sub(1, Ordering::AcqRel);
            drop(registry);
            return Err(Error::ThreadSpawnError {
                thread_name,
                source,
            });
        }
        Ok(())
    }

    /// Unlinks an exiting worker, folds its timers and metrics into the
    /// past-thread accumulators, and signals shutdown waiters.
    fn retire_worker(&self, state: &Arc<WorkerState>) {
        let _ = state.running.mark_stopped();
        let running_total = state.running.total();
        let executing_total = state.executing.total();

        let remaining = {
            let mut registry = self.threads.lock();
            registry.workers.retain(|w| !Arc::ptr_eq(w, state));
            for (accumulated, metrics) in self.accumulated_metrics.iter().zip(state.metrics.iter())
            {
                let _ = accumulated
                    .queued
                    .fetch_add(metrics.queued.load(Ordering::Relaxed), Ordering::Relaxed);
                let _ = accumulated
                    .executed
                    .fetch_add(metrics.executed.load(Ordering::Relaxed), Ordering::Relaxed);
                let _ = accumulated.spent_queued_ticks.fetch_add(
                    metrics.spent_queued_ticks.load(Ordering::Relaxed),
                    Ordering::Relaxed,
                );
                let _ = accumulated.spent_executing_ticks.fetch_add(
                    metrics.spent_executing_ticks.load(Ordering::Relaxed),
                    Ordering::Relaxed,
                );
            }
            let _ = self
                .past_spent_running
                .fetch_add(running_total, Ordering::Relaxed);
            let _ = self
                .past_spent_executing
                .fetch_add(executing_total, Ordering::Relaxed);
            self.threads_running.fetch_sub(1, Ordering::AcqRel) - 1
        };
        self.death_condition.notify_all();
        tracing::debug!(threads_running = remaining, "adaptive worker retired");
    }
}

fn worker_routine(inner: Arc<AdaptiveInner>, state: Arc<WorkerState>) {
    CURRENT_WORKER.with_borrow_mut(|current| *current = Some(state.clone()));
    state.running.mark_running();
    let _ = inner.threads_pending.fetch_sub(1, Ordering::AcqRel);

    loop {
        let window = inner.run_window();
        let running_before = state.running.total();
        let executing_before = state.executing.total();
        state
            .executing_cur_run
            .store(executing_before, Ordering::Relaxed);

        inner.reactor.run_for(window);

        if !inner.is_running.load(Ordering::Acquire) {
            break;
        }

        // Exit policy, evaluated at the end of each run window. Reserved
        // workers never exit.
        if inner.threads_running.load(Ordering::Acquire) <= inner.options.reserved_threads {
            continue;
        }
        let executing_delta = state.executing.total().saturating_sub(executing_before);
        if executing_delta == 0 {
            let _ = state.mark_idle_counter.fetch_add(1, Ordering::Relaxed);
            mark_thread_idle();
            tracing::debug!("adaptive worker exiting: executed nothing during its run window");
            break;
        }
        let running_delta = state
            .running
            .total()
            .saturating_sub(running_before)
            .max(1);
        let executing_pct = executing_delta.saturating_mul(100) / running_delta;
        if executing_pct < u64::from(inner.options.idle_pct_threshold) {
            tracing::debug!(
                executing_pct,
                "adaptive worker exiting: mostly idle during its run window"
            );
            break;
        }
    }

    CURRENT_WORKER.with_borrow_mut(|current| *current = None);
    inner.retire_worker(&state);
}

fn controller_routine(inner: Arc<AdaptiveInner>) {
    let mut last_stuck_check = Instant::now();
    let mut last_total_executed = inner.total_executed.load(Ordering::Relaxed);
    let mut last_queue_nonempty = inner.tasks_queued.load(Ordering::Acquire) > 0;

    while inner.is_running.load(Ordering::Acquire) {
        {
            let mut guard = inner.schedule_mutex.lock();
            let wait = if inner.starvation_check_requests.load(Ordering::Acquire) == 0 {
                inner.options.stuck_thread_timeout
            } else {
                // A fresh schedule poked us; give its task one latency
                // budget to get picked up before judging starvation.
                inner
                    .options
                    .max_queue_latency
                    .min(inner.options.stuck_thread_timeout)
            };
            if inner.is_running.load(Ordering::Acquire) {
                let _ = inner.schedule_condition.wait_for(&mut guard, wait);
            }
        }
        if !inner.is_running.load(Ordering::Acquire) {
            break;
        }
        let _ = inner.starvation_check_requests.swap(0, Ordering::AcqRel);

        if inner.is_starved() && inner.threads_pending.load(Ordering::Acquire) == 0 {
            tracing::info!(
                threads_running = inner.threads_running.load(Ordering::Acquire),
                tasks_queued = inner.tasks_queued.load(Ordering::Acquire),
                "queued tasks are starved, starting a worker thread"
            );
            if let Err(error) = inner.start_worker_thread(ThreadCreationReason::Starvation) {
                tracing::warn!(%error, "failed to start worker for starvation response");
            }
        }

        while inner.is_running.load(Ordering::Acquire)
            && inner.threads_running.load(Ordering::Acquire) < inner.options.reserved_threads
        {
            if let Err(error) = inner.start_worker_thread(ThreadCreationReason::ReserveMinimum) {
                tracing::warn!(%error, "failed to start reserved worker thread");
                break;
            }
        }

        // Stuck: across one controller period the queue stayed non-empty,
        // every worker stayed occupied, and not a single task completed.
        // One extra thread restores forward progress for everyone queued
        // behind a blocking task.
        let now = Instant::now();
        if now.duration_since(last_stuck_check) >= inner.options.stuck_thread_timeout {
            let total_executed = inner.total_executed.load(Ordering::Relaxed);
            let queue_nonempty = inner.tasks_queued.load(Ordering::Acquire) > 0;
            if queue_nonempty
                && last_queue_nonempty
                && total_executed == last_total_executed
                && inner.threads_in_use.load(Ordering::Acquire)
                    >= inner.threads_running.load(Ordering::Acquire)
                && inner.threads_pending.load(Ordering::Acquire) == 0
            {
                tracing::warn!(
                    threads_running = inner.threads_running.load(Ordering::Acquire),
                    "no task progress across a controller period, starting a worker thread"
                );
                if let Err(error) = inner.start_worker_thread(ThreadCreationReason::StuckDetection)
                {
                    tracing::warn!(%error, "failed to start worker for stuck response");
                }
            }
            last_stuck_check = now;
            last_total_executed = total_executed;
            last_queue_nonempty = queue_nonempty;
        }
    }
    tracing::debug!("adaptive executor controller exiting");
}

/// An elastic worker pool driven by a controller thread.
pub struct AdaptiveServiceExecutor {
    inner: Arc<AdaptiveInner>,
}

impl AdaptiveServiceExecutor {
    /// Creates a stopped executor over `reactor`.
    #[must_use]
    pub fn new(reactor: Reactor, options: AdaptiveOptions) -> Self {
        Self::with_tick_source(reactor, options, Arc::new(SystemTickSource))
    }

    /// Creates a stopped executor with an explicit tick source (tests).
    #[must_use]
    pub fn with_tick_source(
        reactor: Reactor,
        options: AdaptiveOptions,
        tick_source: Arc<dyn TickSource>,
    ) -> Self {
        Self {
            inner: Arc::new(AdaptiveInner {
                reactor,
                options,
                tick_source: tick_source.clone(),
                threads: Mutex::new(ThreadRegistry {
                    workers: Vec::new(),
                    start_counters: [0; ThreadCreationReason::COUNT],
                    controller: None,
                }),
                is_running: AtomicBool::new(false),
                threads_running: AtomicUsize::new(0),
                threads_pending: AtomicUsize::new(0),
                threads_in_use: AtomicUsize::new(0),
                tasks_queued: AtomicUsize::new(0),
                deferred_tasks_queued: AtomicUsize::new(0),
                queue_nonempty_since: AtomicU64::new(0),
                last_schedule_timer: TickTimer::new(tick_source),
                past_spent_executing: AtomicU64::new(0),
                past_spent_running: AtomicU64::new(0),
                total_queued: AtomicU64::new(0),
                total_executed: AtomicU64::new(0),
                total_spent_queued: AtomicU64::new(0),
                accumulated_metrics: new_metrics_array(),
                death_condition: Condvar::new(),
                starvation_check_requests: AtomicUsize::new(0),
                schedule_mutex: Mutex::new(()),
                schedule_condition: Condvar::new(),
                thread_counter: AtomicUsize::new(0),
            }),
        }
    }

    /// Starts the controller thread and the reserved workers.
    pub fn start(&self) -> Result<(), Error> {
        fatal::invariant(
            !self.inner.is_running.swap(true, Ordering::AcqRel),
            "adaptive executor started twice",
        );
        let inner = self.inner.clone();
        let controller = thread::Builder::new()
            .name("adaptive-executor-controller".to_string())
            .spawn(move || controller_routine(inner))
            .map_err(|source| Error::ThreadSpawnError {
                thread_name: "adaptive-executor-controller".to_string(),
                source,
            })?;
        self.inner.threads.lock().controller = Some(controller);

        for _ in 0..self.inner.options.reserved_threads {
            self.inner
                .start_worker_thread(ThreadCreationReason::ReserveMinimum)?;
        }
        Ok(())
    }

    /// Schedules a task onto the pool.
    ///
    /// `MAY_RECURSE` submissions from a pool worker below the recursion
    /// limit run inline in the submitter's stack; everything else is
    /// posted to the reactor in FIFO order. Non-deferred posts poke the
    /// controller so a starved queue is noticed within bounded latency.
    pub fn schedule(&self, task: Task, flags: ScheduleFlags, name: TaskName) -> Result<(), Error> {
        let inner = &self.inner;
        if !inner.is_running.load(Ordering::Acquire) {
            return Err(Error::ShutdownInProgress);
        }
        inner.last_schedule_timer.reset();
        let _ = inner.total_queued.fetch_add(1, Ordering::Relaxed);
        let queued_timer = TickTimer::new(inner.tick_source.clone());

        // Recursive submission: run inline in the submitter's stack while
        // the worker's depth stays below the limit. The depth bookkeeping
        // itself lives in the task wrapper.
        if flags.contains(ScheduleFlags::MAY_RECURSE) {
            let worker = CURRENT_WORKER.with_borrow(Clone::clone);
            if let Some(worker) = worker {
                if worker.recursion_depth.load(Ordering::Relaxed) < inner.options.recursion_limit {
                    inner.run_task(task, name, queued_timer, QueueKind::Inline);
                    return Ok(());
                }
            }
        }

        let deferred = flags.contains(ScheduleFlags::DEFERRED);
        if deferred {
            let _ = inner.deferred_tasks_queued.fetch_add(1, Ordering::AcqRel);
        } else if inner.tasks_queued.fetch_add(1, Ordering::AcqRel) == 0 {
            inner
                .queue_nonempty_since
                .store(inner.tick_source.ticks().max(1), Ordering::Release);
        }

        let run_inner = inner.clone();
        let kind = if deferred {
            QueueKind::Deferred
        } else {
            QueueKind::Posted
        };
        inner.reactor.schedule(
            ScheduleMode::Post,
            Box::new(move || run_inner.run_task(task, name, queued_timer, kind)),
        );

        if !deferred {
            let _ = inner.starvation_check_requests.fetch_add(1, Ordering::AcqRel);
            inner.schedule_condition.notify_one();
        }
        Ok(())
    }

    /// Stops the pool: the reactor is stopped (dropping unstarted tasks),
    /// workers drain within `timeout`, and the controller is joined.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), Error> {
        self.inner.is_running.store(false, Ordering::Release);
        self.inner.schedule_condition.notify_all();
        self.inner.reactor.stop();

        {
            let mut registry = self.inner.threads.lock();
            let _ = self.inner.death_condition.wait_while_for(
                &mut registry,
                |_| self.inner.threads_running.load(Ordering::Acquire) > 0,
                timeout,
            );
        }

        let controller = self.inner.threads.lock().controller.take();
        if let Some(handle) = controller {
            if handle.join().is_err() {
                tracing::error!("adaptive executor controller panicked");
            }
        }

        if self.inner.threads_running.load(Ordering::Acquire) > 0 {
            return Err(Error::ExceededTimeLimit {
                message: "adaptive executor couldn't shutdown all worker threads within time limit"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// The number of live worker threads.
    #[must_use]
    pub fn threads_running(&self) -> usize {
        self.inner.threads_running.load(Ordering::Acquire)
    }

    /// Builds the stats section for the status surface.
    #[must_use]
    pub fn stats(&self) -> AdaptiveExecutorStats {
        let registry = self.inner.threads.lock();

        let mut by_task = BTreeMap::new();
        for name in TaskName::ALL {
            let index = name as usize;
            let accumulated = &self.inner.accumulated_metrics[index];
            let mut queued = accumulated.queued.load(Ordering::Relaxed);
            let mut executed = accumulated.executed.load(Ordering::Relaxed);
            let mut queued_ticks = accumulated.spent_queued_ticks.load(Ordering::Relaxed);
            let mut executing_ticks = accumulated.spent_executing_ticks.load(Ordering::Relaxed);
            for worker in &registry.workers {
                let metrics = &worker.metrics[index];
                queued += metrics.queued.load(Ordering::Relaxed);
                executed += metrics.executed.load(Ordering::Relaxed);
                queued_ticks += metrics.spent_queued_ticks.load(Ordering::Relaxed);
                executing_ticks += metrics.spent_executing_ticks.load(Ordering::Relaxed);
            }
            let _ = by_task.insert(
                name.stats_key(),
                TaskNameStats {
                    queued,
                    executed,
                    queued_micros: self.inner.ticks_to_micros(queued_ticks),
                    executing_micros: self.inner.ticks_to_micros(executing_ticks),
                },
            );
        }

        let mut executing_total = self.inner.past_spent_executing.load(Ordering::Relaxed);
        for worker in &registry.workers {
            executing_total += worker.executing.total();
        }
        let start_counters = registry.start_counters;
        drop(registry);

        AdaptiveExecutorStats {
            executor: "adaptive",
            threads_running: self.inner.threads_running.load(Ordering::Acquire),
            threads_in_use: self.inner.threads_in_use.load(Ordering::Acquire),
            threads_pending: self.inner.threads_pending.load(Ordering::Acquire),
            tasks_queued: self.inner.tasks_queued.load(Ordering::Acquire),
            deferred_tasks_queued: self.inner.deferred_tasks_queued.load(Ordering::Acquire),
            total_queued: self.inner.total_queued.load(Ordering::Relaxed),
            total_executed: self.inner.total_executed.load(Ordering::Relaxed),
            total_time_executing_micros: self.inner.ticks_to_micros(executing_total),
            total_time_queued_micros: self
                .inner
                .ticks_to_micros(self.inner.total_spent_queued.load(Ordering::Relaxed)),
            threads_started_by: ThreadsStartedBy {
                stuck_detection: start_counters[ThreadCreationReason::StuckDetection as usize],
                starvation: start_counters[ThreadCreationReason::Starvation as usize],
                reserve_minimum: start_counters[ThreadCreationReason::ReserveMinimum as usize],
            },
            by_task,
        }
    }
}
