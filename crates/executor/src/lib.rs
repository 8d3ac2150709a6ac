// SPDX-License-Identifier: Apache-2.0

//! Service executors for the FinchDB network front-end.
//!
//! A service executor dispatches per-connection work onto threads. Two real
//! implementations exist:
//!
//! - [`SynchronousServiceExecutor`]: one worker thread per connection, the
//!   baseline. Each worker owns a thread-local work deque with recursion
//!   and yield hints.
//! - [`AdaptiveServiceExecutor`]: an elastic pool of worker threads driving
//!   a shared [`reactor::Reactor`], continuously retuned by a controller
//!   thread based on queue latency, stuck-thread detection, and per-thread
//!   idle fraction.
//!
//! Scheduling is biased toward short request/response bursts: there is no
//! work stealing, no task priorities, and no fairness beyond FIFO within a
//! reactor. Individual worker threads may exit when idle, so no single
//! task has a forward-progress guarantee beyond the controller's stuck
//! detection.

pub mod adaptive;
pub mod error;
pub mod idle;
pub mod noop;
pub mod reactor;
pub mod stats;
pub mod synchronous;

pub use adaptive::{AdaptiveOptions, AdaptiveServiceExecutor};
pub use error::Error;
pub use noop::NoopServiceExecutor;
pub use synchronous::{SynchronousOptions, SynchronousServiceExecutor};

use bitflags::bitflags;

/// A unit of work submitted to a service executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

bitflags! {
    /// Flags steering how an executor treats a scheduled task.
    ///
    /// `ScheduleFlags::empty()` marks a normal task: the executor may
    /// launch new threads as needed to run it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ScheduleFlags: u32 {
        /// Deferred tasks never cause a new thread to be launched; they
        /// run when convenient.
        const DEFERRED = 1 << 1;

        /// The task may be invoked synchronously in the submitter's stack,
        /// bounded by the executor's recursion limit.
        const MAY_RECURSE = 1 << 2;

        /// The submitter hints that the executor may cooperatively yield
        /// on the current thread before scheduling the task.
        const MAY_YIELD_BEFORE_SCHEDULE = 1 << 3;
    }
}

/// The task-name tag attached to every schedule, used solely as a
/// per-category metrics key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum TaskName {
    /// The first task of a new session.
    StartSession = 0,
    /// Receiving the next message from a session.
    SourceMessage = 1,
    /// Processing a received message.
    ProcessMessage = 2,
    /// Re-processing an exhaust-style request without re-sourcing.
    ExhaustMessage = 3,
}

impl TaskName {
    /// The number of task-name categories.
    pub const COUNT: usize = 4;

    /// All task names, indexable by `TaskName as usize`.
    pub const ALL: [TaskName; TaskName::COUNT] = [
        TaskName::StartSession,
        TaskName::SourceMessage,
        TaskName::ProcessMessage,
        TaskName::ExhaustMessage,
    ];

    /// The stats-document key for this task name.
    #[must_use]
    pub fn stats_key(self) -> &'static str {
        match self {
            TaskName::StartSession => "startSession",
            TaskName::SourceMessage => "sourceMessage",
            TaskName::ProcessMessage => "processMessage",
            TaskName::ExhaustMessage => "exhaustMessage",
        }
    }
}

/// Whether an executor drives sessions with blocking or asynchronous I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// One thread per session, blocking I/O.
    Synchronous,
    /// Sessions share the reactor-driven worker pool.
    Asynchronous,
}

/// The executor variants behind a thin dispatch boundary.
///
/// Callers (the session state machine, the entry point) use executors
/// opaquely through `start`/`schedule`/`shutdown`/`transport_mode`.
pub enum ServiceExecutor {
    /// Thread-per-connection baseline.
    Synchronous(SynchronousServiceExecutor),
    /// Elastic reactor-driven pool.
    Adaptive(AdaptiveServiceExecutor),
    /// Accepts and discards work; for tests.
    Noop(NoopServiceExecutor),
}

impl ServiceExecutor {
    /// Starts the executor. This may create threads even before any task
    /// is scheduled.
    pub fn start(&self) -> Result<(), Error> {
        match self {
            ServiceExecutor::Synchronous(executor) => executor.start(),
            ServiceExecutor::Adaptive(executor) => executor.start(),
            ServiceExecutor::Noop(executor) => executor.start(),
        }
    }

    /// Schedules a task and returns immediately.
    ///
    /// Unless `MAY_RECURSE` permits inline execution, the stack unwinds
    /// before the task runs, although it may later run on the same thread.
    pub fn schedule(&self, task: Task, flags: ScheduleFlags, name: TaskName) -> Result<(), Error> {
        match self {
            ServiceExecutor::Synchronous(executor) => executor.schedule(task, flags, name),
            ServiceExecutor::Adaptive(executor) => executor.schedule(task, flags, name),
            ServiceExecutor::Noop(executor) => executor.schedule(task, flags, name),
        }
    }

    /// Stops the executor, waiting up to `timeout` for worker threads to
    /// drain. Outstanding tasks are not executed.
    pub fn shutdown(&self, timeout: std::time::Duration) -> Result<(), Error> {
        match self {
            ServiceExecutor::Synchronous(executor) => executor.shutdown(timeout),
            ServiceExecutor::Adaptive(executor) => executor.shutdown(timeout),
            ServiceExecutor::Noop(executor) => executor.shutdown(timeout),
        }
    }

    /// Returns whether this executor drives synchronous or asynchronous
    /// networking.
    #[must_use]
    pub fn transport_mode(&self) -> TransportMode {
        match self {
            ServiceExecutor::Synchronous(_) | ServiceExecutor::Noop(_) => {
                TransportMode::Synchronous
            }
            ServiceExecutor::Adaptive(_) => TransportMode::Asynchronous,
        }
    }

    /// Returns the executor's stats document for the status surface.
    #[must_use]
    pub fn stats(&self) -> serde_json::Value {
        match self {
            ServiceExecutor::Synchronous(executor) => {
                serde_json::to_value(executor.stats()).unwrap_or_default()
            }
            ServiceExecutor::Adaptive(executor) => {
                serde_json::to_value(executor.stats()).unwrap_or_default()
            }
            ServiceExecutor::Noop(_) => serde_json::Value::Null,
        }
    }
}
