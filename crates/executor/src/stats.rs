// SPDX-License-Identifier: Apache-2.0

//! Executor stats sections for the status surface.

use serde::Serialize;
use std::collections::BTreeMap;

/// Stats for the synchronous (passthrough) executor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynchronousExecutorStats {
    /// Always `"passthrough"`.
    pub executor: &'static str,
    /// Live worker threads (one per active connection).
    pub threads_running: usize,
}

/// Per-task-name counters.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNameStats {
    /// Tasks scheduled under this name.
    pub queued: u64,
    /// Tasks executed under this name.
    pub executed: u64,
    /// Total time tasks of this name waited for a thread.
    pub queued_micros: u64,
    /// Total time spent executing tasks of this name.
    pub executing_micros: u64,
}

/// Worker-spawn counters, one per controller spawn reason.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadsStartedBy {
    /// Workers added because no task progress was observed.
    pub stuck_detection: u64,
    /// Workers added because queued tasks exceeded the latency target.
    pub starvation: u64,
    /// Workers added to hold the configured reserve.
    pub reserve_minimum: u64,
}

/// Stats for the adaptive executor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveExecutorStats {
    /// Always `"adaptive"`.
    pub executor: &'static str,
    /// Live worker threads.
    pub threads_running: usize,
    /// Workers currently executing a task.
    pub threads_in_use: usize,
    /// Workers spawned but not yet in their run loop.
    pub threads_pending: usize,
    /// Normal tasks posted and not yet started.
    pub tasks_queued: usize,
    /// Deferred tasks posted and not yet started.
    pub deferred_tasks_queued: usize,
    /// Tasks ever scheduled.
    pub total_queued: u64,
    /// Tasks ever executed.
    pub total_executed: u64,
    /// Total time spent executing tasks, over live and exited workers.
    pub total_time_executing_micros: u64,
    /// Total time tasks spent awaiting a thread.
    pub total_time_queued_micros: u64,
    /// Spawn counters by controller reason.
    pub threads_started_by: ThreadsStartedBy,
    /// Per-task-name breakdowns, keyed by stats key.
    pub by_task: BTreeMap<&'static str, TaskNameStats>,
}
