// SPDX-License-Identifier: Apache-2.0

//! A service executor that never executes anything.

use crate::{Error, ScheduleFlags, Task, TaskName};
use std::time::Duration;

/// Provides the executor interface for unit tests of callers that never
/// need their work to actually run. Scheduled tasks are dropped.
#[derive(Debug, Default)]
pub struct NoopServiceExecutor;

impl NoopServiceExecutor {
    /// Creates a noop executor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Always succeeds.
    pub fn start(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Accepts and discards the task.
    pub fn schedule(
        &self,
        _task: Task,
        _flags: ScheduleFlags,
        _name: TaskName,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Always succeeds.
    pub fn shutdown(&self, _timeout: Duration) -> Result<(), Error> {
        Ok(())
    }
}
