// SPDX-License-Identifier: Apache-2.0

//! Errors surfaced by the service executors and the reactor.

/// All errors that can occur in the execution core.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A task was scheduled on an executor that is shutting down or was
    /// never started. The caller must abandon the task.
    #[error("executor is not running")]
    ShutdownInProgress,

    /// Shutdown did not drain all worker threads within the allotted time.
    #[error("{message}")]
    ExceededTimeLimit {
        /// What failed to drain in time.
        message: String,
    },

    /// An asynchronous wait was cancelled by a timer cancellation, a
    /// session close, or shutdown.
    #[error("callback was cancelled")]
    CallbackCancelled,

    /// A worker or controller thread could not be spawned.
    #[error("failed to spawn thread `{thread_name}`: {source}")]
    ThreadSpawnError {
        /// The name of the thread that could not be started.
        thread_name: String,

        /// The underlying OS error.
        source: std::io::Error,
    },

    /// An internal error that occurred in the execution core.
    #[error("internal error: {message}")]
    InternalError {
        /// An internal error message.
        message: String,
    },
}
