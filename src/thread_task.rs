// SPDX-License-Identifier: Apache-2.0

//! Utilities to run a non-Send async task on a dedicated OS thread with a
//! single-threaded Tokio runtime, plus a shutdown signal.

use std::future::Future;
use std::thread;
use tokio::runtime::Builder as RtBuilder;
use tokio_util::sync::CancellationToken;

/// Handle to a task running on a dedicated thread.
pub struct ThreadLocalTaskHandle<T, E> {
    cancel_token: CancellationToken,
    join_handle: Option<thread::JoinHandle<Result<T, E>>>,
    name: String,
}

impl<T, E: std::fmt::Display> ThreadLocalTaskHandle<T, E> {
    /// Requests a graceful shutdown by cancelling the token (idempotent).
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    /// Requests shutdown, then waits for the task to finish. Returns the
    /// task's result, or `None` when the thread panicked.
    pub fn shutdown_and_join(mut self) -> Option<Result<T, E>> {
        self.shutdown();
        match self.join_handle.take()?.join() {
            Ok(result) => Some(result),
            Err(panic) => {
                tracing::error!(
                    thread_name = self.name,
                    panic = format!("{panic:?}"),
                    "dedicated task thread panicked"
                );
                None
            }
        }
    }
}

/// Spawns an async task on a dedicated OS thread running a single-threaded
/// Tokio runtime. The `task_factory` receives a token that is cancelled
/// when shutdown is requested; the task should observe it and exit
/// promptly.
pub fn spawn_thread_local_task<T, E, Fut, F>(
    thread_name: impl Into<String>,
    task_factory: F,
) -> std::io::Result<ThreadLocalTaskHandle<T, E>>
where
    T: Send + 'static,
    E: Send + 'static,
    Fut: 'static + Future<Output = Result<T, E>>,
    F: 'static + Send + FnOnce(CancellationToken) -> Fut,
{
    let name = thread_name.into();
    let token = CancellationToken::new();
    let token_for_task = token.clone();

    let join_handle = thread::Builder::new().name(name.clone()).spawn(move || {
        let runtime = RtBuilder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to create runtime");
        runtime.block_on(task_factory(token_for_task))
    })?;

    Ok(ThreadLocalTaskHandle {
        cancel_token: token,
        join_handle: Some(join_handle),
        name,
    })
}
