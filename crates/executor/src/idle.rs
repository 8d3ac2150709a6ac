// SPDX-License-Identifier: Apache-2.0

//! Process-wide thread idle hook.
//!
//! Allocators (and other interested parties) can register a callback that
//! executors invoke when a worker thread goes idle, so per-thread caches
//! can be released. At most one callback may be registered for the
//! lifetime of the process.

use finchdb_clock::fatal;
use once_cell::sync::OnceCell;

/// The registered idle callback, if any.
static THREAD_IDLE_CALLBACK: OnceCell<Box<dyn Fn() + Send + Sync>> = OnceCell::new();

/// Registers the process-wide idle callback. Aborts if one is already
/// registered.
pub fn register_thread_idle_callback(callback: Box<dyn Fn() + Send + Sync>) {
    fatal::invariant(
        THREAD_IDLE_CALLBACK.set(callback).is_ok(),
        "thread idle callback already registered",
    );
}

/// Invokes the registered idle callback, if any.
pub fn mark_thread_idle() {
    if let Some(callback) = THREAD_IDLE_CALLBACK.get() {
        callback();
    }
}
