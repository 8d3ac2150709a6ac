// SPDX-License-Identifier: Apache-2.0

//! The service entry point: session admission and lifetime.
//!
//! Owns every live session state machine. Admission is capped at
//! `max_connections`; the count is computed under the sessions lock so
//! the cap is never observably exceeded, and rejected sockets are simply
//! closed. Cleanup hooks remove machines under the same lock and notify
//! the shutdown drain.

use crate::compress::{CompressionManager, CompressorRegistry};
use crate::session::{SessionHandle, SessionTags};
use crate::state_machine::{Ownership, RequestHandler, SessionStateMachine};
use finchdb_executor::{ServiceExecutor, TransportMode};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Session counters for the status surface.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// Sessions currently open.
    pub current: usize,
    /// Sessions ever admitted.
    pub total_created: u64,
    /// Admission slots still available.
    pub available: usize,
}

struct EntryPointInner {
    executor: Arc<ServiceExecutor>,
    handler: Arc<dyn RequestHandler>,
    registry: Arc<CompressorRegistry>,
    max_connections: usize,
    sessions: Mutex<Vec<Arc<SessionStateMachine>>>,
    shutdown_condition: Condvar,
    current_connections: AtomicUsize,
    created_connections: AtomicU64,
}

/// Accepts sessions, caps total connections, owns session state machine
/// lifetimes, and drains them on shutdown.
pub struct ServiceEntryPoint {
    inner: Arc<EntryPointInner>,
}

impl ServiceEntryPoint {
    /// Creates an entry point admitting up to `max_connections` sessions.
    #[must_use]
    pub fn new(
        executor: Arc<ServiceExecutor>,
        handler: Arc<dyn RequestHandler>,
        registry: Arc<CompressorRegistry>,
        max_connections: usize,
    ) -> Self {
        Self {
            inner: Arc::new(EntryPointInner {
                executor,
                handler,
                registry,
                max_connections,
                sessions: Mutex::new(Vec::new()),
                shutdown_condition: Condvar::new(),
                current_connections: AtomicUsize::new(0),
                created_connections: AtomicU64::new(0),
            }),
        }
    }

    /// Admits and starts a freshly accepted session, or drops it when the
    /// connection cap is reached.
    pub fn start_session(&self, session: SessionHandle) {
        let inner = &self.inner;
        let ssm = SessionStateMachine::new(
            session.clone(),
            inner.executor.clone(),
            inner.handler.clone(),
            CompressionManager::new(inner.registry.clone()),
        );

        let connection_count;
        let admitted;
        {
            let mut sessions = inner.sessions.lock();
            connection_count = sessions.len() + 1;
            admitted = connection_count <= inner.max_connections;
            if admitted {
                sessions.push(ssm.clone());
                inner
                    .current_connections
                    .store(connection_count, Ordering::Release);
                let _ = inner.created_connections.fetch_add(1, Ordering::AcqRel);
            }
        }

        // Log outside the lock.
        if !admitted {
            tracing::warn!(
                connection_count,
                "connection refused because too many open connections"
            );
            session.end();
            return;
        }
        tracing::info!(
            remote = %session.remote(),
            session_id = session.id(),
            open = connection_count,
            "connection accepted"
        );

        let hook_inner = Arc::downgrade(inner);
        let session_id = session.id();
        let remote = session.remote();
        ssm.set_cleanup_hook(Box::new(move || {
            session_cleanup(&hook_inner, session_id, remote);
        }));

        let ownership = match inner.executor.transport_mode() {
            TransportMode::Synchronous => Ownership::Static,
            TransportMode::Asynchronous => Ownership::Owned,
        };
        ssm.start(ownership);
    }

    /// Terminates every session whose tags don't intersect `tags`.
    pub fn end_all_sessions(&self, tags: SessionTags) {
        let sessions = self.inner.sessions.lock();
        for ssm in sessions.iter() {
            ssm.terminate_if_tags_dont_match(tags);
        }
    }

    /// Requests termination of all sessions and waits up to `timeout`
    /// for them to drain. Returns whether the drain completed.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        let deadline = Instant::now() + timeout;
        let check_interval = Duration::from_millis(250).min(timeout);

        let mut sessions = inner.sessions.lock();
        for ssm in sessions.iter() {
            ssm.terminate();
        }

        while inner.current_connections.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            let result = inner
                .shutdown_condition
                .wait_for(&mut sessions, check_interval);
            if result.timed_out() && inner.current_connections.load(Ordering::Acquire) > 0 {
                tracing::info!(
                    open = inner.current_connections.load(Ordering::Acquire),
                    "shutdown: still waiting for open sessions to drain"
                );
            }
        }
        drop(sessions);

        let drained = inner.current_connections.load(Ordering::Acquire) == 0;
        if drained {
            tracing::info!("shutdown: no open sessions remain");
        } else {
            tracing::warn!(
                open = inner.current_connections.load(Ordering::Acquire),
                "shutdown: exhausted grace period waiting for sessions to drain; continuing"
            );
        }
        drained
    }

    /// Session counters for the status surface.
    #[must_use]
    pub fn session_stats(&self) -> SessionStats {
        let current = self.inner.current_connections.load(Ordering::Acquire);
        SessionStats {
            current,
            total_created: self.inner.created_connections.load(Ordering::Acquire),
            available: self.inner.max_connections.saturating_sub(current),
        }
    }

    /// Sessions currently open.
    #[must_use]
    pub fn current_connections(&self) -> usize {
        self.inner.current_connections.load(Ordering::Acquire)
    }

    /// Sessions ever admitted.
    #[must_use]
    pub fn created_connections(&self) -> u64 {
        self.inner.created_connections.load(Ordering::Acquire)
    }
}

/// Cleanup hook body: unlink the session under the lock, publish the new
/// count, and poke the shutdown drain.
fn session_cleanup(
    inner: &Weak<EntryPointInner>,
    session_id: u64,
    remote: std::net::SocketAddr,
) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let open = {
        let mut sessions = inner.sessions.lock();
        sessions.retain(|ssm| ssm.session_id() != session_id);
        let open = sessions.len();
        inner.current_connections.store(open, Ordering::Release);
        open
    };
    inner.shutdown_condition.notify_all();
    tracing::info!(%remote, session_id, open, "end connection");
}
