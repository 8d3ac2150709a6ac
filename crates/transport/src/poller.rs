// SPDX-License-Identifier: Apache-2.0

//! The readiness poller for asynchronous sessions.
//!
//! A dedicated thread multiplexes registered socket fds through
//! `poll(2)`, with a self-pipe for wakeups. Registrations are one-shot:
//! when the fd turns ready (or the registration is cancelled) the stored
//! callback is taken and invoked exactly once, on the poller thread.
//! Callbacks must be cheap; sessions use them to progress a non-blocking
//! read/write and post the real completion to the reactor.

use crate::error::Error;
use nix::fcntl::{F_SETFL, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

/// What happened to a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    /// The fd became ready for the requested interest (or hung up).
    Ready,
    /// The registration was cancelled or the poller shut down.
    Cancelled,
}

/// Which readiness direction a registration waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Readable.
    Read,
    /// Writable.
    Write,
}

impl Interest {
    fn flags(self) -> PollFlags {
        match self {
            Interest::Read => PollFlags::POLLIN,
            Interest::Write => PollFlags::POLLOUT,
        }
    }
}

type ReadinessCallback = Box<dyn FnOnce(PollEvent) + Send + 'static>;

struct Registration {
    io: Arc<dyn AsFd + Send + Sync>,
    interest: Interest,
    callback: ReadinessCallback,
}

struct PollerInner {
    registrations: Mutex<HashMap<u64, Registration>>,
    next_token: AtomicU64,
    running: AtomicBool,
    wake_write: OwnedFd,
}

impl PollerInner {
    fn wake(&self) {
        // A full pipe already guarantees a pending wakeup.
        let _ = nix::unistd::write(&self.wake_write, &[1u8]);
    }
}

/// Watches session sockets for readiness on a dedicated thread.
pub struct ReadinessPoller {
    inner: Arc<PollerInner>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ReadinessPoller {
    /// Creates the poller and starts its thread.
    pub fn new() -> Result<Self, Error> {
        let (wake_read, wake_write) = nix::unistd::pipe().map_err(|e| Error::InternalError {
            message: format!("failed to create poller wake pipe: {e}"),
        })?;
        for fd in [&wake_read, &wake_write] {
            let _ = fcntl(fd, F_SETFL(OFlag::O_NONBLOCK)).map_err(|e| Error::InternalError {
                message: format!("failed to configure poller wake pipe: {e}"),
            })?;
        }

        let inner = Arc::new(PollerInner {
            registrations: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            running: AtomicBool::new(true),
            wake_write,
        });

        let thread_inner = inner.clone();
        let thread = thread::Builder::new()
            .name("readiness-poller".to_string())
            .spawn(move || poller_loop(&thread_inner, wake_read))
            .map_err(|e| Error::InternalError {
                message: format!("failed to spawn readiness poller: {e}"),
            })?;

        Ok(Self {
            inner,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Registers a one-shot readiness watch and returns its token.
    pub fn register(
        &self,
        io: Arc<dyn AsFd + Send + Sync>,
        interest: Interest,
        callback: ReadinessCallback,
    ) -> u64 {
        let token = self.inner.next_token.fetch_add(1, Ordering::AcqRel) + 1;
        let stale = {
            let mut registrations = self.inner.registrations.lock();
            registrations.insert(
                token,
                Registration {
                    io,
                    interest,
                    callback,
                },
            )
        };
        debug_assert!(stale.is_none());
        self.inner.wake();
        token
    }

    /// Cancels a registration; its callback runs with
    /// [`PollEvent::Cancelled`] on the calling thread. A token that
    /// already fired is ignored.
    pub fn cancel(&self, token: u64) {
        let registration = self.inner.registrations.lock().remove(&token);
        if let Some(registration) = registration {
            (registration.callback)(PollEvent::Cancelled);
        }
        self.inner.wake();
    }

    /// Stops the thread and cancels every outstanding registration.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.wake();
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::error!("readiness poller thread panicked during shutdown");
            }
        }
        let drained: Vec<Registration> = {
            let mut registrations = self.inner.registrations.lock();
            registrations.drain().map(|(_, r)| r).collect()
        };
        for registration in drained {
            (registration.callback)(PollEvent::Cancelled);
        }
    }
}

impl Drop for ReadinessPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn poller_loop(inner: &Arc<PollerInner>, wake_read: OwnedFd) {
    let mut wake_buf = [0u8; 64];
    while inner.running.load(Ordering::Acquire) {
        // Snapshot the registrations so the fds stay alive across poll.
        let snapshot: Vec<(u64, Arc<dyn AsFd + Send + Sync>, Interest)> = {
            let registrations = inner.registrations.lock();
            registrations
                .iter()
                .map(|(token, r)| (*token, r.io.clone(), r.interest))
                .collect()
        };

        let mut poll_fds = Vec::with_capacity(snapshot.len() + 1);
        poll_fds.push(PollFd::new(wake_read.as_fd(), PollFlags::POLLIN));
        for (_, io, interest) in &snapshot {
            poll_fds.push(PollFd::new(io.as_fd(), interest.flags()));
        }

        match poll(&mut poll_fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(error) => {
                tracing::error!(%error, "readiness poll failed");
                continue;
            }
        }

        let mut ready_tokens = Vec::new();
        for (index, poll_fd) in poll_fds.iter().enumerate() {
            let Some(revents) = poll_fd.revents() else {
                continue;
            };
            if revents.is_empty() {
                continue;
            }
            if index == 0 {
                // Drain the wake pipe.
                while nix::unistd::read(&wake_read, &mut wake_buf).is_ok_and(|n| n > 0) {}
                continue;
            }
            ready_tokens.push(snapshot[index - 1].0);
        }
        drop(poll_fds);

        for token in ready_tokens {
            let registration = inner.registrations.lock().remove(&token);
            if let Some(registration) = registration {
                (registration.callback)(PollEvent::Ready);
            }
        }
    }
}
