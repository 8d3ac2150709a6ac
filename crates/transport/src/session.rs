// SPDX-License-Identifier: Apache-2.0

//! The transport session abstraction.
//!
//! A session carries framed messages between the server and one remote
//! peer. Synchronous transports block inside `source_message` and
//! `sink_message`; asynchronous transports complete through callbacks
//! that the reactor delivers on executor worker threads.

use crate::error::Error;
use crate::message::Message;
use bitflags::bitflags;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

bitflags! {
    /// Tags classifying groups of connections for bulk termination.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionTags: u32 {
        /// The session survives `end_all_sessions` sweeps.
        const KEEP_OPEN = 1;
        /// The peer is another server-internal client.
        const INTERNAL_CLIENT = 2;
        /// No tags have been assigned yet. Only for new sessions; cleared
        /// by the first tag mutation.
        const PENDING = 1 << 31;
    }
}

/// The atomically mutated tag word every session embeds.
#[derive(Debug)]
pub struct SessionTagState {
    tags: AtomicU32,
}

impl Default for SessionTagState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTagState {
    /// Creates the tag word in the pending state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tags: AtomicU32::new(SessionTags::PENDING.bits()),
        }
    }

    /// Loads the current tags.
    #[must_use]
    pub fn get(&self) -> SessionTags {
        SessionTags::from_bits_retain(self.tags.load(Ordering::Acquire))
    }

    /// Applies `mutate` in a compare-exchange loop. Any mutation clears
    /// the pending flag, so `mutate` may run more than once and must be
    /// side-effect free.
    pub fn mutate(&self, mutate: impl Fn(SessionTags) -> SessionTags) {
        let mut current = self.tags.load(Ordering::Acquire);
        loop {
            let mutated = mutate(SessionTags::from_bits_retain(current));
            let next = (mutated - SessionTags::PENDING).bits();
            match self
                .tags
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Callback type for asynchronous message sourcing.
pub type SourceCallback = Box<dyn FnOnce(Result<Message, Error>) + Send + 'static>;

/// Callback type for asynchronous message sinking.
pub type SinkCallback = Box<dyn FnOnce(Result<(), Error>) + Send + 'static>;

/// A connection to one remote peer.
pub trait Session: Send + Sync {
    /// The process-unique session id.
    fn id(&self) -> u64;

    /// The peer address.
    fn remote(&self) -> SocketAddr;

    /// The local address.
    fn local(&self) -> SocketAddr;

    /// Receives the next message, blocking until one arrives, the
    /// configured timeout expires, or the session fails.
    fn source_message(&self) -> Result<Message, Error>;

    /// Sends a message, blocking until it is written out.
    fn sink_message(&self, message: Message) -> Result<(), Error>;

    /// Receives the next message asynchronously. The callback runs on a
    /// reactor-driven thread, or with [`Error::CallbackCancelled`] if the
    /// operation is cancelled first.
    fn async_source_message(&self, callback: SourceCallback);

    /// Sends a message asynchronously; completion mirrors
    /// [`async_source_message`](Session::async_source_message).
    fn async_sink_message(&self, message: Message, callback: SinkCallback);

    /// Cancels outstanding asynchronous operations; their callbacks
    /// resolve with [`Error::CallbackCancelled`]. Synchronous calls
    /// cannot be cancelled and rely on the socket timeout.
    fn cancel_async_operations(&self);

    /// Sets the socket timeout applied to synchronous source/sink calls.
    fn set_timeout(&self, timeout: Option<Duration>);

    /// Whether source/sink can still be expected to succeed.
    fn is_connected(&self) -> bool;

    /// Ends the session: in-flight operations may fail, future ones will,
    /// and any underlying connection is closed. Idempotent.
    fn end(&self);

    /// The embedded tag word.
    fn tag_state(&self) -> &SessionTagState;

    /// Atomically sets every tag in `tags` (and clears pending).
    fn set_tags(&self, tags: SessionTags) {
        self.tag_state().mutate(|current| current | tags);
    }

    /// Atomically clears every tag in `tags` (and clears pending).
    fn unset_tags(&self, tags: SessionTags) {
        self.tag_state().mutate(|current| current - tags);
    }

    /// Loads the current tags.
    fn tags(&self) -> SessionTags {
        self.tag_state().get()
    }
}

/// Shared ownership handle for sessions.
pub type SessionHandle = std::sync::Arc<dyn Session>;

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Allocates the next process-unique session id.
pub fn next_session_id() -> u64 {
    SESSION_ID_COUNTER.fetch_add(1, Ordering::AcqRel) + 1
}
