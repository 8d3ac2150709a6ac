// SPDX-License-Identifier: Apache-2.0

//! In-memory transport doubles for tests.

use crate::error::Error;
use crate::message::Message;
use crate::session::{
    Session, SessionHandle, SessionTagState, SinkCallback, SourceCallback, next_session_id,
};
use finchdb_executor::reactor::{Reactor, ScheduleMode};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn test_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// A scripted in-memory session.
///
/// `source_message` pops pre-queued results; sourcing past the script's
/// end reports [`Error::SessionClosed`], so a machine driving the mock
/// terminates deterministically. Sunk messages are recorded for
/// inspection. Async operations complete immediately, posted through the
/// reactor when one is attached.
pub struct MockSession {
    id: u64,
    tag_state: SessionTagState,
    reactor: Option<Reactor>,
    inbound: Mutex<VecDeque<Result<Message, Error>>>,
    sunk: Mutex<Vec<Message>>,
    sink_failures: Mutex<VecDeque<Error>>,
    ended: AtomicBool,
}

impl MockSession {
    /// Creates a session that will source the given results in order.
    #[must_use]
    pub fn with_script(inbound: Vec<Result<Message, Error>>) -> Arc<Self> {
        Arc::new(Self {
            id: next_session_id(),
            tag_state: SessionTagState::new(),
            reactor: None,
            inbound: Mutex::new(inbound.into()),
            sunk: Mutex::new(Vec::new()),
            sink_failures: Mutex::new(VecDeque::new()),
            ended: AtomicBool::new(false),
        })
    }

    /// Creates a session whose async completions post through `reactor`.
    #[must_use]
    pub fn with_script_on_reactor(
        inbound: Vec<Result<Message, Error>>,
        reactor: Reactor,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: next_session_id(),
            tag_state: SessionTagState::new(),
            reactor: Some(reactor),
            inbound: Mutex::new(inbound.into()),
            sunk: Mutex::new(Vec::new()),
            sink_failures: Mutex::new(VecDeque::new()),
            ended: AtomicBool::new(false),
        })
    }

    /// An empty-script session (sources end-of-stream immediately).
    #[must_use]
    pub fn closed() -> Arc<Self> {
        Self::with_script(Vec::new())
    }

    /// Converts to the trait handle.
    #[must_use]
    pub fn as_handle(self: &Arc<Self>) -> SessionHandle {
        self.clone()
    }

    /// Queues another inbound message.
    pub fn push_inbound(&self, message: Message) {
        self.inbound.lock().push_back(Ok(message));
    }

    /// Makes the next sink call fail with `error`.
    pub fn fail_next_sink(&self, error: Error) {
        self.sink_failures.lock().push_back(error);
    }

    /// The messages sunk so far.
    #[must_use]
    pub fn sunk_messages(&self) -> Vec<Message> {
        self.sunk.lock().clone()
    }

    /// Whether `end` was called.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    fn next_inbound(&self) -> Result<Message, Error> {
        if self.ended.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }
        self.inbound
            .lock()
            .pop_front()
            .unwrap_or(Err(Error::SessionClosed))
    }

    fn post(&self, completion: Box<dyn FnOnce() + Send>) {
        match &self.reactor {
            Some(reactor) => reactor.schedule(ScheduleMode::Post, completion),
            None => completion(),
        }
    }
}

impl Session for MockSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn remote(&self) -> SocketAddr {
        test_addr(40000)
    }

    fn local(&self) -> SocketAddr {
        test_addr(27017)
    }

    fn source_message(&self) -> Result<Message, Error> {
        self.next_inbound()
    }

    fn sink_message(&self, message: Message) -> Result<(), Error> {
        if self.ended.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }
        if let Some(error) = self.sink_failures.lock().pop_front() {
            return Err(error);
        }
        self.sunk.lock().push(message);
        Ok(())
    }

    fn async_source_message(&self, callback: SourceCallback) {
        let result = self.next_inbound();
        self.post(Box::new(move || callback(result)));
    }

    fn async_sink_message(&self, message: Message, callback: SinkCallback) {
        let result = self.sink_message(message);
        self.post(Box::new(move || callback(result)));
    }

    fn cancel_async_operations(&self) {}

    fn set_timeout(&self, _timeout: Option<Duration>) {}

    fn is_connected(&self) -> bool {
        !self.ended.load(Ordering::Acquire)
    }

    fn end(&self) {
        self.ended.store(true, Ordering::Release);
    }

    fn tag_state(&self) -> &SessionTagState {
        &self.tag_state
    }
}
