// SPDX-License-Identifier: Apache-2.0

//! The per-connection session state machine.
//!
//! Drives one session through its `Source → Process → SinkWait → Source`
//! cycle, submitting each step to the service executor with flags that
//! steer recursion, yielding, and deferral. The machine schedules exactly
//! one step at a time and never the next before the previous one has
//! transitioned state, which is what makes `Owned` mode correct without
//! per-transition locking.

use crate::compress::CompressionManager;
use crate::error::Error;
use crate::message::{Message, OpCode};
use crate::session::SessionHandle;
use finchdb_clock::fatal;
use finchdb_executor::{ScheduleFlags, ServiceExecutor, TaskName, TransportMode};
use num_enum::TryFromPrimitive;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;

/// The states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum State {
    /// Freshly constructed, not yet started.
    Created = 0,
    /// Receiving a new message from the remote.
    Source = 1,
    /// Waiting asynchronously for a message to arrive.
    SourceWait = 2,
    /// Running the received message through the request handler.
    Process = 3,
    /// Sending the reply to the remote.
    SinkWait = 4,
    /// Tearing the session down.
    EndSession = 5,
    /// Terminal; the cleanup hook has run.
    Ended = 6,
}

/// Who currently holds the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ownership {
    /// Nobody; the next scheduled step may claim it.
    Unowned = 0,
    /// A worker holds it exclusively for the current step.
    Owned = 1,
    /// Pinned to one thread for the lifetime of the connection
    /// (synchronous transport mode).
    Static = 2,
}

/// What the request handler wants done with its reply.
pub enum HandlerResponse {
    /// No reply; go source the next message.
    None,
    /// Send the reply, then source the next message.
    Reply(Message),
    /// Send the reply, then run the same request again without
    /// re-sourcing (exhaust-style streaming).
    Exhaust(Message),
}

/// Processes one request message into a response decision.
///
/// Command dispatch proper lives outside the transport; this is its seam.
/// The handler may use the session's compression manager to answer
/// negotiation handshakes.
pub trait RequestHandler: Send + Sync {
    /// Handles one decompressed request.
    fn handle(
        &self,
        session: &dyn crate::session::Session,
        compression: &mut CompressionManager,
        request: &Message,
    ) -> Result<HandlerResponse, Error>;
}

impl<F> RequestHandler for F
where
    F: Fn(
            &dyn crate::session::Session,
            &mut CompressionManager,
            &Message,
        ) -> Result<HandlerResponse, Error>
        + Send
        + Sync,
{
    fn handle(
        &self,
        session: &dyn crate::session::Session,
        compression: &mut CompressionManager,
        request: &Message,
    ) -> Result<HandlerResponse, Error> {
        self(session, compression, request)
    }
}

type CleanupHook = Box<dyn FnOnce() + Send>;

struct SsmData {
    compression: CompressionManager,
    /// Compressor id of the request being processed, echoed on the reply.
    last_compressor: Option<crate::compress::CompressorId>,
    /// The message a source step produced for the next process step.
    pending_request: Option<Message>,
    /// Set while an exhaust exchange keeps re-processing this request.
    exhaust_request: Option<Message>,
}

/// The per-connection finite automaton.
pub struct SessionStateMachine {
    session: SessionHandle,
    executor: Arc<ServiceExecutor>,
    handler: Arc<dyn RequestHandler>,
    state: AtomicU8,
    owned: AtomicU8,
    owner_thread: Mutex<Option<thread::ThreadId>>,
    data: Mutex<SsmData>,
    cleanup_hook: Mutex<Option<CleanupHook>>,
}

/// Claims step ownership of a machine for the current thread; dropping
/// (or `release`) hands it back unless the machine is statically pinned.
struct ThreadGuard<'a> {
    ssm: &'a SessionStateMachine,
    released: bool,
}

fn acquire_ownership(ssm: &SessionStateMachine) {
    match ssm.owned.compare_exchange(
        Ownership::Unowned as u8,
        Ownership::Owned as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => {
            *ssm.owner_thread.lock() = Some(thread::current().id());
        }
        Err(current) if current == Ownership::Static as u8 => {
            let mut owner = ssm.owner_thread.lock();
            match *owner {
                None => *owner = Some(thread::current().id()),
                Some(owner_id) => fatal::invariant(
                    owner_id == thread::current().id(),
                    "statically owned session touched from a foreign thread",
                ),
            }
        }
        Err(_) => fatal::invariant_failed("session step started while the machine is still owned"),
    }
}

impl<'a> ThreadGuard<'a> {
    fn acquire(ssm: &'a SessionStateMachine) -> Self {
        acquire_ownership(ssm);
        Self {
            ssm,
            released: false,
        }
    }

    /// Releases ownership between transitions so the next scheduled step
    /// (possibly inlined into the current stack by `MAY_RECURSE`) can
    /// claim it.
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.ssm.owned.load(Ordering::Acquire) == Ownership::Owned as u8 {
            *self.ssm.owner_thread.lock() = None;
            self.ssm.owned.store(Ownership::Unowned as u8, Ordering::Release);
        }
    }

    fn ensure_held(&mut self) {
        if self.released {
            acquire_ownership(self.ssm);
            self.released = false;
        }
    }
}

impl Drop for ThreadGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl SessionStateMachine {
    /// Creates a machine for `session` in the `Created` state.
    #[must_use]
    pub fn new(
        session: SessionHandle,
        executor: Arc<ServiceExecutor>,
        handler: Arc<dyn RequestHandler>,
        compression: CompressionManager,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            executor,
            handler,
            state: AtomicU8::new(State::Created as u8),
            owned: AtomicU8::new(Ownership::Unowned as u8),
            owner_thread: Mutex::new(None),
            data: Mutex::new(SsmData {
                compression,
                last_compressor: None,
                pending_request: None,
                exhaust_request: None,
            }),
            cleanup_hook: Mutex::new(None),
        })
    }

    /// The underlying session's id.
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    /// The underlying session.
    #[must_use]
    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> State {
        match State::try_from(self.state.load(Ordering::Acquire)) {
            Ok(state) => state,
            Err(_) => fatal::invariant_failed("session state word corrupted"),
        }
    }

    /// Installs the hook run exactly once on the terminal transition.
    /// Must be set before `start` and at most once.
    pub fn set_cleanup_hook(&self, hook: CleanupHook) {
        let mut slot = self.cleanup_hook.lock();
        fatal::invariant(slot.is_none(), "session cleanup hook installed twice");
        *slot = Some(hook);
    }

    /// Starts the machine: schedules its first source step.
    pub fn start(self: &Arc<Self>, ownership: Ownership) {
        if ownership == Ownership::Static {
            self.owned
                .store(Ownership::Static as u8, Ordering::Release);
        }
        let ssm = self.clone();
        if let Err(error) = self.executor.schedule(
            Box::new(move || ssm.run_next()),
            ScheduleFlags::empty(),
            TaskName::StartSession,
        ) {
            tracing::warn!(
                session_id = self.session_id(),
                %error,
                "failed to schedule session start; ending session"
            );
            let mut guard = ThreadGuard::acquire(self);
            self.end_session(&mut guard);
        }
    }

    /// Asks the session to terminate: the socket is ended and pending
    /// asynchronous operations are cancelled, which unwinds the machine
    /// through its normal error path. Idempotent.
    pub fn terminate(&self) {
        if self.state() == State::Ended {
            return;
        }
        self.session.cancel_async_operations();
        self.session.end();
    }

    /// Terminates unless the session's tags intersect `tags` (used to
    /// spare, say, administrative connections from bulk sweeps).
    pub fn terminate_if_tags_dont_match(&self, tags: crate::session::SessionTags) {
        let session_tags = self.session.tags();
        if (session_tags & tags).is_empty() {
            tracing::debug!(
                session_id = self.session_id(),
                "terminating session with unmatched tags"
            );
            self.terminate();
        }
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Dispatches the next step for the current state. Every scheduled
    /// task and async completion funnels through here.
    fn run_next(self: &Arc<Self>) {
        let mut guard = ThreadGuard::acquire(self);
        let result = match self.state() {
            State::Created | State::Source => self.source_step(&mut guard),
            State::Process => self.process_step(&mut guard),
            state => fatal::invariant_failed(&format!(
                "session step dispatched in unexpected state {state:?}"
            )),
        };
        self.complete_step(&mut guard, result);
    }

    fn complete_step(self: &Arc<Self>, guard: &mut ThreadGuard<'_>, result: Result<(), Error>) {
        if let Err(error) = result {
            match &error {
                Error::SessionClosed => {
                    tracing::debug!(session_id = self.session_id(), "end of stream")
                }
                Error::CallbackCancelled => {
                    tracing::debug!(session_id = self.session_id(), "session work cancelled")
                }
                error => tracing::debug!(
                    session_id = self.session_id(),
                    %error,
                    "ending session after error"
                ),
            }
            self.end_session(guard);
        }
    }

    fn source_step(self: &Arc<Self>, guard: &mut ThreadGuard<'_>) -> Result<(), Error> {
        self.set_state(State::Source);
        match self.executor.transport_mode() {
            TransportMode::Synchronous => {
                let result = self.session.source_message();
                self.source_callback(guard, result)
            }
            TransportMode::Asynchronous => {
                self.set_state(State::SourceWait);
                guard.release();
                let ssm = self.clone();
                self.session.async_source_message(Box::new(move |result| {
                    let mut guard = ThreadGuard::acquire(&ssm);
                    let outcome = ssm.source_callback(&mut guard, result);
                    ssm.complete_step(&mut guard, outcome);
                }));
                Ok(())
            }
        }
    }

    fn source_callback(
        self: &Arc<Self>,
        guard: &mut ThreadGuard<'_>,
        result: Result<Message, Error>,
    ) -> Result<(), Error> {
        let message = result?;
        self.data.lock().pending_request = Some(message);
        self.set_state(State::Process);
        self.schedule_next(guard, ScheduleFlags::MAY_RECURSE, TaskName::ProcessMessage)
    }

    fn process_step(self: &Arc<Self>, guard: &mut ThreadGuard<'_>) -> Result<(), Error> {
        let request = {
            let mut data = self.data.lock();
            data.pending_request
                .take()
                .or_else(|| data.exhaust_request.take())
        };
        let request = request.ok_or_else(|| Error::InternalError {
            message: "process step without a pending request".to_string(),
        })?;

        // Unwrap compressed frames, remembering which compressor carried
        // the request so the reply goes back the same way.
        let request = if request.header().op_code == OpCode::Compressed as i32 {
            let mut data = self.data.lock();
            let (message, id) = data.compression.decompress_message(&request)?;
            data.last_compressor = Some(id);
            message
        } else {
            self.data.lock().last_compressor = None;
            request
        };

        let response = {
            let mut data = self.data.lock();
            self.handler
                .handle(self.session.as_ref(), &mut data.compression, &request)?
        };

        match response {
            HandlerResponse::None => {
                self.set_state(State::Source);
                self.schedule_next(
                    guard,
                    ScheduleFlags::DEFERRED | ScheduleFlags::MAY_YIELD_BEFORE_SCHEDULE,
                    TaskName::SourceMessage,
                )
            }
            HandlerResponse::Reply(reply) => self.sink_step(guard, reply),
            HandlerResponse::Exhaust(reply) => {
                self.data.lock().exhaust_request = Some(request);
                self.sink_step(guard, reply)
            }
        }
    }

    fn sink_step(self: &Arc<Self>, guard: &mut ThreadGuard<'_>, reply: Message) -> Result<(), Error> {
        let reply = {
            let data = self.data.lock();
            match data.last_compressor {
                Some(id) => data.compression.compress_message(&reply, Some(id))?,
                None => reply,
            }
        };
        self.set_state(State::SinkWait);
        match self.executor.transport_mode() {
            TransportMode::Synchronous => {
                let result = self.session.sink_message(reply);
                self.sink_callback(guard, result)
            }
            TransportMode::Asynchronous => {
                guard.release();
                let ssm = self.clone();
                self.session.async_sink_message(
                    reply,
                    Box::new(move |result| {
                        let mut guard = ThreadGuard::acquire(&ssm);
                        let outcome = ssm.sink_callback(&mut guard, result);
                        ssm.complete_step(&mut guard, outcome);
                    }),
                );
                Ok(())
            }
        }
    }

    fn sink_callback(
        self: &Arc<Self>,
        guard: &mut ThreadGuard<'_>,
        result: Result<(), Error>,
    ) -> Result<(), Error> {
        result?;
        if self.data.lock().exhaust_request.is_some() {
            // Exhaust: loop straight back into processing the same
            // request without sourcing.
            self.set_state(State::Process);
            self.schedule_next(guard, ScheduleFlags::MAY_RECURSE, TaskName::ExhaustMessage)
        } else {
            self.set_state(State::Source);
            self.schedule_next(
                guard,
                ScheduleFlags::DEFERRED | ScheduleFlags::MAY_YIELD_BEFORE_SCHEDULE,
                TaskName::SourceMessage,
            )
        }
    }

    fn schedule_next(
        self: &Arc<Self>,
        guard: &mut ThreadGuard<'_>,
        flags: ScheduleFlags,
        name: TaskName,
    ) -> Result<(), Error> {
        // Hand ownership off before scheduling: with MAY_RECURSE the next
        // step may run inline inside this call.
        guard.release();
        let ssm = self.clone();
        self.executor
            .schedule(Box::new(move || ssm.run_next()), flags, name)
            .map_err(Error::from)
    }

    fn end_session(self: &Arc<Self>, guard: &mut ThreadGuard<'_>) {
        guard.ensure_held();
        self.set_state(State::EndSession);
        self.session.cancel_async_operations();
        self.session.end();
        self.cleanup();
    }

    /// Runs the cleanup hook exactly once, on the thread that makes the
    /// terminal transition.
    fn cleanup(&self) {
        let previous = self.state.swap(State::Ended as u8, Ordering::AcqRel);
        if previous == State::Ended as u8 {
            return;
        }
        let hook = self.cleanup_hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}
