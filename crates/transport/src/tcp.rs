// SPDX-License-Identifier: Apache-2.0

//! TCP transport: the listener, and sessions over `TcpStream`.
//!
//! In synchronous mode sessions use blocking reads and writes with the
//! socket timeout. In asynchronous mode sockets are non-blocking; partial
//! frames are accumulated by a small read/write state machine that parks
//! itself in the readiness poller and posts completions to the reactor.

use crate::error::Error;
use crate::message::{MESSAGE_HEADER_SIZE, Message, MessageHeader};
use crate::poller::{Interest, PollEvent, ReadinessPoller};
use crate::session::{
    Session, SessionHandle, SessionTagState, SinkCallback, SourceCallback, next_session_id,
};
use bytes::{BufMut, BytesMut};
use finchdb_executor::TransportMode;
use finchdb_executor::reactor::{Reactor, ScheduleMode};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

/// Incremental state of an in-flight asynchronous read.
struct ReadProgress {
    buf: BytesMut,
    need: usize,
    have_header: bool,
}

impl ReadProgress {
    fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MESSAGE_HEADER_SIZE),
            need: MESSAGE_HEADER_SIZE,
            have_header: false,
        }
    }
}

/// Incremental state of an in-flight asynchronous write.
struct WriteProgress {
    message: Message,
    written: usize,
}

#[derive(Default)]
struct AsyncOps {
    source_token: Option<u64>,
    sink_token: Option<u64>,
}

/// A session over one TCP connection.
pub struct TcpSession {
    weak_self: Weak<TcpSession>,
    id: u64,
    stream: Arc<TcpStream>,
    remote: SocketAddr,
    local: SocketAddr,
    mode: TransportMode,
    reactor: Option<Reactor>,
    poller: Option<Arc<ReadinessPoller>>,
    tag_state: SessionTagState,
    ended: AtomicBool,
    async_ops: Mutex<AsyncOps>,
}

impl TcpSession {
    /// Wraps an accepted stream. Asynchronous sessions are switched to
    /// non-blocking mode and need the reactor and poller.
    pub fn new(
        stream: TcpStream,
        mode: TransportMode,
        reactor: Option<Reactor>,
        poller: Option<Arc<ReadinessPoller>>,
    ) -> Result<SessionHandle, Error> {
        let remote = stream
            .peer_addr()
            .map_err(|e| Error::socket("failed to read peer address", e))?;
        let local = stream
            .local_addr()
            .map_err(|e| Error::socket("failed to read local address", e))?;
        if mode == TransportMode::Asynchronous {
            stream
                .set_nonblocking(true)
                .map_err(|e| Error::socket("failed to make socket non-blocking", e))?;
        }

        let session = Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            id: next_session_id(),
            stream: Arc::new(stream),
            remote,
            local,
            mode,
            reactor,
            poller,
            tag_state: SessionTagState::new(),
            ended: AtomicBool::new(false),
            async_ops: Mutex::new(AsyncOps::default()),
        });
        Ok(session)
    }

    fn strong_self(&self) -> Option<Arc<TcpSession>> {
        self.weak_self.upgrade()
    }

    /// Delivers an async completion on a reactor thread when possible.
    fn post_completion(&self, completion: Box<dyn FnOnce() + Send>) {
        match &self.reactor {
            Some(reactor) => reactor.schedule(ScheduleMode::Post, completion),
            None => completion(),
        }
    }

    /// Makes as much read progress as the socket allows right now.
    fn advance_read(&self, progress: &mut ReadProgress) -> Result<Option<Message>, Error> {
        loop {
            while progress.buf.len() < progress.need {
                let mut chunk = vec![0u8; progress.need - progress.buf.len()];
                match (&*self.stream).read(&mut chunk) {
                    Ok(0) => return Err(Error::SessionClosed),
                    Ok(n) => progress.buf.put_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(Error::socket("failed to read message", e)),
                }
            }
            if progress.have_header {
                let frame = std::mem::take(&mut progress.buf).freeze();
                return Message::from_bytes(frame).map(Some);
            }
            let header = MessageHeader::parse(&progress.buf)?;
            progress.need = header.validate_length()?;
            progress.have_header = true;
            if progress.need == MESSAGE_HEADER_SIZE {
                let frame = std::mem::take(&mut progress.buf).freeze();
                return Message::from_bytes(frame).map(Some);
            }
        }
    }

    /// Makes as much write progress as the socket allows right now.
    fn advance_write(&self, progress: &mut WriteProgress) -> Result<bool, Error> {
        let frame = progress.message.as_bytes();
        while progress.written < frame.len() {
            match (&*self.stream).write(&frame[progress.written..]) {
                Ok(0) => {
                    return Err(Error::socket(
                        "failed to write message",
                        std::io::Error::from(std::io::ErrorKind::WriteZero),
                    ));
                }
                Ok(n) => progress.written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::socket("failed to write message", e)),
            }
        }
        Ok(true)
    }

    fn drive_source(self: &Arc<Self>, mut progress: ReadProgress, callback: SourceCallback) {
        match self.advance_read(&mut progress) {
            Ok(Some(message)) => {
                self.post_completion(Box::new(move || callback(Ok(message))));
            }
            Ok(None) => self.park_source(progress, callback),
            Err(error) => self.post_completion(Box::new(move || callback(Err(error)))),
        }
    }

    fn park_source(self: &Arc<Self>, progress: ReadProgress, callback: SourceCallback) {
        let Some(poller) = self.poller.clone() else {
            self.post_completion(Box::new(move || {
                callback(Err(Error::InternalError {
                    message: "asynchronous source without a readiness poller".to_string(),
                }))
            }));
            return;
        };
        let session = self.clone();
        let mut ops = self.async_ops.lock();
        let token = poller.register(
            self.stream.clone(),
            Interest::Read,
            Box::new(move |event| {
                session.async_ops.lock().source_token = None;
                match event {
                    PollEvent::Ready => session.drive_source(progress, callback),
                    PollEvent::Cancelled => session.post_completion(Box::new(move || {
                        callback(Err(Error::CallbackCancelled))
                    })),
                }
            }),
        );
        ops.source_token = Some(token);
    }

    fn drive_sink(self: &Arc<Self>, mut progress: WriteProgress, callback: SinkCallback) {
        match self.advance_write(&mut progress) {
            Ok(true) => self.post_completion(Box::new(move || callback(Ok(())))),
            Ok(false) => self.park_sink(progress, callback),
            Err(error) => self.post_completion(Box::new(move || callback(Err(error)))),
        }
    }

    fn park_sink(self: &Arc<Self>, progress: WriteProgress, callback: SinkCallback) {
        let Some(poller) = self.poller.clone() else {
            self.post_completion(Box::new(move || {
                callback(Err(Error::InternalError {
                    message: "asynchronous sink without a readiness poller".to_string(),
                }))
            }));
            return;
        };
        let session = self.clone();
        let mut ops = self.async_ops.lock();
        let token = poller.register(
            self.stream.clone(),
            Interest::Write,
            Box::new(move |event| {
                session.async_ops.lock().sink_token = None;
                match event {
                    PollEvent::Ready => session.drive_sink(progress, callback),
                    PollEvent::Cancelled => session.post_completion(Box::new(move || {
                        callback(Err(Error::CallbackCancelled))
                    })),
                }
            }),
        );
        ops.sink_token = Some(token);
    }
}

impl Session for TcpSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn remote(&self) -> SocketAddr {
        self.remote
    }

    fn local(&self) -> SocketAddr {
        self.local
    }

    fn source_message(&self) -> Result<Message, Error> {
        Message::read_from(&mut &*self.stream)
    }

    fn sink_message(&self, message: Message) -> Result<(), Error> {
        message.write_to(&mut &*self.stream)
    }

    fn async_source_message(&self, callback: SourceCallback) {
        match self.strong_self() {
            Some(session) => session.drive_source(ReadProgress::new(), callback),
            None => callback(Err(Error::SessionClosed)),
        }
    }

    fn async_sink_message(&self, message: Message, callback: SinkCallback) {
        let progress = WriteProgress {
            message,
            written: 0,
        };
        match self.strong_self() {
            Some(session) => session.drive_sink(progress, callback),
            None => callback(Err(Error::SessionClosed)),
        }
    }

    fn cancel_async_operations(&self) {
        let (source, sink) = {
            let mut ops = self.async_ops.lock();
            (ops.source_token.take(), ops.sink_token.take())
        };
        if let Some(poller) = &self.poller {
            if let Some(token) = source {
                poller.cancel(token);
            }
            if let Some(token) = sink {
                poller.cancel(token);
            }
        }
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        if self.mode == TransportMode::Synchronous {
            let _ = self.stream.set_read_timeout(timeout);
            let _ = self.stream.set_write_timeout(timeout);
        }
    }

    fn is_connected(&self) -> bool {
        !self.ended.load(Ordering::Acquire)
    }

    fn end(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.cancel_async_operations();
    }

    fn tag_state(&self) -> &SessionTagState {
        &self.tag_state
    }
}

/// Where the ingress TCP transport binds and how it hands sessions over.
pub struct TcpTransportLayer {
    inner: Arc<TcpInner>,
}

struct TcpInner {
    bind_address: SocketAddr,
    mode: TransportMode,
    reactor: Option<Reactor>,
    entry_point: Arc<crate::entry_point::ServiceEntryPoint>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    poller: Mutex<Option<Arc<ReadinessPoller>>>,
    running: AtomicBool,
    accept_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TcpTransportLayer {
    /// Creates a transport layer that will feed `entry_point`.
    #[must_use]
    pub fn new(
        bind_address: SocketAddr,
        mode: TransportMode,
        reactor: Option<Reactor>,
        entry_point: Arc<crate::entry_point::ServiceEntryPoint>,
    ) -> Self {
        Self {
            inner: Arc::new(TcpInner {
                bind_address,
                mode,
                reactor,
                entry_point,
                listener: Mutex::new(None),
                local_addr: Mutex::new(None),
                poller: Mutex::new(None),
                running: AtomicBool::new(false),
                accept_thread: Mutex::new(None),
            }),
        }
    }

    /// Binds the listening socket.
    pub fn setup(&self) -> Result<(), Error> {
        let listener = TcpListener::bind(self.inner.bind_address)
            .map_err(|e| Error::socket("failed to bind listener", e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::socket("failed to configure listener", e))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::socket("failed to read listener address", e))?;
        *self.inner.local_addr.lock() = Some(local);
        *self.inner.listener.lock() = Some(listener);
        Ok(())
    }

    /// The bound address, once `setup` has run.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Starts accepting connections.
    pub fn start(&self) -> Result<(), Error> {
        let listener = self
            .inner
            .listener
            .lock()
            .take()
            .ok_or_else(|| Error::InternalError {
                message: "transport started before setup".to_string(),
            })?;
        if self.inner.mode == TransportMode::Asynchronous {
            *self.inner.poller.lock() = Some(Arc::new(ReadinessPoller::new()?));
        }
        self.inner.running.store(true, Ordering::Release);

        let inner = self.inner.clone();
        let thread = thread::Builder::new()
            .name("listener".to_string())
            .spawn(move || accept_loop(&inner, &listener))
            .map_err(|e| Error::InternalError {
                message: format!("failed to spawn listener thread: {e}"),
            })?;
        *self.inner.accept_thread.lock() = Some(thread);

        tracing::info!(address = %self.local_addr().unwrap_or(self.inner.bind_address), "listening for connections");
        Ok(())
    }

    /// Stops accepting and tears the poller down. Existing sessions are
    /// the entry point's to drain.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        let thread = self.inner.accept_thread.lock().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::error!("listener thread panicked during shutdown");
            }
        }
        let poller = self.inner.poller.lock().take();
        if let Some(poller) = poller {
            poller.shutdown();
        }
    }
}

fn accept_loop(inner: &Arc<TcpInner>, listener: &TcpListener) {
    while inner.running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, remote)) => {
                if let Err(error) = stream.set_nodelay(true) {
                    tracing::debug!(%remote, %error, "failed to set TCP_NODELAY");
                }
                let poller = inner.poller.lock().clone();
                match TcpSession::new(stream, inner.mode, inner.reactor.clone(), poller) {
                    Ok(session) => inner.entry_point.start_session(session),
                    Err(error) => {
                        tracing::warn!(%remote, %error, "failed to wrap accepted connection")
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(error) => {
                if !inner.running.load(Ordering::Acquire) {
                    break;
                }
                tracing::warn!(%error, "accept failed");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
    tracing::debug!("listener thread exiting");
}
