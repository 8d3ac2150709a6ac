// SPDX-License-Identifier: Apache-2.0

//! Session state machine flows over the mock transport: echo cycles,
//! exhaust streaming, compression unwrapping, and cleanup guarantees.

use finchdb_executor::adaptive::{AdaptiveOptions, AdaptiveServiceExecutor};
use finchdb_executor::reactor::Reactor;
use finchdb_executor::synchronous::{SynchronousOptions, SynchronousServiceExecutor};
use finchdb_executor::ServiceExecutor;
use finchdb_transport::compress::{CompressionManager, CompressorId};
use finchdb_transport::message::{Message, OpCode};
use finchdb_transport::session::Session;
use finchdb_transport::state_machine::{HandlerResponse, Ownership, SessionStateMachine, State};
use finchdb_transport::testing::MockSession;
use finchdb_transport::{CompressorRegistry, Error, RequestHandler};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

fn registry(names: &[&str]) -> Arc<CompressorRegistry> {
    let names: Vec<String> = names.iter().map(|s| (*s).to_string()).collect();
    Arc::new(CompressorRegistry::with_enabled(&names).expect("known compressor names"))
}

fn sync_executor() -> Arc<ServiceExecutor> {
    let executor = SynchronousServiceExecutor::new(SynchronousOptions::default());
    executor.start().expect("executor starts");
    Arc::new(ServiceExecutor::Synchronous(executor))
}

fn echo_handler() -> Arc<dyn RequestHandler> {
    Arc::new(
        |_session: &dyn Session,
         _compression: &mut CompressionManager,
         request: &Message|
         -> Result<HandlerResponse, Error> {
            let reply = Message::new(
                0,
                request.header().request_id,
                OpCode::Msg as i32,
                request.body(),
            )?;
            Ok(HandlerResponse::Reply(reply))
        },
    )
}

/// Builds a machine over `session`, wiring a cleanup hook that signals
/// `tx` when it runs.
fn machine_with_hook(
    session: Arc<MockSession>,
    executor: Arc<ServiceExecutor>,
    handler: Arc<dyn RequestHandler>,
    names: &[&str],
    tx: mpsc::Sender<()>,
) -> Arc<SessionStateMachine> {
    let ssm = SessionStateMachine::new(
        session.as_handle(),
        executor,
        handler,
        CompressionManager::new(registry(names)),
    );
    ssm.set_cleanup_hook(Box::new(move || {
        tx.send(()).ok();
    }));
    ssm
}

#[test]
fn echoes_every_scripted_message() {
    let executor = sync_executor();
    let first = Message::new(1, 0, OpCode::Msg as i32, b"first").expect("message builds");
    let second = Message::new(2, 0, OpCode::Msg as i32, b"second").expect("message builds");
    let session = MockSession::with_script(vec![Ok(first), Ok(second)]);

    let (tx, rx) = mpsc::channel();
    let ssm = machine_with_hook(
        session.clone(),
        executor.clone(),
        echo_handler(),
        &["snappy"],
        tx,
    );
    ssm.start(Ownership::Static);

    rx.recv_timeout(Duration::from_secs(5))
        .expect("cleanup hook runs when the script is exhausted");
    assert_eq!(ssm.state(), State::Ended);

    let sunk = session.sunk_messages();
    assert_eq!(sunk.len(), 2);
    assert_eq!(sunk[0].body(), b"first");
    assert_eq!(sunk[0].header().response_to, 1);
    assert_eq!(sunk[1].body(), b"second");
    assert_eq!(sunk[1].header().response_to, 2);
    assert!(executor.shutdown(Duration::from_secs(1)).is_ok());
}

#[test]
fn cleanup_hook_runs_exactly_once() {
    let executor = sync_executor();
    let session = MockSession::closed();
    let runs = Arc::new(AtomicUsize::new(0));

    let ssm = SessionStateMachine::new(
        session.as_handle(),
        executor.clone(),
        echo_handler(),
        CompressionManager::new(registry(&["snappy"])),
    );
    let hook_runs = runs.clone();
    let (tx, rx) = mpsc::channel();
    ssm.set_cleanup_hook(Box::new(move || {
        let _ = hook_runs.fetch_add(1, Ordering::AcqRel);
        tx.send(()).ok();
    }));
    ssm.start(Ownership::Static);

    rx.recv_timeout(Duration::from_secs(5))
        .expect("cleanup hook runs");
    // Redundant terminations must not re-run the hook.
    ssm.terminate();
    ssm.terminate();
    assert_eq!(runs.load(Ordering::Acquire), 1);
    assert_eq!(ssm.state(), State::Ended);
    assert!(executor.shutdown(Duration::from_secs(1)).is_ok());
}

/// An exhaust response sinks the reply and re-processes the same request
/// without sourcing anything new.
#[test]
fn exhaust_replies_loop_without_resourcing() {
    let executor = sync_executor();
    let request = Message::new(9, 0, OpCode::Msg as i32, b"stream-me").expect("message builds");
    let session = MockSession::with_script(vec![Ok(request)]);

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    let handler: Arc<dyn RequestHandler> = Arc::new(
        move |_session: &dyn Session,
              _compression: &mut CompressionManager,
              request: &Message|
              -> Result<HandlerResponse, Error> {
            assert_eq!(request.body(), b"stream-me");
            let call = handler_calls.fetch_add(1, Ordering::AcqRel);
            let reply = Message::new(
                0,
                request.header().request_id,
                OpCode::Msg as i32,
                format!("chunk-{call}").as_bytes(),
            )?;
            if call < 2 {
                Ok(HandlerResponse::Exhaust(reply))
            } else {
                Ok(HandlerResponse::Reply(reply))
            }
        },
    );

    let (tx, rx) = mpsc::channel();
    let ssm = machine_with_hook(session.clone(), executor.clone(), handler, &["snappy"], tx);
    ssm.start(Ownership::Static);

    rx.recv_timeout(Duration::from_secs(5))
        .expect("session drains after the exhaust stream finishes");
    assert_eq!(calls.load(Ordering::Acquire), 3);
    let sunk = session.sunk_messages();
    assert_eq!(sunk.len(), 3);
    assert_eq!(sunk[0].body(), b"chunk-0");
    assert_eq!(sunk[2].body(), b"chunk-2");
    assert!(executor.shutdown(Duration::from_secs(1)).is_ok());
}

#[test]
fn handler_errors_end_the_session() {
    let executor = sync_executor();
    let request = Message::new(3, 0, OpCode::Msg as i32, b"boom").expect("message builds");
    let session = MockSession::with_script(vec![Ok(request)]);

    let handler: Arc<dyn RequestHandler> = Arc::new(
        |_session: &dyn Session,
         _compression: &mut CompressionManager,
         _request: &Message|
         -> Result<HandlerResponse, Error> {
            Err(Error::Handler {
                message: "unsupported command".to_string(),
            })
        },
    );

    let (tx, rx) = mpsc::channel();
    let ssm = machine_with_hook(session.clone(), executor.clone(), handler, &["snappy"], tx);
    ssm.start(Ownership::Static);

    rx.recv_timeout(Duration::from_secs(5))
        .expect("failed sessions still clean up");
    assert!(session.is_ended());
    assert!(session.sunk_messages().is_empty());
    assert!(executor.shutdown(Duration::from_secs(1)).is_ok());
}

/// A compressed request is unwrapped before the handler sees it, and the
/// reply goes back under the same compressor.
#[test]
fn compressed_requests_are_unwrapped_and_replies_rewrapped() {
    let executor = sync_executor();

    // Client side: negotiate snappy and compress the request.
    let mut client = CompressionManager::new(registry(&["snappy"]));
    let _ = client.server_negotiate(&["snappy".to_string()]);
    let request = Message::new(5, 0, OpCode::Msg as i32, b"squeeze").expect("message builds");
    let compressed = client
        .compress_message(&request, None)
        .expect("client compresses");
    assert_eq!(compressed.header().op_code, OpCode::Compressed as i32);

    let session = MockSession::with_script(vec![Ok(compressed)]);
    let handler: Arc<dyn RequestHandler> = Arc::new(
        |_session: &dyn Session,
         _compression: &mut CompressionManager,
         request: &Message|
         -> Result<HandlerResponse, Error> {
            // The machine already unwrapped the frame.
            assert_eq!(request.header().op_code, OpCode::Msg as i32);
            assert_eq!(request.body(), b"squeeze");
            let reply = Message::new(
                0,
                request.header().request_id,
                OpCode::Msg as i32,
                b"squeezed back",
            )?;
            Ok(HandlerResponse::Reply(reply))
        },
    );

    let (tx, rx) = mpsc::channel();
    let ssm = machine_with_hook(session.clone(), executor.clone(), handler, &["snappy"], tx);
    ssm.start(Ownership::Static);

    rx.recv_timeout(Duration::from_secs(5))
        .expect("session drains");
    let sunk = session.sunk_messages();
    assert_eq!(sunk.len(), 1);
    assert_eq!(sunk[0].header().op_code, OpCode::Compressed as i32);
    let (reply, id) = client
        .decompress_message(&sunk[0])
        .expect("client decompresses the reply");
    assert_eq!(id, CompressorId::Snappy);
    assert_eq!(reply.body(), b"squeezed back");
    assert!(executor.shutdown(Duration::from_secs(1)).is_ok());
}

/// The same echo flow through the asynchronous path: an adaptive executor
/// drives the machine with `Owned` ownership and reactor-posted
/// completions.
#[test]
fn async_mode_echoes_through_the_reactor() {
    let reactor = Reactor::new();
    let executor = AdaptiveServiceExecutor::new(
        reactor.clone(),
        AdaptiveOptions {
            reserved_threads: 2,
            worker_run_time: Duration::from_millis(100),
            run_time_jitter_pct: 0,
            stuck_thread_timeout: Duration::from_millis(50),
            max_queue_latency: Duration::from_millis(5),
            idle_pct_threshold: 0,
            recursion_limit: 4,
        },
    );
    executor.start().expect("executor starts");
    let executor = Arc::new(ServiceExecutor::Adaptive(executor));

    let first = Message::new(11, 0, OpCode::Msg as i32, b"async-first").expect("message builds");
    let second = Message::new(12, 0, OpCode::Msg as i32, b"async-second").expect("message builds");
    let session = MockSession::with_script_on_reactor(vec![Ok(first), Ok(second)], reactor);

    let (tx, rx) = mpsc::channel();
    let ssm = machine_with_hook(
        session.clone(),
        executor.clone(),
        echo_handler(),
        &["snappy"],
        tx,
    );
    ssm.start(Ownership::Owned);

    rx.recv_timeout(Duration::from_secs(5))
        .expect("async session drains");
    let sunk = session.sunk_messages();
    assert_eq!(sunk.len(), 2);
    assert_eq!(sunk[0].body(), b"async-first");
    assert_eq!(sunk[1].body(), b"async-second");
    assert!(executor.shutdown(Duration::from_secs(1)).is_ok());
}
