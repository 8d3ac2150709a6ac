// SPDX-License-Identifier: Apache-2.0

//! Admission, tagged termination, and shutdown draining at the service
//! entry point.

use finchdb_executor::synchronous::{SynchronousOptions, SynchronousServiceExecutor};
use finchdb_executor::{NoopServiceExecutor, ServiceExecutor};
use finchdb_transport::compress::CompressionManager;
use finchdb_transport::message::{Message, OpCode};
use finchdb_transport::session::Session;
use finchdb_transport::state_machine::HandlerResponse;
use finchdb_transport::testing::MockSession;
use finchdb_transport::{CompressorRegistry, Error, RequestHandler, ServiceEntryPoint, SessionTags};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn registry() -> Arc<CompressorRegistry> {
    Arc::new(CompressorRegistry::with_enabled(&["snappy".to_string()]).expect("snappy is known"))
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

fn sleeping_handler(pause: Duration) -> Arc<dyn RequestHandler> {
    Arc::new(
        move |_session: &dyn Session,
              _compression: &mut CompressionManager,
              request: &Message|
              -> Result<HandlerResponse, Error> {
            thread::sleep(pause);
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

fn noop_executor() -> Arc<ServiceExecutor> {
    Arc::new(ServiceExecutor::Noop(NoopServiceExecutor::new()))
}

fn sync_executor() -> Arc<ServiceExecutor> {
    let executor = SynchronousServiceExecutor::new(SynchronousOptions::default());
    executor.start().expect("executor starts");
    Arc::new(ServiceExecutor::Synchronous(executor))
}

fn wait_until(deadline_from_now: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + deadline_from_now;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    predicate()
}

/// Scenario: `max_connections = 2`, three sequential accepts. Two
/// sessions go live, the third is dropped without ever being counted.
#[test]
fn admission_cap_is_never_exceeded() {
    // The noop executor never runs session steps, so admitted sessions
    // stay open for the duration of the test.
    let entry_point = ServiceEntryPoint::new(noop_executor(), echo_handler(), registry(), 2);

    let first = MockSession::closed();
    let second = MockSession::closed();
    let third = MockSession::closed();
    entry_point.start_session(first.as_handle());
    entry_point.start_session(second.as_handle());
    entry_point.start_session(third.as_handle());

    assert_eq!(entry_point.current_connections(), 2);
    assert_eq!(entry_point.created_connections(), 2);
    assert!(!first.is_ended());
    assert!(!second.is_ended());
    // The rejected socket was closed and never admitted.
    assert!(third.is_ended());

    let stats = entry_point.session_stats();
    assert_eq!(stats.current, 2);
    assert_eq!(stats.total_created, 2);
    assert_eq!(stats.available, 0);
}

/// A session that runs to end-of-stream is removed from the live list
/// and the counters drop back.
#[test]
fn finished_sessions_are_unlinked() {
    let executor = sync_executor();
    let entry_point = ServiceEntryPoint::new(executor.clone(), echo_handler(), registry(), 16);

    let message = Message::new(1, 0, OpCode::Msg as i32, b"ping").expect("message builds");
    let session = MockSession::with_script(vec![Ok(message)]);
    entry_point.start_session(session.as_handle());

    assert!(
        wait_until(Duration::from_secs(5), || {
            entry_point.current_connections() == 0
        }),
        "session should drain after its script is exhausted"
    );
    assert_eq!(entry_point.created_connections(), 1);
    assert_eq!(session.sunk_messages().len(), 1);
    assert!(session.is_ended());
    assert!(executor.shutdown(Duration::from_secs(1)).is_ok());
}

/// Tagged termination spares sessions whose tags intersect the mask.
#[test]
fn end_all_sessions_spares_matching_tags() {
    let entry_point = ServiceEntryPoint::new(noop_executor(), echo_handler(), registry(), 16);

    let admin = MockSession::closed();
    admin.set_tags(SessionTags::KEEP_OPEN);
    let plain = MockSession::closed();

    entry_point.start_session(admin.as_handle());
    entry_point.start_session(plain.as_handle());

    entry_point.end_all_sessions(SessionTags::KEEP_OPEN);
    assert!(!admin.is_ended());
    assert!(plain.is_ended());
}

/// Scenario: four active sessions each mid-request; shutdown(1s) drains
/// them all and reports success.
#[test]
fn graceful_shutdown_drains_active_sessions() {
    let executor = sync_executor();
    let entry_point = Arc::new(ServiceEntryPoint::new(
        executor.clone(),
        sleeping_handler(Duration::from_millis(200)),
        registry(),
        16,
    ));

    let sessions: Vec<_> = (0..4)
        .map(|i| {
            let message =
                Message::new(i, 0, OpCode::Msg as i32, b"work").expect("message builds");
            let session = MockSession::with_script(vec![Ok(message)]);
            entry_point.start_session(session.as_handle());
            session
        })
        .collect();

    // Let every worker get into its 200ms handler call.
    thread::sleep(Duration::from_millis(50));

    let drained = entry_point.shutdown(Duration::from_secs(1));
    assert!(drained, "all sessions should drain within the grace period");
    assert_eq!(entry_point.current_connections(), 0);
    for session in &sessions {
        assert!(session.is_ended());
    }
    assert!(executor.shutdown(Duration::from_secs(1)).is_ok());
}

/// Shutdown reports failure when a session cannot drain in time.
#[test]
fn shutdown_reports_undrained_sessions() {
    let entry_point = ServiceEntryPoint::new(noop_executor(), echo_handler(), registry(), 16);
    let stuck = MockSession::closed();
    entry_point.start_session(stuck.as_handle());

    // The noop executor never runs the session, so its cleanup hook
    // cannot fire.
    let start = Instant::now();
    let drained = entry_point.shutdown(Duration::from_millis(300));
    assert!(!drained);
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert_eq!(entry_point.current_connections(), 1);
}
