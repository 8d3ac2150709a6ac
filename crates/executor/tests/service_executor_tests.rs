// SPDX-License-Identifier: Apache-2.0

//! End-to-end behavior of the adaptive executor: elasticity, starvation
//! response, stuck detection, and shutdown draining.

use finchdb_executor::adaptive::{AdaptiveOptions, AdaptiveServiceExecutor};
use finchdb_executor::reactor::Reactor;
use finchdb_executor::{Error, ScheduleFlags, TaskName};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Polls `predicate` until it holds or `deadline_from_now` elapses.
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

fn quick_options() -> AdaptiveOptions {
    AdaptiveOptions {
        reserved_threads: 1,
        worker_run_time: Duration::from_millis(1000),
        run_time_jitter_pct: 0,
        stuck_thread_timeout: Duration::from_millis(100),
        max_queue_latency: Duration::from_millis(5),
        idle_pct_threshold: 0,
        recursion_limit: 0,
    }
}

#[test]
fn basic_task_runs() {
    let executor = AdaptiveServiceExecutor::new(Reactor::new(), quick_options());
    executor.start().expect("executor starts");

    let (tx, rx) = mpsc::channel();
    let status = executor.schedule(
        Box::new(move || {
            tx.send(()).ok();
        }),
        ScheduleFlags::empty(),
        TaskName::StartSession,
    );
    assert!(status.is_ok());
    rx.recv_timeout(Duration::from_secs(5))
        .expect("scheduled task must run");

    assert!(executor.shutdown(Duration::from_millis(500)).is_ok());
}

#[test]
fn schedule_fails_before_startup() {
    let executor = AdaptiveServiceExecutor::new(Reactor::new(), quick_options());
    let status = executor.schedule(
        Box::new(|| {}),
        ScheduleFlags::empty(),
        TaskName::StartSession,
    );
    assert!(matches!(status, Err(Error::ShutdownInProgress)));
}

/// With no reserve and a zero idle threshold, a single task round-trips
/// through a starvation-spawned worker and the pool drains back to zero.
#[test]
fn single_task_round_trip_with_zero_reserve() {
    let executor = AdaptiveServiceExecutor::new(
        Reactor::new(),
        AdaptiveOptions {
            reserved_threads: 0,
            worker_run_time: Duration::from_millis(50),
            run_time_jitter_pct: 0,
            stuck_thread_timeout: Duration::from_millis(20),
            max_queue_latency: Duration::from_millis(1),
            idle_pct_threshold: 0,
            recursion_limit: 0,
        },
    );
    executor.start().expect("executor starts");
    assert_eq!(executor.threads_running(), 0);

    let (tx, rx) = mpsc::channel();
    let status = executor.schedule(
        Box::new(move || {
            tx.send(42).ok();
        }),
        ScheduleFlags::empty(),
        TaskName::ProcessMessage,
    );
    assert!(status.is_ok());
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).expect("task runs"),
        42
    );
    assert!(executor.threads_running() >= 1);

    // After the run window the worker notices it has nothing to do and
    // exits; with reserved_threads = 0 the pool drops all the way to zero.
    assert!(
        wait_until(Duration::from_secs(5), || executor.threads_running() == 0),
        "pool should drain to zero when idle"
    );
    assert!(executor.shutdown(Duration::from_millis(500)).is_ok());
}

/// Sleeping tasks saturate the single reserved worker; the controller
/// notices the queue outwaiting `max_queue_latency` and adds threads.
#[test]
fn starvation_spawns_threads() {
    let executor = AdaptiveServiceExecutor::new(
        Reactor::new(),
        AdaptiveOptions {
            reserved_threads: 1,
            worker_run_time: Duration::from_millis(1000),
            run_time_jitter_pct: 0,
            stuck_thread_timeout: Duration::from_millis(20),
            max_queue_latency: Duration::from_millis(5),
            idle_pct_threshold: 0,
            recursion_limit: 0,
        },
    );
    executor.start().expect("executor starts");

    let completed = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let completed = completed.clone();
        let status = executor.schedule(
            Box::new(move || {
                thread::sleep(Duration::from_millis(100));
                let _ = completed.fetch_add(1, Ordering::AcqRel);
            }),
            ScheduleFlags::empty(),
            TaskName::ProcessMessage,
        );
        assert!(status.is_ok());
    }

    assert!(
        wait_until(Duration::from_secs(2), || executor.threads_running() >= 2),
        "starvation response should add worker threads"
    );
    assert!(
        wait_until(Duration::from_secs(10), || {
            completed.load(Ordering::Acquire) == 10
        }),
        "all queued tasks eventually run"
    );

    let stats = executor.stats();
    assert!(stats.threads_started_by.starvation >= 1);
    assert_eq!(stats.total_executed, 10);

    assert!(executor.shutdown(Duration::from_secs(1)).is_ok());
}

/// A task that never returns blocks the only worker. Stuck detection adds
/// a thread so the task queued behind it still completes.
#[test]
fn stuck_detection_restores_progress() {
    let executor = AdaptiveServiceExecutor::new(
        Reactor::new(),
        AdaptiveOptions {
            reserved_threads: 1,
            worker_run_time: Duration::from_millis(1000),
            run_time_jitter_pct: 0,
            stuck_thread_timeout: Duration::from_millis(100),
            // Effectively disable the starvation response so the stuck
            // path is what restores progress.
            max_queue_latency: Duration::from_secs(600),
            idle_pct_threshold: 0,
            recursion_limit: 0,
        },
    );
    executor.start().expect("executor starts");

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let status = executor.schedule(
        Box::new(move || {
            // Block the worker until the test releases it.
            let _ = release_rx.recv_timeout(Duration::from_secs(30));
        }),
        ScheduleFlags::empty(),
        TaskName::ProcessMessage,
    );
    assert!(status.is_ok());

    // Give the blocker time to occupy the worker before queueing behind it.
    thread::sleep(Duration::from_millis(50));

    let (tx, rx) = mpsc::channel();
    let status = executor.schedule(
        Box::new(move || {
            tx.send(()).ok();
        }),
        ScheduleFlags::empty(),
        TaskName::ProcessMessage,
    );
    assert!(status.is_ok());

    rx.recv_timeout(Duration::from_secs(5))
        .expect("the second task completes despite the blocked worker");
    assert!(executor.stats().threads_started_by.stuck_detection >= 1);

    release_tx.send(()).ok();
    assert!(executor.shutdown(Duration::from_secs(1)).is_ok());
}

/// Once the controller has run, the pool holds the configured reserve even
/// with no work at all.
#[test]
fn reserved_threads_are_maintained() {
    let executor = AdaptiveServiceExecutor::new(
        Reactor::new(),
        AdaptiveOptions {
            reserved_threads: 2,
            worker_run_time: Duration::from_millis(50),
            run_time_jitter_pct: 20,
            stuck_thread_timeout: Duration::from_millis(20),
            max_queue_latency: Duration::from_millis(5),
            idle_pct_threshold: 99,
            recursion_limit: 0,
        },
    );
    executor.start().expect("executor starts");

    assert!(wait_until(Duration::from_secs(2), || {
        executor.threads_running() >= 2
    }));
    // Idle windows come and go; the reserve must hold through them.
    thread::sleep(Duration::from_millis(300));
    assert!(executor.threads_running() >= 2);

    assert!(executor.shutdown(Duration::from_secs(1)).is_ok());
}

/// Deferred tasks run when convenient but never trigger thread creation.
#[test]
fn deferred_task_runs_without_spawning() {
    let executor = AdaptiveServiceExecutor::new(Reactor::new(), quick_options());
    executor.start().expect("executor starts");

    let (tx, rx) = mpsc::channel();
    let status = executor.schedule(
        Box::new(move || {
            tx.send(()).ok();
        }),
        ScheduleFlags::DEFERRED,
        TaskName::SourceMessage,
    );
    assert!(status.is_ok());
    rx.recv_timeout(Duration::from_secs(5))
        .expect("deferred task still runs");

    assert!(executor.shutdown(Duration::from_secs(1)).is_ok());
}

/// A `MAY_RECURSE` submission from a pool worker below the limit runs
/// synchronously in the submitter's stack.
#[test]
fn may_recurse_runs_inline_on_pool_threads() {
    let mut options = quick_options();
    options.recursion_limit = 2;
    let executor = Arc::new(AdaptiveServiceExecutor::new(Reactor::new(), options));
    executor.start().expect("executor starts");

    let (tx, rx) = mpsc::channel();
    let outer_executor = executor.clone();
    let status = executor.schedule(
        Box::new(move || {
            let ran_inline = Arc::new(AtomicUsize::new(0));
            let inner_flag = ran_inline.clone();
            let status = outer_executor.schedule(
                Box::new(move || {
                    let _ = inner_flag.fetch_add(1, Ordering::AcqRel);
                }),
                ScheduleFlags::MAY_RECURSE,
                TaskName::ProcessMessage,
            );
            assert!(status.is_ok());
            // Inline execution completed before schedule() returned.
            tx.send(ran_inline.load(Ordering::Acquire)).ok();
        }),
        ScheduleFlags::empty(),
        TaskName::StartSession,
    );
    assert!(status.is_ok());

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5))
            .expect("outer task runs"),
        1
    );
    assert!(executor.shutdown(Duration::from_secs(1)).is_ok());
}

/// With `recursion_limit = 0`, `MAY_RECURSE` behaves like a plain post.
#[test]
fn zero_recursion_limit_always_posts() {
    let executor = Arc::new(AdaptiveServiceExecutor::new(Reactor::new(), quick_options()));
    executor.start().expect("executor starts");

    let (tx, rx) = mpsc::channel();
    let outer_executor = executor.clone();
    let status = executor.schedule(
        Box::new(move || {
            let ran_inline = Arc::new(AtomicUsize::new(0));
            let inner_flag = ran_inline.clone();
            let status = outer_executor.schedule(
                Box::new(move || {
                    let _ = inner_flag.fetch_add(1, Ordering::AcqRel);
                }),
                ScheduleFlags::MAY_RECURSE,
                TaskName::ProcessMessage,
            );
            assert!(status.is_ok());
            tx.send(ran_inline.load(Ordering::Acquire)).ok();
        }),
        ScheduleFlags::empty(),
        TaskName::StartSession,
    );
    assert!(status.is_ok());

    // Not inline: the submission was posted instead.
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5))
            .expect("outer task runs"),
        0
    );
    assert!(executor.shutdown(Duration::from_secs(1)).is_ok());
}

/// Shutdown while a task is wedged: the drain times out, reports
/// `ExceededTimeLimit`, and the process keeps going.
#[test]
fn shutdown_reports_undrained_workers() {
    let executor = AdaptiveServiceExecutor::new(Reactor::new(), quick_options());
    executor.start().expect("executor starts");

    let (release_tx, release_rx) = mpsc::channel::<()>();
    let status = executor.schedule(
        Box::new(move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(30));
        }),
        ScheduleFlags::empty(),
        TaskName::ProcessMessage,
    );
    assert!(status.is_ok());
    thread::sleep(Duration::from_millis(50));

    let result = executor.shutdown(Duration::from_millis(100));
    assert!(matches!(result, Err(Error::ExceededTimeLimit { .. })));
    release_tx.send(()).ok();
}

/// Tasks and their queue-wait/execution times show up in the stats
/// document under the scheduled task name.
#[test]
fn stats_attribute_work_to_task_names() {
    let executor = AdaptiveServiceExecutor::new(Reactor::new(), quick_options());
    executor.start().expect("executor starts");

    let (tx, rx) = mpsc::channel();
    for _ in 0..3 {
        let tx = tx.clone();
        let status = executor.schedule(
            Box::new(move || {
                thread::sleep(Duration::from_millis(10));
                tx.send(()).ok();
            }),
            ScheduleFlags::empty(),
            TaskName::SourceMessage,
        );
        assert!(status.is_ok());
    }
    for _ in 0..3 {
        rx.recv_timeout(Duration::from_secs(5)).expect("task runs");
    }

    let stats = executor.stats();
    assert_eq!(stats.total_queued, 3);
    assert_eq!(stats.total_executed, 3);
    let by_source = &stats.by_task["sourceMessage"];
    assert_eq!(by_source.executed, 3);
    assert!(by_source.executing_micros >= 3 * 10_000);
    let by_process = &stats.by_task["processMessage"];
    assert_eq!(by_process.executed, 0);

    assert!(executor.shutdown(Duration::from_secs(1)).is_ok());
}
