//! Pipeline Tests
//!
//! Listener → routes → executor against in-memory adapters: acknowledgement
//! accounting, fan-out, concurrency bounds and shutdown.

use reactor_core::application::{DeliveryMode, ListenerSettings, QueueListener, Route};
use reactor_core::domain::RouteSettings;
use reactor_core::port::command_executor::mocks::{MockBehavior, ScriptedExecutor};
use reactor_core::port::log_sink::mocks::RecordingSink;
use reactor_core::port::queue_transport::mocks::MemoryTransport;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn settings(delivery: DeliveryMode) -> ListenerSettings {
    ListenerSettings {
        max_messages: 10,
        wait_seconds: 0,
        delivery,
        error_backoff: Duration::from_millis(10),
    }
}

fn route(executor: &Arc<ScriptedExecutor>, concurrency: usize) -> Arc<Route> {
    let route = Route::new(
        RouteSettings::new("", concurrency, Duration::ZERO),
        executor.clone(),
        None,
        "test-host",
    );
    route.start();
    route
}

async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Test 1: a message matched by k routes is deleted once, after the k-th success
#[tokio::test]
async fn test_fan_out_deletes_exactly_once() {
    let transport = Arc::new(MemoryTransport::new());
    let listener = QueueListener::new("q", settings(DeliveryMode::Blocking), transport.clone());
    let executors: Vec<_> = (0..3)
        .map(|_| Arc::new(ScriptedExecutor::new(MockBehavior::Sleep(Duration::from_millis(30)))))
        .collect();
    for executor in &executors {
        listener.subscribe(route(executor, 1));
    }

    transport.push("m-1", r#"{"kind":"build"}"#);
    listener.start();

    assert!(wait_until(Duration::from_secs(5), || transport.delete_count("m-1") == 1).await);
    for executor in &executors {
        assert_eq!(executor.runs(), vec!["m-1".to_string()]);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.delete_count("m-1"), 1);
    assert_eq!(listener.shutdown(Duration::from_secs(2)).await, 0);
}

/// Test 2: one failing route keeps the message for redelivery
#[tokio::test]
async fn test_any_failure_keeps_message() {
    let transport = Arc::new(MemoryTransport::new());
    let listener = QueueListener::new("q", settings(DeliveryMode::Blocking), transport.clone());
    let ok = Arc::new(ScriptedExecutor::new_success());
    let failing = Arc::new(ScriptedExecutor::new_fail("boom"));
    listener.subscribe(route(&ok, 1));
    listener.subscribe(route(&failing, 1));

    transport.push("m-1", "{}");
    listener.start();

    assert!(wait_until(Duration::from_secs(5), || ok.call_count() == 1 && failing.call_count() == 1).await);
    assert!(wait_until(Duration::from_secs(1), || listener.pending_count() == 0).await);
    assert!(transport.deleted().is_empty());
    listener.shutdown(Duration::from_secs(1)).await;
}

/// Test 3: messages no route accepts are deleted without running anything
#[tokio::test]
async fn test_unmatched_message_is_deleted() {
    let transport = Arc::new(MemoryTransport::new());
    let listener = QueueListener::new("q", settings(DeliveryMode::Blocking), transport.clone());
    let python = Arc::new(ScriptedExecutor::new_success().with_conditions(&[("$.lang", "^py")]));
    listener.subscribe(route(&python, 1));

    transport.push("m-go", r#"{"lang":"go"}"#);
    transport.push("m-py", r#"{"lang":"python3"}"#);
    listener.start();

    assert!(wait_until(Duration::from_secs(5), || transport.deleted().len() == 2).await);
    assert_eq!(python.runs(), vec!["m-py".to_string()]);
    assert_eq!(transport.delete_count("m-go"), 1);
    listener.shutdown(Duration::from_secs(1)).await;
}

/// Test 4: non-blocking delivery never runs more than the routes' combined concurrency
#[tokio::test]
async fn test_non_blocking_respects_limiter() {
    let transport = Arc::new(MemoryTransport::new());
    let listener =
        QueueListener::new("q", settings(DeliveryMode::NonBlocking), transport.clone());
    let a = Arc::new(ScriptedExecutor::new(MockBehavior::Sleep(Duration::from_millis(40))));
    let b = Arc::new(ScriptedExecutor::new(MockBehavior::Sleep(Duration::from_millis(40))));
    listener.subscribe(route(&a, 2));
    listener.subscribe(route(&b, 1));
    assert_eq!(listener.limiter().capacity(), 3);

    for i in 0..6 {
        transport.push(&format!("m-{i}"), "{}");
    }
    listener.start();

    let limiter = listener.limiter().clone();
    let mut peak = 0;
    let drained = wait_until(Duration::from_secs(10), || {
        peak = peak.max(limiter.in_use());
        transport.deleted().len() == 6
    })
    .await;
    assert!(drained);
    assert!(peak <= 3);
    assert!(a.max_in_flight() <= 2);
    assert!(b.max_in_flight() <= 1);
    assert_eq!(a.call_count(), 6);
    assert_eq!(b.call_count(), 6);
    listener.shutdown(Duration::from_secs(1)).await;
}

/// Test 5: shutdown gives up at its ceiling and leaves the message undeleted
#[tokio::test]
async fn test_shutdown_ceiling() {
    let transport = Arc::new(MemoryTransport::new());
    let listener = QueueListener::new("q", settings(DeliveryMode::Blocking), transport.clone());
    let slow = Arc::new(ScriptedExecutor::new(MockBehavior::Sleep(Duration::from_secs(30))));
    listener.subscribe(route(&slow, 1));

    transport.push("m-1", "{}");
    listener.start();
    assert!(wait_until(Duration::from_secs(5), || transport.queued() == 0 && listener.pending_count() == 1).await);

    let started = Instant::now();
    let pending = listener.shutdown(Duration::from_millis(300)).await;
    assert_eq!(pending, 1);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(transport.deleted().is_empty());
}

/// Test 6: every completed run leaves a CMD and END record behind
#[tokio::test]
async fn test_execution_records_per_run() {
    let transport = Arc::new(MemoryTransport::new());
    let listener = QueueListener::new("q", settings(DeliveryMode::Blocking), transport.clone());
    let sink = Arc::new(RecordingSink::new());
    let executor = Arc::new(ScriptedExecutor::new_success());
    let route = Route::new(
        RouteSettings::new("nightly", 1, Duration::ZERO),
        executor.clone(),
        Some(sink.clone()),
        "test-host",
    );
    route.start();
    listener.subscribe(route.clone());

    transport.push("m-1", "{}");
    transport.push("m-2", "{}");
    listener.start();
    assert!(wait_until(Duration::from_secs(5), || transport.deleted().len() == 2).await);
    listener.shutdown(Duration::from_secs(1)).await;
    route.exit().await;
    assert!(executor.exited());

    let records = sink.records();
    let ends: Vec<_> = records.iter().filter(|r| r["Status"] == "END").collect();
    assert_eq!(ends.len(), 2);
    for record in &records {
        assert_eq!(record["Host"], "test-host");
        assert_eq!(record["RID"], route.id().get());
    }
    assert_eq!(ends[0]["TID"], 1);
    assert_eq!(ends[1]["TID"], 2);
}
