//! Graceful shutdown of a running bridge


use amqp_bridge::error::BridgeError;
use amqp_bridge::lifecycle::{FetchRequest, MessagePayload, PublishRequest};
use amqp_bridge::shutdown::ShutdownReport;
use amqp_bridge::testing::InMemoryBroker;
use serde_json::json;
use std::time::Duration;
use test_helpers::{credential, other_credential, start_bridge};

fn audit_event() -> PublishRequest {
    PublishRequest::new("audit", "user.login", MessagePayload::Json(json!({"user": "ada"})))
}

#[tokio::test(start_paused = true)]
async fn test_clean_shutdown_closes_every_connection() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.bind("audit", "user.login", "audit.logins");
    let bridge = start_bridge(&broker).await;
    bridge
        .coordinator()
        .publish(&credential(), audit_event())
        .await
        .unwrap();
    bridge
        .coordinator()
        .publish(&other_credential(), audit_event())
        .await
        .unwrap();
    assert_eq!(broker.open_connections(), 2);

    // Act
    let report = bridge.shutdown().await;

    // Assert
    assert!(report.is_clean(), "unexpected report: {report:?}");
    assert_eq!(report.sessions_closed, 2);
    assert_eq!(report.forced, 0);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(bridge.pool().session_count().await, 0);
    assert!(bridge.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn test_operations_after_shutdown_are_refused() {
    let broker = InMemoryBroker::new();
    broker.bind("audit", "user.login", "audit.logins");
    let bridge = start_bridge(&broker).await;
    bridge.shutdown().await;

    let publish = bridge.coordinator().publish(&credential(), audit_event()).await;
    let ack = bridge.coordinator().ack(&credential(), 1).await;

    assert!(matches!(publish, Err(BridgeError::ConnectionUnavailable { .. })));
    assert!(matches!(ack, Err(BridgeError::ConnectionUnavailable { .. })));
    assert_eq!(broker.connect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_shutdown_is_a_no_op() {
    let broker = InMemoryBroker::new();
    broker.bind("audit", "user.login", "audit.logins");
    let bridge = start_bridge(&broker).await;
    bridge
        .coordinator()
        .publish(&credential(), audit_event())
        .await
        .unwrap();

    let first = bridge.shutdown().await;
    let second = bridge.shutdown().await;

    assert_eq!(first.sessions_closed, 1);
    assert_eq!(second, ShutdownReport::default());
}

#[tokio::test(start_paused = true)]
async fn test_close_failures_are_reported() {
    let broker = InMemoryBroker::new();
    broker.bind("audit", "user.login", "audit.logins");
    broker.set_close_failure(Some("CHANNEL_ERROR - second 'channel.close'"));
    let bridge = start_bridge(&broker).await;
    bridge
        .coordinator()
        .publish(&credential(), audit_event())
        .await
        .unwrap();

    let report = bridge.shutdown().await;

    assert!(!report.is_clean());
    assert_eq!(report.sessions_closed, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].0, "erp");
    assert!(!report.timed_out);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_close_is_forced_after_timeout() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.bind("audit", "user.login", "audit.logins");
    let bridge = start_bridge(&broker).await;
    bridge
        .coordinator()
        .publish(&credential(), audit_event())
        .await
        .unwrap();
    broker.set_close_hang(true);
    let started = tokio::time::Instant::now();

    // Act
    let report = bridge.shutdown().await;

    // Assert
    assert!(report.timed_out);
    assert_eq!(report.forced, 1);
    assert_eq!(report.sessions_closed, 0);
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_fetch_is_abandoned_after_grace_period() {
    // Arrange
    let broker = InMemoryBroker::with_queues(&["audit.logins"]);
    let bridge = start_bridge(&broker).await;
    let fetching = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            bridge
                .coordinator()
                .fetch_one(
                    &credential(),
                    FetchRequest::new("audit.logins").with_timeout(Duration::from_secs(30)),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bridge.pool().total_in_flight().await, 1);

    // Act
    let report = bridge.shutdown().await;
    let fetch_result = fetching.await.unwrap();

    // Assert
    assert_eq!(report.in_flight_abandoned, 1);
    assert_eq!(report.sessions_closed, 1);
    assert!(fetch_result.is_err(), "fetch should fail once its channel closes");
}

#[tokio::test(start_paused = true)]
async fn test_short_operation_finishes_within_grace_period() {
    let broker = InMemoryBroker::with_queues(&["audit.logins"]);
    let bridge = start_bridge(&broker).await;
    let fetching = {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            bridge
                .coordinator()
                .fetch_one(
                    &credential(),
                    FetchRequest::new("audit.logins").with_timeout(Duration::from_millis(60)),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = bridge.shutdown().await;

    assert_eq!(report.in_flight_abandoned, 0);
    assert!(matches!(fetching.await.unwrap(), Ok(None)));
}

#[tokio::test(start_paused = true)]
async fn test_readiness_after_shutdown() {
    let broker = InMemoryBroker::new();
    let bridge = start_bridge(&broker).await;

    bridge.shutdown().await;
    let readiness = bridge.coordinator().readiness().await;

    assert!(readiness.draining);
    assert!(!readiness.ready);
    assert_eq!(readiness.active_sessions, 0);
}
