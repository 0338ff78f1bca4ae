//! Circuit breaker behavior through the lifecycle coordinator


use amqp_bridge::circuit_breaker::CircuitState;
use amqp_bridge::error::BridgeError;
use amqp_bridge::lifecycle::{MessagePayload, PublishRequest};
use amqp_bridge::testing::InMemoryBroker;
use serde_json::json;
use std::time::Duration;
use test_helpers::{coordinator, credential};
use tokio::time::Instant;

fn ping() -> PublishRequest {
    PublishRequest::new("events", "ping", MessagePayload::Json(json!({"ping": true})))
}

#[tokio::test(start_paused = true)]
async fn test_repeated_broker_failures_open_the_circuit() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.set_unreachable(true);
    let coordinator = coordinator(&broker);

    // Act
    for attempt in 0..5 {
        let result = coordinator.publish(&credential(), ping()).await;
        assert!(
            matches!(result, Err(BridgeError::ConnectionUnavailable { .. })),
            "attempt {attempt} should fail on the connection"
        );
    }
    let connects_before = broker.connect_count();
    let started = Instant::now();
    let rejected = coordinator.publish(&credential(), ping()).await;

    // Assert
    assert!(matches!(
        rejected,
        Err(BridgeError::CircuitOpen {
            state: CircuitState::Open
        })
    ));
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(broker.connect_count(), connects_before);
    assert_eq!(coordinator.breaker().snapshot().total_trips, 1);

    let readiness = coordinator.readiness().await;
    assert_eq!(readiness.circuit_state, CircuitState::Open);
    assert!(!readiness.ready);
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_rejects_every_operation() {
    let broker = InMemoryBroker::new();
    broker.set_unreachable(true);
    let coordinator = coordinator(&broker);
    for _ in 0..5 {
        let _ = coordinator.publish(&credential(), ping()).await;
    }

    let fetch = coordinator
        .fetch_one(
            &credential(),
            amqp_bridge::lifecycle::FetchRequest::new("events"),
        )
        .await;
    let ack = coordinator.ack(&credential(), 1).await;

    assert!(matches!(fetch, Err(BridgeError::CircuitOpen { .. })));
    assert!(matches!(ack, Err(BridgeError::CircuitOpen { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_successful_trial_closes_the_circuit() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.bind("events", "ping", "events.ping");
    broker.set_unreachable(true);
    let coordinator = coordinator(&broker);
    for _ in 0..5 {
        let _ = coordinator.publish(&credential(), ping()).await;
    }
    assert_eq!(coordinator.breaker().state(), CircuitState::Open);

    // Act
    broker.set_unreachable(false);
    tokio::time::sleep(Duration::from_secs(31)).await;
    let trial = coordinator.publish(&credential(), ping()).await;

    // Assert
    assert!(trial.is_ok(), "trial publish failed: {trial:?}");
    assert_eq!(coordinator.breaker().state(), CircuitState::Closed);
    assert_eq!(broker.queue_len("events.ping"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_trial_reopens_the_circuit() {
    let broker = InMemoryBroker::new();
    broker.set_unreachable(true);
    let coordinator = coordinator(&broker);
    for _ in 0..5 {
        let _ = coordinator.publish(&credential(), ping()).await;
    }

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(coordinator.breaker().state(), CircuitState::HalfOpen);
    let trial = coordinator.publish(&credential(), ping()).await;
    let after = coordinator.publish(&credential(), ping()).await;

    assert!(matches!(trial, Err(BridgeError::ConnectionUnavailable { .. })));
    assert!(matches!(after, Err(BridgeError::CircuitOpen { .. })));
    assert_eq!(coordinator.breaker().snapshot().total_trips, 2);
}

#[tokio::test(start_paused = true)]
async fn test_failures_outside_the_window_do_not_trip() {
    let broker = InMemoryBroker::new();
    broker.set_unreachable(true);
    let coordinator = coordinator(&broker);

    for _ in 0..4 {
        let _ = coordinator.publish(&credential(), ping()).await;
    }
    tokio::time::sleep(Duration::from_secs(11)).await;
    let result = coordinator.publish(&credential(), ping()).await;

    assert!(matches!(result, Err(BridgeError::ConnectionUnavailable { .. })));
    assert_eq!(coordinator.breaker().state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_refused_credentials_do_not_trip() {
    let broker = InMemoryBroker::new();
    broker.reject_credentials("erp");
    let coordinator = coordinator(&broker);

    for _ in 0..8 {
        let result = coordinator.publish(&credential(), ping()).await;
        assert!(matches!(result, Err(BridgeError::AuthenticationFailed { .. })));
    }

    assert_eq!(coordinator.breaker().state(), CircuitState::Closed);
    assert_eq!(coordinator.breaker().snapshot().recent_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_delivery_tags_do_not_trip() {
    let broker = InMemoryBroker::new();
    let coordinator = coordinator(&broker);

    for tag in 1..=10 {
        let result = coordinator.ack(&credential(), tag).await;
        assert!(matches!(result, Err(BridgeError::InvalidDeliveryTag { .. })));
    }

    assert_eq!(coordinator.breaker().state(), CircuitState::Closed);
}
