//! Session pool behavior against the in-memory broker
//!
//! Covers sharing one connection per credential, backoff on connect failure,
//! terminal authentication failures, reconnect after connection loss and
//! idle eviction.


use amqp_bridge::error::BridgeError;
use amqp_bridge::session::{ReconnectPolicy, SessionState};
use amqp_bridge::testing::InMemoryBroker;
use std::time::Duration;
use test_helpers::{credential, fast_reconnect, other_credential, pool, pool_settings};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_concurrent_first_requests_share_one_connection() {
    // Arrange
    let broker = InMemoryBroker::new();
    let pool = pool(&broker, pool_settings(fast_reconnect(), Duration::from_secs(5)));

    // Act
    let mut acquires = Vec::new();
    for _ in 0..10 {
        let pool = pool.clone();
        acquires.push(tokio::spawn(async move {
            pool.acquire(&credential()).await.map(|lease| lease.id())
        }));
    }
    let mut ids = Vec::new();
    for handle in acquires {
        ids.push(handle.await.unwrap().unwrap());
    }

    // Assert
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(broker.connect_count(), 1);
    assert_eq!(pool.session_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_distinct_credentials_get_distinct_sessions() {
    let broker = InMemoryBroker::new();
    let pool = pool(&broker, pool_settings(fast_reconnect(), Duration::from_secs(5)));

    let erp = pool.acquire(&credential()).await.unwrap();
    let billing = pool.acquire(&other_credential()).await.unwrap();

    assert_ne!(erp.id(), billing.id());
    assert_eq!(broker.open_connections_for("erp"), 1);
    assert_eq!(broker.open_connections_for("billing"), 1);
    assert_eq!(pool.session_count().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failures_back_off_exponentially() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(3);
    let policy = ReconnectPolicy {
        max_attempts: 10,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(60),
    };
    let pool = pool(&broker, pool_settings(policy, Duration::from_secs(30)));

    // Act
    let lease = pool.acquire(&credential()).await.unwrap();

    // Assert
    assert!(lease.is_connected());
    let times = broker.connect_times();
    assert_eq!(times.len(), 4);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    for (gap, expected) in gaps.iter().zip([1u64, 2, 4]) {
        let expected = Duration::from_secs(expected);
        assert!(*gap >= expected, "gap {gap:?} shorter than {expected:?}");
        assert!(*gap < expected + Duration::from_millis(100));
    }
}

#[tokio::test(start_paused = true)]
async fn test_backoff_is_clamped_to_max_delay() {
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(5);
    let policy = ReconnectPolicy {
        max_attempts: 10,
        base_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(3),
    };
    let pool = pool(&broker, pool_settings(policy, Duration::from_secs(60)));

    pool.acquire(&credential()).await.unwrap();

    let times = broker.connect_times();
    let longest = times.windows(2).map(|w| w[1] - w[0]).max().unwrap();
    assert!(longest < Duration::from_secs(3) + Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_and_leave_the_pool() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.set_unreachable(true);
    let policy = ReconnectPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
    };
    let pool = pool(&broker, pool_settings(policy, Duration::from_secs(30)));

    // Act
    let result = pool.acquire(&credential()).await;

    // Assert
    assert!(matches!(result, Err(BridgeError::ConnectionUnavailable { .. })));
    assert_eq!(broker.connect_count(), 3);

    let mut removed = false;
    for _ in 0..20 {
        if pool.session_count().await == 0 {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(removed, "failed session should be removed from the pool");
}

#[tokio::test(start_paused = true)]
async fn test_failed_session_is_replaced_on_next_request() {
    let broker = InMemoryBroker::new();
    broker.set_unreachable(true);
    let policy = ReconnectPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(100),
    };
    let pool = pool(&broker, pool_settings(policy, Duration::from_secs(10)));
    assert!(pool.acquire(&credential()).await.is_err());

    broker.set_unreachable(false);
    let lease = pool.acquire(&credential()).await.unwrap();

    assert!(lease.is_connected());
    assert_eq!(broker.open_connections_for("erp"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_authentication_refusal_is_terminal() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.reject_credentials("erp");
    let pool = pool(&broker, pool_settings(fast_reconnect(), Duration::from_secs(5)));

    // Act
    let result = pool.acquire(&credential()).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    // Assert
    assert!(matches!(result, Err(BridgeError::AuthenticationFailed { .. })));
    assert_eq!(broker.connect_count_for("erp"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_connection_loss() {
    // Arrange
    let broker = InMemoryBroker::new();
    let pool = pool(&broker, pool_settings(fast_reconnect(), Duration::from_secs(5)));
    let first = pool.acquire(&credential()).await.unwrap();
    let session_id = first.id();
    drop(first);

    // Act
    assert_eq!(broker.drop_connections("CONNECTION_FORCED - broker restart"), 1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let lease = pool.acquire(&credential()).await.unwrap();

    // Assert
    assert_eq!(lease.id(), session_id, "same session reconnects in place");
    assert_eq!(lease.state(), SessionState::Connected);
    assert_eq!(broker.connect_count(), 2);
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_sessions_are_evicted() {
    // Arrange
    let broker = InMemoryBroker::new();
    let pool = pool(&broker, pool_settings(fast_reconnect(), Duration::from_secs(5)));
    drop(pool.acquire(&credential()).await.unwrap());

    // Act
    tokio::time::advance(Duration::from_secs(301)).await;
    let evicted = pool
        .evict_idle(Instant::now(), Duration::from_secs(300))
        .await;

    // Assert
    assert_eq!(evicted, 1);
    assert_eq!(pool.session_count().await, 0);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_sweeps_close_a_session_once() {
    // Arrange
    let broker = InMemoryBroker::new();
    let pool = pool(&broker, pool_settings(fast_reconnect(), Duration::from_secs(5)));
    drop(pool.acquire(&credential()).await.unwrap());
    tokio::time::advance(Duration::from_secs(301)).await;

    // Act
    let now = Instant::now();
    let idle = Duration::from_secs(300);
    let (first, second) = tokio::join!(pool.evict_idle(now, idle), pool.evict_idle(now, idle));

    // Assert
    assert_eq!(first + second, 1);
    assert_eq!(broker.connection_close_calls(), 1);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(pool.session_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_leased_session_is_never_evicted() {
    let broker = InMemoryBroker::new();
    let pool = pool(&broker, pool_settings(fast_reconnect(), Duration::from_secs(5)));
    let held = pool.acquire(&credential()).await.unwrap();

    tokio::time::advance(Duration::from_secs(600)).await;
    let evicted = pool
        .evict_idle(Instant::now(), Duration::from_secs(300))
        .await;

    assert_eq!(evicted, 0);
    assert!(held.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_recently_used_session_survives_sweep() {
    let broker = InMemoryBroker::new();
    let pool = pool(&broker, pool_settings(fast_reconnect(), Duration::from_secs(5)));
    drop(pool.acquire(&credential()).await.unwrap());

    tokio::time::advance(Duration::from_secs(200)).await;
    drop(pool.acquire(&credential()).await.unwrap());
    tokio::time::advance(Duration::from_secs(200)).await;

    let evicted = pool
        .evict_idle(Instant::now(), Duration::from_secs(300))
        .await;
    assert_eq!(evicted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_all_reports_every_session() {
    let broker = InMemoryBroker::new();
    broker.set_close_failure(Some("channel error"));
    let pool = pool(&broker, pool_settings(fast_reconnect(), Duration::from_secs(5)));
    drop(pool.acquire(&credential()).await.unwrap());
    drop(pool.acquire(&other_credential()).await.unwrap());

    let results = pool.close_all().await;

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.result.is_err()));
    assert_eq!(pool.session_count().await, 0);
    assert_eq!(broker.open_connections(), 0);
}
