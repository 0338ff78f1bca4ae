//! Thread-safe metrics collection
//!
//! Atomic counters for sessions, message lifecycle and the circuit breaker,
//! plus a bounded window of publish confirm latencies.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LATENCY_WINDOW: usize = 1000;

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

pub struct MetricsCollector {
    // Sessions
    sessions_created: AtomicU64,
    sessions_evicted: AtomicU64,
    sessions_failed: AtomicU64,
    connection_attempts: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    channels_reopened: AtomicU64,

    // Message lifecycle
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    publish_timeouts: AtomicU64,
    messages_fetched: AtomicU64,
    empty_fetches: AtomicU64,
    messages_acked: AtomicU64,
    messages_rejected: AtomicU64,
    invalid_delivery_tags: AtomicU64,

    // Circuit breaker
    circuit_trips: AtomicU64,
    circuit_rejections: AtomicU64,

    // HTTP
    rate_limited: AtomicU64,

    confirm_latencies: Mutex<VecDeque<u64>>, // milliseconds
    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            sessions_created: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            connection_attempts: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            channels_reopened: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            publish_timeouts: AtomicU64::new(0),
            messages_fetched: AtomicU64::new(0),
            empty_fetches: AtomicU64::new(0),
            messages_acked: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            invalid_delivery_tags: AtomicU64::new(0),
            circuit_trips: AtomicU64::new(0),
            circuit_rejections: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            confirm_latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Session metrics
    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_evicted(&self) {
        self.sessions_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_reopened(&self) {
        self.channels_reopened.fetch_add(1, Ordering::Relaxed);
    }

    // Message lifecycle metrics
    pub fn message_published(&self, confirm_latency: Duration) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut latencies) = self.confirm_latencies.lock() {
            latencies.push_back(u64::try_from(confirm_latency.as_millis()).unwrap_or(u64::MAX));
            if latencies.len() > LATENCY_WINDOW {
                latencies.pop_front();
            }
        }
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_timed_out(&self) {
        self.publish_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_fetched(&self) {
        self.messages_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fetch_empty(&self) {
        self.empty_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_acked(&self) {
        self.messages_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalid_delivery_tag(&self) {
        self.invalid_delivery_tags.fetch_add(1, Ordering::Relaxed);
    }

    // Circuit breaker metrics
    pub fn circuit_tripped(&self) {
        self.circuit_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn circuit_rejected(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Confirm latency statistics as (avg, p50, p95, p99) in milliseconds
    fn confirm_latency_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(latencies) = self.confirm_latencies.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if latencies.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted: Vec<u64> = latencies.iter().copied().collect();
        sorted.sort_unstable();

        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
        )
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.sessions_created,
            &self.sessions_evicted,
            &self.sessions_failed,
            &self.connection_attempts,
            &self.connection_failures,
            &self.connections_lost,
            &self.channels_reopened,
            &self.messages_published,
            &self.publish_failures,
            &self.publish_timeouts,
            &self.messages_fetched,
            &self.empty_fetches,
            &self.messages_acked,
            &self.messages_rejected,
            &self.invalid_delivery_tags,
            &self.circuit_trips,
            &self.circuit_rejections,
            &self.rate_limited,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        if let Ok(mut latencies) = self.confirm_latencies.lock() {
            latencies.clear();
        }
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg, p50, p95, p99) = self.confirm_latency_statistics();

        MetricsSnapshot {
            sessions: SessionMetrics {
                created: self.sessions_created.load(Ordering::Relaxed),
                evicted: self.sessions_evicted.load(Ordering::Relaxed),
                failed: self.sessions_failed.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                channels_reopened: self.channels_reopened.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                publish_timeouts: self.publish_timeouts.load(Ordering::Relaxed),
                fetched: self.messages_fetched.load(Ordering::Relaxed),
                empty_fetches: self.empty_fetches.load(Ordering::Relaxed),
                acked: self.messages_acked.load(Ordering::Relaxed),
                rejected: self.messages_rejected.load(Ordering::Relaxed),
                invalid_delivery_tags: self.invalid_delivery_tags.load(Ordering::Relaxed),
                avg_confirm_latency_ms: avg,
                confirm_latency_p50_ms: p50,
                confirm_latency_p95_ms: p95,
                confirm_latency_p99_ms: p99,
            },
            circuit_breaker: CircuitMetrics {
                trips: self.circuit_trips.load(Ordering::Relaxed),
                rejections: self.circuit_rejections.load(Ordering::Relaxed),
            },
            http: HttpMetrics {
                rate_limited: self.rate_limited.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub sessions: SessionMetrics,
    pub messages: MessageMetrics,
    pub circuit_breaker: CircuitMetrics,
    pub http: HttpMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct SessionMetrics {
    pub created: u64,
    pub evicted: u64,
    pub failed: u64,
    pub connection_attempts: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub channels_reopened: u64,
}

#[derive(Debug, Serialize)]
pub struct MessageMetrics {
    pub published: u64,
    pub publish_failures: u64,
    pub publish_timeouts: u64,
    pub fetched: u64,
    pub empty_fetches: u64,
    pub acked: u64,
    pub rejected: u64,
    pub invalid_delivery_tags: u64,
    pub avg_confirm_latency_ms: f64,
    pub confirm_latency_p50_ms: f64,
    pub confirm_latency_p95_ms: f64,
    pub confirm_latency_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct CircuitMetrics {
    pub trips: u64,
    pub rejections: u64,
}

#[derive(Debug, Serialize)]
pub struct HttpMetrics {
    pub rate_limited: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower] as f64
    } else {
        let weight = rank - lower as f64;
        sorted[lower] as f64 * (1.0 - weight) + sorted[upper] as f64 * weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let collector = MetricsCollector::new();

        collector.session_created();
        collector.session_created();
        collector.message_acked();
        collector.circuit_tripped();

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.sessions.created, 2);
        assert_eq!(snapshot.messages.acked, 1);
        assert_eq!(snapshot.circuit_breaker.trips, 1);
    }

    #[test]
    fn test_confirm_latency_percentiles() {
        let collector = MetricsCollector::new();
        for ms in 1..=100 {
            collector.message_published(Duration::from_millis(ms));
        }

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.messages.published, 100);
        assert!((snapshot.messages.avg_confirm_latency_ms - 50.5).abs() < f64::EPSILON);
        assert!(snapshot.messages.confirm_latency_p99_ms >= 99.0);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let collector = MetricsCollector::new();
        for _ in 0..(LATENCY_WINDOW + 50) {
            collector.message_published(Duration::from_millis(5));
        }

        let window = collector.confirm_latencies.lock().map(|l| l.len()).unwrap_or(0);
        assert_eq!(window, LATENCY_WINDOW);
    }

    #[test]
    fn test_reset_clears_counters() {
        let collector = MetricsCollector::new();
        collector.publish_failed();
        collector.fetch_empty();

        collector.reset();

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.messages.publish_failures, 0);
        assert_eq!(snapshot.messages.empty_fetches, 0);
    }

    #[test]
    fn test_percentile_interpolates() {
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_eq!(percentile(&[10], 99.0), 10.0);
        assert_eq!(percentile(&[10, 20], 50.0), 15.0);
    }
}
