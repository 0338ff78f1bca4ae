//! Graceful shutdown
//!
//! Sequence: refuse new operations, stop the idle sweeper, give in-flight
//! operations a short grace period, then close every session concurrently
//! under one overall timeout. Sessions still open when the timeout fires are
//! force-closed. Failures are reported, never raised.

use crate::lifecycle::MessageLifecycleCoordinator;
use crate::session::close_sessions;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

const IN_FLIGHT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownSettings {
    /// How long in-flight operations may keep running after draining starts
    pub grace_period: Duration,
    /// Bound on closing all sessions
    pub timeout: Duration,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(500),
            timeout: Duration::from_secs(25),
        }
    }
}

/// What happened during shutdown
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    /// Sessions that finished closing, with or without errors
    pub sessions_closed: usize,
    /// Close failures as (principal, error)
    pub errors: Vec<(String, String)>,
    /// Sessions aborted after the timeout
    pub forced: usize,
    pub timed_out: bool,
    /// Operations still running when the grace period ended
    pub in_flight_abandoned: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && !self.timed_out && self.in_flight_abandoned == 0
    }
}

pub struct ShutdownCoordinator {
    coordinator: Arc<MessageLifecycleCoordinator>,
    settings: ShutdownSettings,
}

impl ShutdownCoordinator {
    pub fn new(coordinator: Arc<MessageLifecycleCoordinator>, settings: ShutdownSettings) -> Self {
        Self {
            coordinator,
            settings,
        }
    }

    pub fn settings(&self) -> &ShutdownSettings {
        &self.settings
    }

    pub async fn shutdown(&self, sweeper: Option<JoinHandle<()>>) -> ShutdownReport {
        info!("Shutting down bridge");
        let mut report = ShutdownReport::default();

        self.coordinator.begin_drain();

        if let Some(handle) = sweeper {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Idle sweeper shutdown error: {}", e);
                }
            }
        }

        report.in_flight_abandoned = self.wait_for_in_flight().await;
        if report.in_flight_abandoned > 0 {
            warn!(
                in_flight = report.in_flight_abandoned,
                "Grace period elapsed with operations still running"
            );
        }

        let sessions = self.coordinator.pool().drain().await;
        info!(sessions = sessions.len(), "Closing broker sessions");

        match tokio::time::timeout(self.settings.timeout, close_sessions(&sessions)).await {
            Ok(results) => {
                for closed in results {
                    report.sessions_closed += 1;
                    if let Err(e) = closed.result {
                        warn!(principal = %closed.principal, error = %e, "Error closing session");
                        report.errors.push((closed.principal, e.to_string()));
                    }
                }
            }
            Err(_) => {
                report.timed_out = true;
                for session in &sessions {
                    if session.is_closed() {
                        report.sessions_closed += 1;
                    } else {
                        session.abort();
                        report.forced += 1;
                    }
                }
                error!(
                    timeout = ?self.settings.timeout,
                    forced = report.forced,
                    "Session close timed out; remaining sessions force-closed"
                );
            }
        }

        info!(
            sessions_closed = report.sessions_closed,
            errors = report.errors.len(),
            forced = report.forced,
            "Bridge shutdown complete"
        );
        report
    }

    /// Wait for leases to be returned; returns how many were still held
    async fn wait_for_in_flight(&self) -> usize {
        let pool = self.coordinator.pool();
        let deadline = Instant::now() + self.settings.grace_period;

        loop {
            let in_flight = pool.total_in_flight().await;
            if in_flight == 0 || Instant::now() >= deadline {
                return in_flight;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(IN_FLIGHT_POLL_INTERVAL.min(remaining)).await;
        }
    }
}
