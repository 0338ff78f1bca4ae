//! Credential-keyed session pool
//!
//! At most one session exists per credential. Lookup-or-create runs under a
//! single async mutex, so concurrent first requests for a credential share
//! one connection attempt. Leases are handed out under the same lock, which
//! keeps the idle sweeper from evicting a session between lookup and use.

use super::connection_session::{ConnectionSession, SessionLease, SessionMap, SessionSettings};
use crate::credential::Credential;
use crate::error::BridgeResult;
use crate::observability::metrics::metrics;
use crate::transport::{BrokerTransport, TransportError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pool-wide settings
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSettings {
    pub session: SessionSettings,
    /// Upper bound on waiting for a session to reach `Connected`
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome of closing one session
#[derive(Debug)]
pub struct SessionCloseResult {
    pub principal: String,
    pub result: Result<(), TransportError>,
}

pub struct CredentialSessionPool {
    sessions: Arc<SessionMap>,
    transport: Arc<dyn BrokerTransport>,
    settings: PoolSettings,
    next_session_id: AtomicU64,
}

impl CredentialSessionPool {
    pub fn new(transport: Arc<dyn BrokerTransport>, settings: PoolSettings) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            transport,
            settings,
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Lease the session for `credential`, creating it if needed, and wait
    /// until it is connected.
    ///
    /// Fails with `AuthenticationFailed` when the broker refuses the
    /// credential and `ConnectionUnavailable` when the session cannot connect
    /// within the acquire timeout.
    pub async fn acquire(&self, credential: &Credential) -> BridgeResult<SessionLease> {
        let lease = self.lease(credential).await;
        lease
            .wait_until_connected(self.settings.acquire_timeout)
            .await?;
        Ok(lease)
    }

    /// Lease the session for `credential` without waiting for it to connect.
    ///
    /// A missing, failed or closing session is replaced by a fresh one.
    pub async fn lease(&self, credential: &Credential) -> SessionLease {
        let key = credential.pool_key();
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(&key) {
            if !existing.is_failed() && !existing.is_closing() {
                return SessionLease::new(existing.clone());
            }
        }

        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = ConnectionSession::spawn(
            id,
            credential.clone(),
            self.transport.clone(),
            self.settings.session.clone(),
            Arc::downgrade(&self.sessions),
        );
        info!(
            principal = %credential.principal(),
            session_id = id,
            key = %key.short(),
            "Creating broker session"
        );
        metrics().session_created();

        let lease = SessionLease::new(session.clone());
        sessions.insert(key, session);
        lease
    }

    /// Lease the existing session for `credential`; never creates one
    pub async fn lookup(&self, credential: &Credential) -> Option<SessionLease> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(&credential.pool_key())
            .map(|session| SessionLease::new(session.clone()))
    }

    /// Close sessions idle for at least `idle_timeout` with nothing in flight.
    ///
    /// Sessions are taken out of the map under the lock, so each one is
    /// closed by exactly one sweep even when sweeps overlap.
    pub async fn evict_idle(&self, now: Instant, idle_timeout: Duration) -> usize {
        let evicted: Vec<Arc<ConnectionSession>> = {
            let mut sessions = self.sessions.lock().await;
            let expired: Vec<_> = sessions
                .iter()
                .filter(|(_, s)| {
                    s.is_failed() || (s.in_flight() == 0 && s.idle_for(now) >= idle_timeout)
                })
                .map(|(key, _)| *key)
                .collect();
            expired
                .into_iter()
                .filter_map(|key| sessions.remove(&key))
                .collect()
        };

        for session in &evicted {
            let pending = session.pending_count().await;
            info!(
                principal = %session.principal(),
                session_id = session.id(),
                pending,
                "Closing idle broker session"
            );
            if let Err(e) = session.close().await {
                warn!(principal = %session.principal(), error = %e, "Error closing idle session");
            }
            metrics().session_evicted();
        }

        evicted.len()
    }

    /// Spawn the periodic idle sweep
    pub fn start_idle_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        idle_timeout: Duration,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let evicted = pool.evict_idle(Instant::now(), idle_timeout).await;
                if evicted > 0 {
                    debug!(evicted, "Idle sweep finished");
                }
            }
        })
    }

    /// Remove every session from the pool without closing them
    pub async fn drain(&self) -> Vec<Arc<ConnectionSession>> {
        let mut sessions = self.sessions.lock().await;
        sessions.drain().map(|(_, session)| session).collect()
    }

    /// Remove and close every session concurrently
    pub async fn close_all(&self) -> Vec<SessionCloseResult> {
        let sessions = self.drain().await;
        close_sessions(&sessions).await
    }

    async fn snapshot(&self) -> Vec<Arc<ConnectionSession>> {
        self.sessions.lock().await.values().cloned().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Leases currently held across all sessions
    pub async fn total_in_flight(&self) -> usize {
        self.snapshot().await.iter().map(|s| s.in_flight()).sum()
    }

    /// Unacknowledged deliveries across all sessions
    pub async fn pending_count(&self) -> usize {
        let mut total = 0;
        for session in self.snapshot().await {
            total += session.pending_count().await;
        }
        total
    }

    pub async fn any_connected(&self) -> bool {
        self.snapshot().await.iter().any(|s| s.is_connected())
    }
}

/// Close `sessions` concurrently and report each outcome
pub async fn close_sessions(sessions: &[Arc<ConnectionSession>]) -> Vec<SessionCloseResult> {
    let mut closing = JoinSet::new();
    for session in sessions {
        let session = Arc::clone(session);
        closing.spawn(async move {
            let result = session.close().await;
            SessionCloseResult {
                principal: session.principal().to_string(),
                result,
            }
        });
    }

    let mut results = Vec::with_capacity(sessions.len());
    while let Some(joined) = closing.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => warn!(error = %e, "Session close task failed"),
        }
    }
    results
}
