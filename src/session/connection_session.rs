//! One broker connection per credential, with its supervisor task
//!
//! The supervisor owns the reconnect loop: it connects, opens one publish
//! channel (confirms on) and one consume channel (prefetch limited), then
//! waits for either a shutdown signal or a connection-lost event from the
//! transport. A lost connection clears the channels and the pending registry
//! before reconnecting with exponential backoff.

use super::pending::PendingRegistry;
use super::reconnect::{decide, ReconnectPolicy, ReconnectionDecision};
use super::state::{log_state_transition, next_state, FailureCause, SessionEvent, SessionState};
use crate::credential::{Credential, PoolKey};
use crate::error::{BridgeError, BridgeResult};
use crate::observability::metrics::metrics;
use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerTransport, ChannelMode, EstablishedConnection,
    TransportError, TransportEvent,
};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Pool storage, shared with sessions so a failed one can remove itself
pub(crate) type SessionMap = Mutex<HashMap<PoolKey, Arc<ConnectionSession>>>;

const SUPERVISOR_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const STALE_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-session connection settings
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub prefetch: u16,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(30),
            prefetch: 10,
        }
    }
}

/// Open connection plus the two channels a session works with
#[derive(Clone)]
pub struct SessionChannels {
    pub connection: Arc<dyn BrokerConnection>,
    pub publish: Arc<dyn BrokerChannel>,
    pub consume: Arc<dyn BrokerChannel>,
}

impl SessionChannels {
    fn is_open(&self) -> bool {
        self.connection.is_open() && self.publish.is_open() && self.consume.is_open()
    }

    /// Close consume, publish, then the connection; collect every error
    async fn close(self) -> Vec<String> {
        let mut errors = Vec::new();
        if let Err(e) = self.consume.close().await {
            errors.push(format!("consume channel: {e}"));
        }
        if let Err(e) = self.publish.close().await {
            errors.push(format!("publish channel: {e}"));
        }
        if let Err(e) = self.connection.close().await {
            errors.push(format!("connection: {e}"));
        }
        errors
    }

    async fn close_quietly(self) {
        match tokio::time::timeout(STALE_CLOSE_TIMEOUT, self.close()).await {
            Ok(errors) if !errors.is_empty() => {
                debug!(errors = ?errors, "Errors closing stale broker connection");
            }
            Ok(_) => {}
            Err(_) => debug!("Timed out closing stale broker connection"),
        }
    }
}

enum ConnectedExit {
    Shutdown,
    Lost,
}

pub struct ConnectionSession {
    id: u64,
    key: PoolKey,
    principal: String,
    prefetch: u16,
    state_tx: watch::Sender<SessionState>,
    shutdown_tx: watch::Sender<bool>,
    channels: RwLock<Option<SessionChannels>>,
    pending: Mutex<PendingRegistry>,
    publish_lock: Mutex<()>,
    consume_lock: Mutex<()>,
    created: Instant,
    last_activity_ms: AtomicU64,
    in_flight: AtomicUsize,
    reconnect_attempts: AtomicU32,
    closing: AtomicBool,
    supervisor: SyncMutex<Option<JoinHandle<()>>>,
}

impl ConnectionSession {
    /// Create a session and start its supervisor; connecting begins at once
    pub(crate) fn spawn(
        id: u64,
        credential: Credential,
        transport: Arc<dyn BrokerTransport>,
        settings: SessionSettings,
        registry: Weak<SessionMap>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        let session = Arc::new(Self {
            id,
            key: credential.pool_key(),
            principal: credential.principal().to_string(),
            prefetch: settings.prefetch,
            state_tx,
            shutdown_tx,
            channels: RwLock::new(None),
            pending: Mutex::new(PendingRegistry::default()),
            publish_lock: Mutex::new(()),
            consume_lock: Mutex::new(()),
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            reconnect_attempts: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            supervisor: SyncMutex::new(None),
        });

        let span = crate::session_span!(session_id = id, principal = %session.principal);
        let handle = tokio::spawn(
            session
                .clone()
                .supervise(credential, transport, settings, registry)
                .instrument(span),
        );
        *session.supervisor.lock() = Some(handle);

        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> PoolKey {
        self.key
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state_tx.borrow().can_operate()
    }

    pub fn is_failed(&self) -> bool {
        self.state_tx.borrow().is_failed()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Closed by `close` or `abort` and fully disconnected
    pub fn is_closed(&self) -> bool {
        self.is_closing() && *self.state_tx.borrow() == SessionState::Disconnected
    }

    /// Connect attempt the supervisor is currently on; zero while connected
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Operations currently holding a lease on this session
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        let elapsed = u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_activity_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = self.created + Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire));
        now.saturating_duration_since(last)
    }

    pub fn publish_lock(&self) -> &Mutex<()> {
        &self.publish_lock
    }

    pub fn consume_lock(&self) -> &Mutex<()> {
        &self.consume_lock
    }

    pub fn pending(&self) -> &Mutex<PendingRegistry> {
        &self.pending
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Channels of the live connection, or `ConnectionUnavailable`
    pub async fn channels(&self) -> BridgeResult<SessionChannels> {
        let state = self.state();
        if !state.can_operate() {
            return Err(BridgeError::connection_unavailable(format!(
                "session for '{}' is {}",
                self.principal, state
            )));
        }

        match self.channels.read().await.as_ref() {
            Some(channels) if channels.is_open() => return Ok(channels.clone()),
            Some(channels) if channels.connection.is_open() => {}
            _ => {
                return Err(BridgeError::connection_unavailable(
                    "broker channels are not open",
                ))
            }
        }

        self.reopen_channels().await
    }

    /// Replace channels the broker closed while the connection stayed up.
    ///
    /// A reopened consume channel voids every delivery tag issued before, so
    /// the pending registry is reset with it.
    async fn reopen_channels(&self) -> BridgeResult<SessionChannels> {
        let unavailable = |reason: String| BridgeError::connection_unavailable(reason);

        let mut slot = self.channels.write().await;
        let Some(channels) = slot.as_mut() else {
            return Err(unavailable("broker channels are not open".to_string()));
        };
        if !channels.connection.is_open() {
            return Err(unavailable("broker connection is closed".to_string()));
        }

        if !channels.publish.is_open() {
            channels.publish = channels
                .connection
                .open_channel(ChannelMode::Publish)
                .await
                .map_err(|e| unavailable(format!("reopen publish channel: {e}")))?;
            metrics().channel_reopened();
            info!(principal = %self.principal, "Reopened publish channel closed by broker");
        }

        if !channels.consume.is_open() {
            channels.consume = channels
                .connection
                .open_channel(ChannelMode::Consume {
                    prefetch: self.prefetch,
                })
                .await
                .map_err(|e| unavailable(format!("reopen consume channel: {e}")))?;
            metrics().channel_reopened();
            let dropped = self.pending.lock().await.reset();
            info!(
                principal = %self.principal,
                dropped,
                "Reopened consume channel closed by broker; earlier delivery tags are void"
            );
        }

        Ok(channels.clone())
    }

    /// Wait until the session is connected, fails, or `timeout` elapses
    pub async fn wait_until_connected(&self, timeout: Duration) -> BridgeResult<()> {
        let mut state_rx = self.state_tx.subscribe();

        let wait = async {
            loop {
                let state = state_rx.borrow_and_update().clone();
                match state {
                    SessionState::Connected => return Ok(()),
                    SessionState::Failed(FailureCause::AuthenticationRejected(reason)) => {
                        return Err(BridgeError::authentication_failed(reason));
                    }
                    SessionState::Failed(cause) => {
                        return Err(BridgeError::connection_unavailable(cause.to_string()));
                    }
                    SessionState::Disconnecting | SessionState::Disconnected
                        if self.is_closing() =>
                    {
                        return Err(BridgeError::connection_unavailable("session is closing"));
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(BridgeError::connection_unavailable(
                        "session supervisor stopped",
                    ));
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::connection_unavailable(format!(
                "broker connection not ready within {timeout:?} ({})",
                self.state()
            ))),
        }
    }

    /// Stop the supervisor, close channels and connection, drop pending entries.
    ///
    /// Idempotent; close errors are collected and returned, not raised early.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shutdown_tx.send_replace(true);
        self.transition(SessionEvent::CloseRequested);
        self.join_supervisor().await;

        let channels = self.channels.write().await.take();
        let errors = match channels {
            Some(channels) => channels.close().await,
            None => Vec::new(),
        };

        let dropped = self.pending.lock().await.reset();
        if dropped > 0 {
            info!(
                principal = %self.principal,
                dropped,
                "Dropped unacknowledged deliveries on close; broker will redeliver"
            );
        }
        self.transition(SessionEvent::Closed);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Close(errors.join("; ")))
        }
    }

    /// Tear the session down without waiting on the broker
    pub fn abort(&self) {
        self.closing.store(true, Ordering::Release);
        self.shutdown_tx.send_replace(true);

        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        if let Ok(mut channels) = self.channels.try_write() {
            channels.take();
        }
        if let Ok(mut pending) = self.pending.try_lock() {
            pending.reset();
        }

        self.state_tx.send_replace(SessionState::Disconnected);
        warn!(principal = %self.principal, "Broker session force-closed");
    }

    async fn join_supervisor(&self) {
        let handle = self.supervisor.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(SUPERVISOR_JOIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!(principal = %self.principal, "Session supervisor did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    fn transition(&self, event: SessionEvent) {
        self.state_tx.send_if_modified(|state| {
            let next = next_state(state, &event);
            if *state == next {
                return false;
            }
            log_state_transition(&self.principal, state, &next);
            *state = next;
            true
        });
    }

    async fn supervise(
        self: Arc<Self>,
        credential: Credential,
        transport: Arc<dyn BrokerTransport>,
        settings: SessionSettings,
        registry: Weak<SessionMap>,
    ) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut attempt = 0u32;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.reconnect_attempts.store(attempt, Ordering::Relaxed);
            self.transition(SessionEvent::ConnectStarted(attempt));
            metrics().connection_attempt();

            let outcome = tokio::select! {
                _ = shutdown_rx.changed() => break,
                outcome = tokio::time::timeout(
                    settings.connect_timeout,
                    establish(transport.as_ref(), &credential, settings.prefetch),
                ) => outcome,
            };

            let error = match outcome {
                Ok(Ok((channels, events))) => {
                    attempt = 0;
                    match self.run_connected(channels, events, &mut shutdown_rx).await {
                        ConnectedExit::Shutdown => break,
                        ConnectedExit::Lost => continue,
                    }
                }
                Ok(Err(TransportError::AuthenticationFailed(reason))) => {
                    self.fail(FailureCause::AuthenticationRejected(reason), &registry)
                        .await;
                    return;
                }
                Ok(Err(error)) => error.to_string(),
                Err(_) => format!("connect timed out after {:?}", settings.connect_timeout),
            };

            metrics().connection_failed();

            let stop = *shutdown_rx.borrow();
            match decide(attempt, &settings.reconnect, stop) {
                ReconnectionDecision::Proceed {
                    next_attempt,
                    delay,
                } => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = settings.reconnect.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "Broker connect failed, retrying"
                    );
                    self.transition(SessionEvent::ConnectFailed {
                        attempt,
                        reason: error,
                    });
                    attempt = next_attempt;
                    self.reconnect_attempts.store(attempt, Ordering::Relaxed);

                    if !interruptible_sleep(&mut shutdown_rx, delay).await {
                        break;
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => break,
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    let cause = FailureCause::RetriesExhausted {
                        attempts: attempt + 1,
                        last_error: error,
                    };
                    self.fail(cause, &registry).await;
                    return;
                }
            }
        }

        debug!("Session supervisor stopped");
    }

    async fn run_connected(
        &self,
        channels: SessionChannels,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> ConnectedExit {
        *self.channels.write().await = Some(channels);
        self.pending.lock().await.reset();
        self.reconnect_attempts.store(0, Ordering::Relaxed);
        self.transition(SessionEvent::Established);

        let reason = tokio::select! {
            _ = shutdown_rx.changed() => return ConnectedExit::Shutdown,
            event = events.recv() => match event {
                Some(TransportEvent::ConnectionLost(reason)) => reason,
                None => "transport event stream closed".to_string(),
            },
        };

        if self.is_closing() {
            return ConnectedExit::Shutdown;
        }

        metrics().connection_lost();
        self.transition(SessionEvent::ConnectionLost(reason));

        let stale = self.channels.write().await.take();
        let dropped = self.pending.lock().await.reset();
        if dropped > 0 {
            info!(
                dropped,
                "Discarded delivery tags of lost channel; broker will redeliver"
            );
        }
        if let Some(stale) = stale {
            stale.close_quietly().await;
        }

        ConnectedExit::Lost
    }

    async fn fail(&self, cause: FailureCause, registry: &Weak<SessionMap>) {
        self.transition(SessionEvent::PermanentFailure(cause));
        metrics().session_failed();

        let stale = self.channels.write().await.take();
        if let Some(stale) = stale {
            stale.close_quietly().await;
        }
        self.pending.lock().await.reset();

        if let Some(sessions) = registry.upgrade() {
            let mut sessions = sessions.lock().await;
            if sessions.get(&self.key).is_some_and(|s| s.id == self.id) {
                sessions.remove(&self.key);
                debug!("Removed failed session from pool");
            }
        }
    }
}

/// Connect and open both channels; a half-opened connection is closed again
async fn establish(
    transport: &dyn BrokerTransport,
    credential: &Credential,
    prefetch: u16,
) -> Result<(SessionChannels, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
    let EstablishedConnection { connection, events } = transport.connect(credential).await?;

    let publish = match connection.open_channel(ChannelMode::Publish).await {
        Ok(channel) => channel,
        Err(e) => {
            let _ = connection.close().await;
            return Err(e);
        }
    };
    let consume = match connection.open_channel(ChannelMode::Consume { prefetch }).await {
        Ok(channel) => channel,
        Err(e) => {
            let _ = publish.close().await;
            let _ = connection.close().await;
            return Err(e);
        }
    };

    Ok((
        SessionChannels {
            connection,
            publish,
            consume,
        },
        events,
    ))
}

/// Sleep for `delay` unless shutdown is signalled first.
/// Returns true if the sleep completed.
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown_rx.changed() => {
            let stop = *shutdown_rx.borrow();
            if stop {
                debug!("Shutdown signalled during reconnect delay");
            }
            !stop
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Marks one operation in flight on a session for as long as it lives.
///
/// The pool hands leases out under its own lock, so an idle sweep can never
/// evict a session between lookup and use.
pub struct SessionLease {
    session: Arc<ConnectionSession>,
}

impl SessionLease {
    pub(crate) fn new(session: Arc<ConnectionSession>) -> Self {
        session.in_flight.fetch_add(1, Ordering::AcqRel);
        session.touch();
        Self { session }
    }

    pub fn session(&self) -> &Arc<ConnectionSession> {
        &self.session
    }
}

impl Deref for SessionLease {
    type Target = ConnectionSession;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.session.touch();
        self.session.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
