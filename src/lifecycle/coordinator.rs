//! Publish, fetch, ack, reject and readiness on top of pooled sessions
//!
//! Every broker-facing operation runs inside [`CircuitBreaker::call`], so a
//! disallowed call fails with `CircuitOpen` before a session is touched.
//! Confirm waits and get waits are serialized per session through the
//! session's publish and consume locks; waiting for the lock counts against
//! the operation's own deadline.

use super::messages::{FetchRequest, FetchedMessage, PublishReceipt, PublishRequest, Readiness};
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::credential::Credential;
use crate::error::{BridgeError, BridgeResult, BrokerOperation};
use crate::observability::metrics::metrics;
use crate::session::{CredentialSessionPool, PendingMessage};
use crate::transport::{ConfirmOutcome, MessageProperties, OutgoingMessage};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Timeouts and limits for message operations
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleSettings {
    pub confirm_timeout: Duration,
    pub default_fetch_timeout: Duration,
    pub max_fetch_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            confirm_timeout: Duration::from_secs(30),
            default_fetch_timeout: Duration::from_secs(30),
            max_fetch_timeout: Duration::from_secs(300),
            max_message_size: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Reject { requeue: bool },
}

impl Settlement {
    fn name(&self) -> &'static str {
        match self {
            Settlement::Ack => "ack",
            Settlement::Reject { .. } => "reject",
        }
    }
}

pub struct MessageLifecycleCoordinator {
    pool: Arc<CredentialSessionPool>,
    breaker: Arc<CircuitBreaker>,
    settings: LifecycleSettings,
    system_credential: Option<Credential>,
    draining: AtomicBool,
}

impl MessageLifecycleCoordinator {
    pub fn new(
        pool: Arc<CredentialSessionPool>,
        breaker: Arc<CircuitBreaker>,
        settings: LifecycleSettings,
        system_credential: Option<Credential>,
    ) -> Self {
        Self {
            pool,
            breaker,
            settings,
            system_credential,
            draining: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Arc<CredentialSessionPool> {
        &self.pool
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn system_credential(&self) -> Option<&Credential> {
        self.system_credential.as_ref()
    }

    /// Refuse new operations from now on
    pub fn begin_drain(&self) {
        if !self.draining.swap(true, Ordering::AcqRel) {
            info!("Bridge draining, new operations are refused");
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    fn ensure_accepting(&self) -> BridgeResult<()> {
        if self.is_draining() {
            return Err(BridgeError::connection_unavailable("bridge is shutting down"));
        }
        Ok(())
    }

    /// Start connecting the system session without waiting for it
    pub async fn open_system_session(&self) {
        if self.is_draining() {
            return;
        }
        if let Some(credential) = &self.system_credential {
            let lease = self.pool.lease(credential).await;
            debug!(principal = %lease.principal(), state = %lease.state(), "System session leased");
        }
    }

    /// Publish one message and wait for the broker's confirm.
    ///
    /// Success is only reported after a positive confirm. A nack or a
    /// returned unroutable message is `PublishRejected`; no confirm within
    /// the confirm timeout is `PublishTimeout`.
    pub async fn publish(
        &self,
        credential: &Credential,
        request: PublishRequest,
    ) -> BridgeResult<PublishReceipt> {
        self.ensure_accepting()?;

        let span = crate::broker_span!(
            operation = "publish",
            principal = %credential.principal(),
            exchange = %request.exchange,
            routing_key = %request.routing_key
        );
        self.breaker
            .call(self.publish_confirmed(credential, request))
            .instrument(span)
            .await
    }

    async fn publish_confirmed(
        &self,
        credential: &Credential,
        request: PublishRequest,
    ) -> BridgeResult<PublishReceipt> {
        let body = request.payload.encode()?;
        if body.len() > self.settings.max_message_size {
            return Err(BridgeError::MessageTooLarge {
                size: body.len(),
                max: self.settings.max_message_size,
            });
        }

        let lease = self.pool.acquire(credential).await?;

        let confirm_timeout = self.settings.confirm_timeout;
        let deadline = Instant::now() + confirm_timeout;
        let timed_out = || {
            metrics().publish_timed_out();
            BridgeError::PublishTimeout {
                timeout: confirm_timeout,
            }
        };

        let _confirm_slot = timeout_at(deadline, lease.publish_lock().lock())
            .await
            .map_err(|_| timed_out())?;
        let channels = lease.channels().await?;

        let message_id = request
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let body_size = body.len();
        let message = OutgoingMessage {
            exchange: request.exchange.clone(),
            routing_key: request.routing_key.clone(),
            body,
            properties: MessageProperties {
                content_type: Some(request.payload.content_type().to_string()),
                correlation_id: request.correlation_id.clone(),
                message_id: Some(message_id.clone()),
                headers: request.headers,
                persistent: request.persistent,
                priority: request.priority,
                timestamp: Some(Utc::now().timestamp().max(0) as u64),
            },
            mandatory: request.mandatory,
        };

        let started = Instant::now();
        match timeout_at(deadline, channels.publish.publish_with_confirm(message)).await {
            Ok(Ok(ConfirmOutcome::Confirmed)) => {
                metrics().message_published(started.elapsed());
                debug!(message_id = %message_id, body_size, "Publish confirmed");
                Ok(PublishReceipt {
                    message_id,
                    correlation_id: request.correlation_id,
                    exchange: request.exchange,
                    routing_key: request.routing_key,
                    body_size,
                    confirmed_at: Utc::now(),
                })
            }
            Ok(Ok(ConfirmOutcome::Rejected(reason))) => {
                metrics().publish_failed();
                warn!(message_id = %message_id, reason = %reason, "Publish rejected by broker");
                Err(BridgeError::publish_rejected(reason))
            }
            Ok(Err(error)) => {
                metrics().publish_failed();
                Err(BridgeError::from_transport(error, BrokerOperation::Publish))
            }
            Err(_) => {
                warn!(message_id = %message_id, timeout = ?confirm_timeout, "Publish confirm timed out");
                Err(timed_out())
            }
        }
    }

    /// Take at most one message from a queue.
    ///
    /// `Ok(None)` when nothing arrives before the timeout. Without auto-ack
    /// the delivery is tracked until it is acked or rejected.
    pub async fn fetch_one(
        &self,
        credential: &Credential,
        request: FetchRequest,
    ) -> BridgeResult<Option<FetchedMessage>> {
        self.ensure_accepting()?;
        let wait = resolve_fetch_timeout(request.timeout, &self.settings)?;
        if request.queue.trim().is_empty() {
            return Err(BridgeError::invalid_input("queue name is required"));
        }

        let span = crate::broker_span!(
            operation = "fetch",
            principal = %credential.principal(),
            queue = %request.queue,
            auto_ack = request.auto_ack
        );
        self.breaker
            .call(self.fetch_tracked(credential, &request.queue, wait, request.auto_ack))
            .instrument(span)
            .await
    }

    async fn fetch_tracked(
        &self,
        credential: &Credential,
        queue: &str,
        wait: Duration,
        auto_ack: bool,
    ) -> BridgeResult<Option<FetchedMessage>> {
        let lease = self.pool.acquire(credential).await?;
        let deadline = Instant::now() + wait;

        let _get_slot = match timeout_at(deadline, lease.consume_lock().lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                metrics().fetch_empty();
                return Ok(None);
            }
        };
        let channels = lease.channels().await?;
        let generation = lease.pending().lock().await.generation();

        let remaining = deadline.saturating_duration_since(Instant::now());
        let delivery = channels
            .consume
            .get_one(queue, remaining)
            .await
            .map_err(|e| BridgeError::from_transport(e, BrokerOperation::Consume))?;

        let Some(delivery) = delivery else {
            metrics().fetch_empty();
            return Ok(None);
        };
        metrics().message_fetched();

        if auto_ack {
            channels
                .consume
                .ack(delivery.delivery_tag)
                .await
                .map_err(|e| BridgeError::from_transport(e, BrokerOperation::Consume))?;
            metrics().message_acked();
            return Ok(Some(FetchedMessage::from_delivery(&delivery, true)));
        }

        let message = FetchedMessage::from_delivery(&delivery, false);
        let tracked = lease
            .pending()
            .lock()
            .await
            .insert(generation, PendingMessage::new(delivery));
        if !tracked {
            warn!(
                delivery_tag = message.delivery_tag,
                "Channel replaced during fetch; delivery will be redelivered"
            );
            return Err(BridgeError::consume_failed(
                "broker channel was replaced while fetching",
            ));
        }

        debug!(delivery_tag = message.delivery_tag, "Delivery awaiting acknowledgement");
        Ok(Some(message))
    }

    /// Acknowledge a delivery fetched earlier with the same credential
    pub async fn ack(&self, credential: &Credential, delivery_tag: u64) -> BridgeResult<()> {
        self.settle(credential, delivery_tag, Settlement::Ack).await
    }

    /// Reject a delivery; without requeue the broker dead-letters it
    pub async fn reject(
        &self,
        credential: &Credential,
        delivery_tag: u64,
        requeue: bool,
    ) -> BridgeResult<()> {
        self.settle(credential, delivery_tag, Settlement::Reject { requeue })
            .await
    }

    async fn settle(
        &self,
        credential: &Credential,
        delivery_tag: u64,
        settlement: Settlement,
    ) -> BridgeResult<()> {
        self.ensure_accepting()?;

        let span = crate::broker_span!(
            operation = settlement.name(),
            principal = %credential.principal(),
            delivery_tag
        );
        self.breaker
            .call(self.settle_pending(credential, delivery_tag, settlement))
            .instrument(span)
            .await
    }

    async fn settle_pending(
        &self,
        credential: &Credential,
        delivery_tag: u64,
        settlement: Settlement,
    ) -> BridgeResult<()> {
        let unknown = || {
            metrics().invalid_delivery_tag();
            BridgeError::InvalidDeliveryTag { delivery_tag }
        };

        let lease = self.pool.lookup(credential).await.ok_or_else(unknown)?;
        let (generation, entry) = {
            let mut pending = lease.pending().lock().await;
            (pending.generation(), pending.take(delivery_tag))
        };
        let entry = entry.ok_or_else(unknown)?;

        let channels = match lease.channels().await {
            Ok(channels) => channels,
            Err(error) => {
                if settlement == Settlement::Ack {
                    lease.pending().lock().await.restore(generation, entry);
                }
                return Err(error);
            }
        };
        if lease.pending().lock().await.generation() != generation {
            debug!("Consume channel replaced before settlement");
            return Err(unknown());
        }

        let outcome = match settlement {
            Settlement::Ack => channels.consume.ack(delivery_tag).await,
            Settlement::Reject { requeue } => channels.consume.reject(delivery_tag, requeue).await,
        };

        match (outcome, settlement) {
            (Ok(()), Settlement::Ack) => {
                metrics().message_acked();
                Ok(())
            }
            (Ok(()), Settlement::Reject { requeue }) => {
                metrics().message_rejected();
                debug!(requeue, "Delivery rejected");
                Ok(())
            }
            (Err(error), Settlement::Ack) => {
                let restored = lease.pending().lock().await.restore(generation, entry);
                warn!(error = %error, restored, "Broker ack failed");
                Err(BridgeError::from_transport(error, BrokerOperation::Consume))
            }
            (Err(error), Settlement::Reject { .. }) => {
                warn!(error = %error, "Broker reject failed; entry dropped");
                Err(BridgeError::from_transport(error, BrokerOperation::Consume))
            }
        }
    }

    /// Connection and breaker view for the readiness route
    pub async fn readiness(&self) -> Readiness {
        let draining = self.is_draining();

        let connected = match &self.system_credential {
            Some(credential) if !draining => self.pool.lease(credential).await.is_connected(),
            Some(credential) => self
                .pool
                .lookup(credential)
                .await
                .is_some_and(|lease| lease.is_connected()),
            None => self.pool.any_connected().await,
        };

        let circuit_breaker = self.breaker.snapshot();
        let circuit_state = circuit_breaker.state;
        let ready = (connected || self.system_credential.is_none())
            && circuit_state != CircuitState::Open
            && !draining;

        Readiness {
            connected,
            ready,
            draining,
            circuit_state,
            pending_messages: self.pool.pending_count().await,
            active_sessions: self.pool.session_count().await,
            circuit_breaker,
        }
    }
}

/// Apply the default and enforce the allowed range for a fetch wait
pub fn resolve_fetch_timeout(
    requested: Option<Duration>,
    settings: &LifecycleSettings,
) -> BridgeResult<Duration> {
    let wait = requested.unwrap_or(settings.default_fetch_timeout);
    if wait > settings.max_fetch_timeout {
        return Err(BridgeError::invalid_input(format!(
            "fetch timeout must be between 0 and {} seconds",
            settings.max_fetch_timeout.as_secs()
        )));
    }
    Ok(wait)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_timeout_defaults() {
        let settings = LifecycleSettings::default();
        assert_eq!(
            resolve_fetch_timeout(None, &settings).unwrap(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_fetch_timeout_bounds() {
        let settings = LifecycleSettings::default();

        assert_eq!(
            resolve_fetch_timeout(Some(Duration::ZERO), &settings).unwrap(),
            Duration::ZERO
        );
        assert_eq!(
            resolve_fetch_timeout(Some(Duration::from_secs(300)), &settings).unwrap(),
            Duration::from_secs(300)
        );
        assert!(matches!(
            resolve_fetch_timeout(Some(Duration::from_secs(301)), &settings),
            Err(BridgeError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_settlement_names() {
        assert_eq!(Settlement::Ack.name(), "ack");
        assert_eq!(Settlement::Reject { requeue: true }.name(), "reject");
    }
}
