//! In-memory broker for testing
//!
//! Implements the transport traits over in-process queues so sessions, the
//! lifecycle coordinator and the HTTP layer can be exercised without a
//! running broker. Failure modes are injected through the `set_*` and
//! `fail_*` methods.

use crate::credential::Credential;
use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerTransport, ChannelMode, ConfirmOutcome, Delivery,
    EstablishedConnection, MessageProperties, OutgoingMessage, TransportError, TransportEvent,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

/// How the broker answers publisher confirms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmMode {
    #[default]
    Ack,
    Nack,
    /// Never answer
    Withhold,
    /// Answer with an ack after the delay
    Delay(Duration),
}

/// A message sitting in a queue or held unacknowledged by a channel
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

#[derive(Default)]
struct ChannelShared {
    open: AtomicBool,
    next_tag: AtomicU64,
    unacked: Mutex<HashMap<u64, (String, StoredMessage)>>,
}

struct ConnectionRecord {
    principal: String,
    open: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TransportEvent>,
    channels: Vec<Arc<ChannelShared>>,
}

#[derive(Default)]
struct BrokerInner {
    queues: HashMap<String, VecDeque<StoredMessage>>,
    exchanges: HashSet<String>,
    bindings: HashMap<(String, String), Vec<String>>,
    connections: HashMap<u64, ConnectionRecord>,
    connect_attempts: Vec<(String, Instant)>,
    fail_next_connects: u32,
    unreachable: bool,
    refused: HashSet<String>,
    connect_delay: Duration,
    confirm_mode: ConfirmMode,
    published: Vec<OutgoingMessage>,
    acked: Vec<StoredMessage>,
    dead_lettered: Vec<StoredMessage>,
    close_failure: Option<String>,
    close_hang: bool,
    close_calls: usize,
}

struct BrokerState {
    inner: Mutex<BrokerInner>,
    message_arrived: Notify,
    next_connection_id: AtomicU64,
}

impl BrokerState {
    /// Put the channel's unacknowledged messages back at the head of their queues
    fn requeue_unacked(&self, channel: &ChannelShared) {
        let unacked: Vec<_> = channel.unacked.lock().drain().collect();
        if unacked.is_empty() {
            return;
        }

        let mut sorted = unacked;
        sorted.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        {
            let mut inner = self.inner.lock();
            for (_, (queue, mut message)) in sorted {
                message.redelivered = true;
                inner.queues.entry(queue).or_default().push_front(message);
            }
        }
        self.message_arrived.notify_waiters();
    }

    fn close_channel(&self, channel: &ChannelShared) {
        if channel.open.swap(false, Ordering::AcqRel) {
            self.requeue_unacked(channel);
        }
    }

    fn close_connection(&self, id: u64) -> Option<ConnectionRecord> {
        let record = self.inner.lock().connections.remove(&id)?;
        record.open.store(false, Ordering::Release);
        for channel in &record.channels {
            self.close_channel(channel);
        }
        self.message_arrived.notify_waiters();
        Some(record)
    }
}

/// Broker double shared between the test and the bridge under test
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                inner: Mutex::new(BrokerInner::default()),
                message_arrived: Notify::new(),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    /// Broker with the given queues declared
    pub fn with_queues(queues: &[&str]) -> Self {
        let broker = Self::new();
        for queue in queues {
            broker.declare_queue(queue);
        }
        broker
    }

    pub fn declare_queue(&self, name: &str) {
        self.state
            .inner
            .lock()
            .queues
            .entry(name.to_string())
            .or_default();
    }

    pub fn declare_exchange(&self, name: &str) {
        self.state.inner.lock().exchanges.insert(name.to_string());
    }

    /// Route `routing_key` on `exchange` to `queue`, declaring both
    pub fn bind(&self, exchange: &str, routing_key: &str, queue: &str) {
        let mut inner = self.state.inner.lock();
        inner.exchanges.insert(exchange.to_string());
        inner.queues.entry(queue.to_string()).or_default();
        inner
            .bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default()
            .push(queue.to_string());
    }

    /// Put a message straight into a queue
    pub fn enqueue(&self, queue: &str, body: impl Into<Vec<u8>>, content_type: Option<&str>) {
        let properties = MessageProperties {
            content_type: content_type.map(str::to_string),
            ..Default::default()
        };
        self.enqueue_with(queue, body, properties);
    }

    pub fn enqueue_with(&self, queue: &str, body: impl Into<Vec<u8>>, properties: MessageProperties) {
        let message = StoredMessage {
            exchange: String::new(),
            routing_key: queue.to_string(),
            body: body.into(),
            properties,
            redelivered: false,
        };
        self.state
            .inner
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(message);
        self.state.message_arrived.notify_waiters();
    }

    /// Fail the next `count` connect attempts with a network error
    pub fn fail_next_connects(&self, count: u32) {
        self.state.inner.lock().fail_next_connects = count;
    }

    /// Refuse every connect attempt until cleared
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.inner.lock().unreachable = unreachable;
    }

    /// Refuse logins for `principal`
    pub fn reject_credentials(&self, principal: &str) {
        self.state.inner.lock().refused.insert(principal.to_string());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.inner.lock().connect_delay = delay;
    }

    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        self.state.inner.lock().confirm_mode = mode;
    }

    /// Make `BrokerConnection::close` fail with `reason`
    pub fn set_close_failure(&self, reason: Option<&str>) {
        self.state.inner.lock().close_failure = reason.map(str::to_string);
    }

    /// Make `BrokerConnection::close` never return
    pub fn set_close_hang(&self, hang: bool) {
        self.state.inner.lock().close_hang = hang;
    }

    /// Sever every open connection and report the loss on each event stream.
    /// Returns the number of connections dropped.
    pub fn drop_connections(&self, reason: &str) -> usize {
        let ids: Vec<u64> = self.state.inner.lock().connections.keys().copied().collect();
        let mut dropped = 0;
        for id in ids {
            if let Some(record) = self.state.close_connection(id) {
                let _ = record
                    .events
                    .send(TransportEvent::ConnectionLost(reason.to_string()));
                dropped += 1;
            }
        }
        dropped
    }

    pub fn connect_count(&self) -> usize {
        self.state.inner.lock().connect_attempts.len()
    }

    pub fn connect_count_for(&self, principal: &str) -> usize {
        self.state
            .inner
            .lock()
            .connect_attempts
            .iter()
            .filter(|(p, _)| p == principal)
            .count()
    }

    /// Instants of every connect attempt, oldest first
    pub fn connect_times(&self) -> Vec<Instant> {
        self.state
            .inner
            .lock()
            .connect_attempts
            .iter()
            .map(|(_, at)| *at)
            .collect()
    }

    /// Calls to `BrokerConnection::close`, failed or hanging ones included
    pub fn connection_close_calls(&self) -> usize {
        self.state.inner.lock().close_calls
    }

    pub fn open_connections(&self) -> usize {
        self.state.inner.lock().connections.len()
    }

    pub fn open_connections_for(&self, principal: &str) -> usize {
        self.state
            .inner
            .lock()
            .connections
            .values()
            .filter(|c| c.principal == principal)
            .count()
    }

    pub fn published(&self) -> Vec<OutgoingMessage> {
        self.state.inner.lock().published.clone()
    }

    pub fn acked(&self) -> Vec<StoredMessage> {
        self.state.inner.lock().acked.clone()
    }

    pub fn dead_lettered(&self) -> Vec<StoredMessage> {
        self.state.inner.lock().dead_lettered.clone()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.state
            .inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Messages held unacknowledged across all open channels
    pub fn unacked_count(&self) -> usize {
        let channels: Vec<Arc<ChannelShared>> = self
            .state
            .inner
            .lock()
            .connections
            .values()
            .flat_map(|c| c.channels.iter().cloned())
            .collect();
        channels.iter().map(|c| c.unacked.lock().len()).sum()
    }

    /// Transport handle to give to a pool
    pub fn transport(&self) -> Arc<dyn BrokerTransport> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn connect(
        &self,
        credential: &Credential,
    ) -> Result<EstablishedConnection, TransportError> {
        let delay = {
            let mut inner = self.state.inner.lock();
            inner
                .connect_attempts
                .push((credential.principal().to_string(), Instant::now()));
            inner.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.state.inner.lock();
        if inner.unreachable {
            return Err(TransportError::ConnectionFailed(
                "Connection refused (os error 111)".to_string(),
            ));
        }
        if inner.fail_next_connects > 0 {
            inner.fail_next_connects -= 1;
            return Err(TransportError::ConnectionFailed(
                "Connection reset by peer".to_string(),
            ));
        }
        if inner.refused.contains(credential.principal()) {
            return Err(TransportError::AuthenticationFailed(
                "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN"
                    .to_string(),
            ));
        }

        let id = self.state.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let open = Arc::new(AtomicBool::new(true));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        inner.connections.insert(
            id,
            ConnectionRecord {
                principal: credential.principal().to_string(),
                open: open.clone(),
                events: events_tx,
                channels: Vec::new(),
            },
        );

        Ok(EstablishedConnection {
            connection: Arc::new(MemoryConnection {
                id,
                open,
                state: self.state.clone(),
            }),
            events: events_rx,
        })
    }
}

struct MemoryConnection {
    id: u64,
    open: Arc<AtomicBool>,
    state: Arc<BrokerState>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(
        &self,
        mode: ChannelMode,
    ) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let shared = Arc::new(ChannelShared {
            open: AtomicBool::new(true),
            ..Default::default()
        });

        {
            let mut inner = self.state.inner.lock();
            let record = inner
                .connections
                .get_mut(&self.id)
                .ok_or(TransportError::ChannelClosed)?;
            record.channels.push(shared.clone());
        }

        Ok(Arc::new(MemoryChannel {
            mode,
            shared,
            connection_open: self.open.clone(),
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (failure, hang) = {
            let mut inner = self.state.inner.lock();
            inner.close_calls += 1;
            (inner.close_failure.clone(), inner.close_hang)
        };
        if hang {
            std::future::pending::<()>().await;
        }

        self.state.close_connection(self.id);
        match failure {
            Some(reason) => Err(TransportError::Close(reason)),
            None => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

struct MemoryChannel {
    mode: ChannelMode,
    shared: Arc<ChannelShared>,
    connection_open: Arc<AtomicBool>,
    state: Arc<BrokerState>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed)
        }
    }

    /// Channel exception: the broker closes the channel and requeues what it held
    fn channel_exception(&self, reason: String) -> TransportError {
        self.state.close_channel(&self.shared);
        TransportError::Channel(reason)
    }

    fn try_take(&self, queue: &str) -> Result<Option<Delivery>, TransportError> {
        self.ensure_open()?;

        let head = {
            let mut inner = self.state.inner.lock();
            inner.queues.get_mut(queue).map(VecDeque::pop_front)
        };
        let message = match head {
            Some(Some(message)) => message,
            Some(None) => return Ok(None),
            None => {
                return Err(self.channel_exception(format!(
                    "NOT_FOUND - no queue '{queue}' in vhost '/'"
                )))
            }
        };

        let delivery_tag = self.shared.next_tag.fetch_add(1, Ordering::Relaxed) + 1;
        let delivery = Delivery {
            delivery_tag,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            redelivered: message.redelivered,
            body: message.body.clone(),
            properties: message.properties.clone(),
        };
        self.shared
            .unacked
            .lock()
            .insert(delivery_tag, (queue.to_string(), message));
        Ok(Some(delivery))
    }

    fn unknown_tag(&self, delivery_tag: u64) -> TransportError {
        self.channel_exception(format!(
            "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
        ))
    }

    fn route(&self, message: &OutgoingMessage) -> Result<Vec<String>, String> {
        let inner = self.state.inner.lock();
        if message.exchange.is_empty() {
            return Ok(inner
                .queues
                .contains_key(&message.routing_key)
                .then(|| vec![message.routing_key.clone()])
                .unwrap_or_default());
        }
        if !inner.exchanges.contains(&message.exchange) {
            return Err(format!(
                "NOT_FOUND - no exchange '{}' in vhost '/'",
                message.exchange
            ));
        }
        Ok(inner
            .bindings
            .get(&(message.exchange.clone(), message.routing_key.clone()))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn publish_with_confirm(
        &self,
        message: OutgoingMessage,
    ) -> Result<ConfirmOutcome, TransportError> {
        self.ensure_open()?;
        if self.mode != ChannelMode::Publish {
            return Err(TransportError::Channel(
                "confirms are not enabled on this channel".to_string(),
            ));
        }

        let targets = self
            .route(&message)
            .map_err(|reason| self.channel_exception(reason))?;
        let confirm_mode = {
            let mut inner = self.state.inner.lock();
            inner.published.push(message.clone());
            inner.confirm_mode
        };

        if targets.is_empty() && message.mandatory {
            return Ok(ConfirmOutcome::Rejected(format!(
                "NO_ROUTE - message returned for exchange '{}' routing key '{}'",
                message.exchange, message.routing_key
            )));
        }

        match confirm_mode {
            ConfirmMode::Nack => return Ok(ConfirmOutcome::Rejected("broker nack".to_string())),
            ConfirmMode::Withhold => std::future::pending::<()>().await,
            ConfirmMode::Delay(delay) => tokio::time::sleep(delay).await,
            ConfirmMode::Ack => {}
        }

        {
            let mut inner = self.state.inner.lock();
            for queue in targets {
                inner.queues.entry(queue).or_default().push_back(StoredMessage {
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    body: message.body.clone(),
                    properties: message.properties.clone(),
                    redelivered: false,
                });
            }
        }
        self.state.message_arrived.notify_waiters();

        Ok(ConfirmOutcome::Confirmed)
    }

    async fn get_one(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.state.message_arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take(queue)? {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.ensure_open()?;
        let removed = self.shared.unacked.lock().remove(&delivery_tag);
        let Some((_, message)) = removed else {
            return Err(self.unknown_tag(delivery_tag));
        };
        self.state.inner.lock().acked.push(message);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.ensure_open()?;
        let removed = self.shared.unacked.lock().remove(&delivery_tag);
        let Some((queue, mut message)) = removed else {
            return Err(self.unknown_tag(delivery_tag));
        };

        if requeue {
            message.redelivered = true;
            self.state
                .inner
                .lock()
                .queues
                .entry(queue)
                .or_default()
                .push_front(message);
            self.state.message_arrived.notify_waiters();
        } else {
            self.state.inner.lock().dead_lettered.push(message);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.close_channel(&self.shared);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection_open.load(Ordering::Acquire) && self.shared.open.load(Ordering::Acquire)
    }
}
