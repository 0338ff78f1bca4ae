//! Broker transport abstraction
//!
//! Sessions and the lifecycle coordinator only talk to the broker through the
//! traits below. The production implementation lives in [`amqp`]; tests use
//! the in-memory broker from `testing::mocks`.
//!
//! Connection loss is reported as a [`TransportEvent`] on the receiver handed
//! out with every connection, so the owning session consumes it in its own
//! supervisor loop.

use crate::credential::Credential;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod amqp;

/// Errors raised by a broker transport
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication refused: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),

    #[error("Close failed: {0}")]
    Close(String),
}

/// Purpose a channel is opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Publisher confirms enabled
    Publish,
    /// Prefetch limited, manual acknowledgement
    Consume { prefetch: u16 },
}

/// AMQP basic properties the bridge cares about
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, Value>,
    pub persistent: bool,
    pub priority: Option<u8>,
    pub timestamp: Option<u64>,
}

/// Message ready to hand to the broker
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub mandatory: bool,
}

/// Broker verdict on a confirmed publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Confirmed,
    Rejected(String),
}

/// Message taken from a queue under manual acknowledgement
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Asynchronous notifications from an open connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionLost(String),
}

/// A freshly opened connection and the event stream that belongs to it
pub struct EstablishedConnection {
    pub connection: Arc<dyn BrokerConnection>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens authenticated broker connections
#[async_trait]
pub trait BrokerTransport: Send + Sync + 'static {
    async fn connect(&self, credential: &Credential)
        -> Result<EstablishedConnection, TransportError>;
}

/// One authenticated broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(
        &self,
        mode: ChannelMode,
    ) -> Result<Arc<dyn BrokerChannel>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}

/// One channel on a broker connection.
///
/// Callers bound every wait with their own deadline; implementations never
/// give up on a pending confirm by themselves.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn publish_with_confirm(
        &self,
        message: OutgoingMessage,
    ) -> Result<ConfirmOutcome, TransportError>;

    /// Take at most one message, waiting up to `timeout` for one to arrive
    async fn get_one(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;
}
