//! Request and result types for lifecycle operations

use super::encoding::{decode_body, DecodedBody, MessagePayload};
use crate::circuit_breaker::{CircuitBreakerSnapshot, CircuitState};
use crate::transport::Delivery;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// One message to publish with confirmation
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub exchange: String,
    pub routing_key: String,
    pub payload: MessagePayload,
    pub persistent: bool,
    pub mandatory: bool,
    pub headers: BTreeMap<String, Value>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub priority: Option<u8>,
}

impl PublishRequest {
    /// Persistent, mandatory publish with no extra properties
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            persistent: true,
            mandatory: true,
            headers: BTreeMap::new(),
            correlation_id: None,
            message_id: None,
            priority: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: Value) -> Self {
        self.headers.insert(name.into(), value);
        self
    }

    pub fn mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = mandatory;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// Proof that the broker confirmed a publish
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishReceipt {
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub body_size: usize,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub queue: String,
    /// Time to wait for a message; `None` uses the configured default
    pub timeout: Option<Duration>,
    pub auto_ack: bool,
}

impl FetchRequest {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            timeout: None,
            auto_ack: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }
}

/// A fetched message as returned to the client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchedMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: DecodedBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Value>,
    /// Already acknowledged; the tag cannot be acked or rejected
    pub auto_acked: bool,
}

impl FetchedMessage {
    pub fn from_delivery(delivery: &Delivery, auto_acked: bool) -> Self {
        let props = &delivery.properties;
        Self {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            redelivered: delivery.redelivered,
            body: decode_body(&delivery.body, props.content_type.as_deref()),
            content_type: props.content_type.clone(),
            correlation_id: props.correlation_id.clone(),
            message_id: props.message_id.clone(),
            headers: props.headers.clone(),
            auto_acked,
        }
    }
}

/// Whether the bridge can currently serve traffic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Readiness {
    pub connected: bool,
    pub ready: bool,
    pub draining: bool,
    pub circuit_state: CircuitState,
    pub pending_messages: usize,
    pub active_sessions: usize,
    pub circuit_breaker: CircuitBreakerSnapshot,
}
