//! JSON bodies for the HTTP API

use crate::error::{BridgeError, BridgeResult};
use crate::lifecycle::{FetchRequest, MessagePayload, PublishRequest, Readiness};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use super::validation::{validate_exchange, validate_queue, validate_routing_key};

pub const SERVICE_NAME: &str = "amqp-bridge";

const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

fn default_true() -> bool {
    true
}

fn default_persistence() -> u8 {
    DELIVERY_MODE_PERSISTENT
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishBody {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Value,
    #[serde(default = "default_true")]
    pub mandatory: bool,
    /// AMQP delivery mode: 1 transient, 2 persistent
    #[serde(default = "default_persistence")]
    pub persistence: u8,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    #[serde(default)]
    pub priority: Option<u8>,
}

impl PublishBody {
    /// Validate and convert; `request_id` fills in a missing correlation id
    pub fn into_request(self, request_id: &str) -> BridgeResult<PublishRequest> {
        validate_exchange(&self.exchange)?;
        validate_routing_key(&self.routing_key)?;

        let persistent = match self.persistence {
            DELIVERY_MODE_PERSISTENT => true,
            DELIVERY_MODE_TRANSIENT => false,
            other => {
                return Err(BridgeError::invalid_input(format!(
                    "persistence must be 1 (transient) or 2 (persistent), got {other}"
                )))
            }
        };

        let mut request = PublishRequest::new(
            self.exchange,
            self.routing_key,
            MessagePayload::Json(self.payload),
        )
        .mandatory(self.mandatory)
        .persistent(persistent)
        .with_correlation_id(self.correlation_id.unwrap_or_else(|| request_id.to_string()));

        if let Some(message_id) = self.message_id {
            request = request.with_message_id(message_id);
        }
        request.headers = self.headers;
        request.priority = self.priority;

        Ok(request)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishResponse {
    pub status: String,
    pub request_id: String,
    pub exchange: String,
    pub routing_key: String,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchBody {
    pub queue: String,
    /// Seconds to wait for a message
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub auto_ack: bool,
}

impl FetchBody {
    pub fn into_request(self) -> BridgeResult<FetchRequest> {
        validate_queue(&self.queue)?;

        let mut request = FetchRequest::new(self.queue).auto_ack(self.auto_ack);
        if let Some(secs) = self.timeout {
            request = request.with_timeout(Duration::from_secs(secs));
        }
        Ok(request)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RejectBody {
    #[serde(default)]
    pub requeue: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettleResponse {
    pub status: String,
    pub delivery_tag: u64,
}

impl SettleResponse {
    pub fn acknowledged(delivery_tag: u64) -> Self {
        Self {
            status: "acknowledged".to_string(),
            delivery_tag,
        }
    }

    pub fn rejected(delivery_tag: u64, requeue: bool) -> Self {
        let status = if requeue { "requeued" } else { "rejected" };
        Self {
            status: status.to_string(),
            delivery_tag,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

impl HealthResponse {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
            service: SERVICE_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadyResponse {
    pub status: &'static str,
    pub service: &'static str,
    #[serde(flatten)]
    pub readiness: Readiness,
}

impl From<Readiness> for ReadyResponse {
    fn from(readiness: Readiness) -> Self {
        Self {
            status: if readiness.ready { "ready" } else { "not_ready" },
            service: SERVICE_NAME,
            readiness,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, detail: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            error: error.into(),
            detail: detail.into(),
            request_id,
        }
    }

    pub fn from_bridge_error(error: &BridgeError, request_id: &str) -> Self {
        Self::new(
            error.error_code(),
            error.client_message(),
            Some(request_id.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn publish_body(extra: Value) -> PublishBody {
        let mut body = json!({
            "exchange": "orders",
            "routing_key": "order.created",
            "payload": {"id": 42}
        });
        if let (Some(target), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                target.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_publish_defaults() {
        let request = publish_body(json!({})).into_request("req-1").unwrap();

        assert!(request.persistent);
        assert!(request.mandatory);
        assert_eq!(request.correlation_id.as_deref(), Some("req-1"));
        assert_eq!(request.payload, MessagePayload::Json(json!({"id": 42})));
    }

    #[test]
    fn test_publish_explicit_fields_win() {
        let request = publish_body(json!({
            "persistence": 1,
            "mandatory": false,
            "correlation_id": "order-42",
            "message_id": "m-1",
            "priority": 5,
            "headers": {"source": "erp"}
        }))
        .into_request("req-1")
        .unwrap();

        assert!(!request.persistent);
        assert!(!request.mandatory);
        assert_eq!(request.correlation_id.as_deref(), Some("order-42"));
        assert_eq!(request.message_id.as_deref(), Some("m-1"));
        assert_eq!(request.priority, Some(5));
        assert_eq!(request.headers.get("source"), Some(&json!("erp")));
    }

    #[test]
    fn test_publish_invalid_persistence() {
        let err = publish_body(json!({"persistence": 3}))
            .into_request("req-1")
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidInput { .. }));
    }

    #[test]
    fn test_publish_unknown_field_rejected() {
        let result: Result<PublishBody, _> = serde_json::from_value(json!({
            "exchange": "orders",
            "routing_key": "k",
            "payload": 1,
            "unexpected": true
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_fetch_body_conversion() {
        let body: FetchBody =
            serde_json::from_value(json!({"queue": "orders", "timeout": 5})).unwrap();
        let request = body.into_request().unwrap();

        assert_eq!(request.queue, "orders");
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
        assert!(!request.auto_ack);
    }

    #[test]
    fn test_reject_status_names() {
        assert_eq!(SettleResponse::rejected(3, true).status, "requeued");
        assert_eq!(SettleResponse::rejected(3, false).status, "rejected");
        assert_eq!(SettleResponse::acknowledged(3).status, "acknowledged");
    }
}
