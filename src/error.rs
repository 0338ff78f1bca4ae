//! Error taxonomy for bridge operations
//!
//! Every failure the core surfaces is one of the named kinds below. The core
//! never retries a failed operation on its own; callers decide. The HTTP layer
//! maps kinds to status codes through [`BridgeError::status_code`].

use crate::circuit_breaker::CircuitState;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Broker connection unavailable: {reason}")]
    ConnectionUnavailable { reason: String },

    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("Publish confirmation not received within {timeout:?}")]
    PublishTimeout { timeout: Duration },

    #[error("Publish rejected by broker: {reason}")]
    PublishRejected { reason: String },

    #[error("Consume failed: {reason}")]
    ConsumeFailed { reason: String },

    #[error("Delivery tag {delivery_tag} not found in pending messages")]
    InvalidDeliveryTag { delivery_tag: u64 },

    #[error("Circuit breaker is {state}, broker calls are suspended")]
    CircuitOpen { state: CircuitState },

    #[error("Message size {size} exceeds maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

/// Which kind of broker work a transport failure interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerOperation {
    Publish,
    Consume,
}

impl BridgeError {
    pub fn connection_unavailable<S: Into<String>>(reason: S) -> Self {
        Self::ConnectionUnavailable {
            reason: reason.into(),
        }
    }

    pub fn authentication_failed<S: Into<String>>(reason: S) -> Self {
        Self::AuthenticationFailed {
            reason: reason.into(),
        }
    }

    pub fn publish_rejected<S: Into<String>>(reason: S) -> Self {
        Self::PublishRejected {
            reason: reason.into(),
        }
    }

    pub fn consume_failed<S: Into<String>>(reason: S) -> Self {
        Self::ConsumeFailed {
            reason: reason.into(),
        }
    }

    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Classify a transport failure in the context of the operation it broke
    pub fn from_transport(error: TransportError, operation: BrokerOperation) -> Self {
        match error {
            TransportError::AuthenticationFailed(reason) => Self::AuthenticationFailed { reason },
            TransportError::Channel(reason) => match operation {
                BrokerOperation::Publish => Self::PublishRejected { reason },
                BrokerOperation::Consume => Self::ConsumeFailed { reason },
            },
            other => Self::ConnectionUnavailable {
                reason: other.to_string(),
            },
        }
    }

    /// Whether this failure says something about broker health.
    ///
    /// Only these outcomes move the circuit breaker; caller mistakes such as
    /// a bad delivery tag or wrong password leave it untouched.
    pub fn is_broker_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionUnavailable { .. }
                | Self::PublishTimeout { .. }
                | Self::PublishRejected { .. }
                | Self::ConsumeFailed { .. }
        )
    }

    /// Whether the same request may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionUnavailable { .. }
                | Self::PublishTimeout { .. }
                | Self::CircuitOpen { .. }
        )
    }

    /// HTTP status code used when this error reaches a client
    pub fn status_code(&self) -> u16 {
        match self {
            Self::AuthenticationFailed { .. } => 401,
            Self::InvalidDeliveryTag { .. } | Self::InvalidInput { .. } => 400,
            Self::MessageTooLarge { .. } => 413,
            Self::PublishTimeout { .. } => 504,
            Self::ConnectionUnavailable { .. }
            | Self::PublishRejected { .. }
            | Self::ConsumeFailed { .. }
            | Self::CircuitOpen { .. } => 503,
        }
    }

    /// Stable machine-readable code for error bodies
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionUnavailable { .. } => "connection_unavailable",
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::PublishTimeout { .. } => "publish_timeout",
            Self::PublishRejected { .. } => "publish_rejected",
            Self::ConsumeFailed { .. } => "consume_failed",
            Self::InvalidDeliveryTag { .. } => "invalid_delivery_tag",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::InvalidInput { .. } => "invalid_input",
        }
    }

    /// Display text with secrets and credentials scrubbed, safe to return to clients
    pub fn client_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static URL_USERINFO_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(amqps?://[^:/@\s]*):[^@\s]*@").expect("userinfo pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

const MAX_CLIENT_MESSAGE_LEN: usize = 500;

/// Scrub secrets from a message before it leaves the process
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = URL_USERINFO_PATTERN
        .replace_all(&sanitized, "${1}:****@")
        .to_string();

    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_CLIENT_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_CLIENT_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
