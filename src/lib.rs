//! amqp-bridge
//!
//! Lets plain HTTP clients publish to and consume from an AMQP broker with
//! broker-level guarantees: publishes are reported only after a publisher
//! confirm, and fetched messages stay unacknowledged until the client acks or
//! rejects them in a later request.
//!
//! # Layout
//!
//! - [`session`] - one supervised broker connection per credential, pooled
//! - [`circuit_breaker`] - fail-fast gate in front of broker calls
//! - [`lifecycle`] - publish, fetch, ack, reject and readiness
//! - [`shutdown`] and [`bridge`] - process lifecycle
//! - [`api`] - warp HTTP surface
//! - [`transport`] - broker traits and the lapin implementation
//!
//! # Example
//!
//! ```no_run
//! use amqp_bridge::bridge::Bridge;
//! use amqp_bridge::config::BridgeConfig;
//! use amqp_bridge::credential::Credential;
//! use amqp_bridge::lifecycle::{MessagePayload, PublishRequest};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let bridge = Bridge::connect(BridgeConfig::load(None)?).await;
//! let credential = Credential::new("erp", "s3cret");
//!
//! let request = PublishRequest::new("orders", "order.created", MessagePayload::Json(json!({"id": 42})));
//! let receipt = bridge.coordinator().publish(&credential, request).await?;
//! println!("confirmed {}", receipt.message_id);
//!
//! bridge.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod bridge;
pub mod circuit_breaker;
pub mod config;
pub mod credential;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod session;
pub mod shutdown;
pub mod testing;
pub mod transport;

pub use bridge::Bridge;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::{BridgeConfig, ConfigError};
pub use credential::Credential;
pub use error::{BridgeError, BridgeResult};
pub use lifecycle::{
    FetchRequest, FetchedMessage, MessageLifecycleCoordinator, MessagePayload, PublishReceipt,
    PublishRequest,
};
pub use session::CredentialSessionPool;
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
