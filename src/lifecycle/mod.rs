//! Message lifecycle: publish with confirms, fetch, ack and reject
//!
//! - [`encoding`] - body encoding and decoding policy
//! - [`messages`] - request and result types
//! - [`coordinator`] - the operations themselves

pub mod coordinator;
pub mod encoding;
pub mod messages;

pub use coordinator::{resolve_fetch_timeout, LifecycleSettings, MessageLifecycleCoordinator};
pub use encoding::{decode_body, DecodedBody, MessagePayload};
pub use messages::{FetchRequest, FetchedMessage, PublishReceipt, PublishRequest, Readiness};
