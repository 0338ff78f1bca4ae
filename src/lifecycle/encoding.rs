//! Body encoding policy
//!
//! Outgoing: JSON values become UTF-8 JSON text, text stays UTF-8, binary is
//! passed through. Incoming: JSON when the content type says so (or is
//! absent), otherwise UTF-8 text, falling back to lowercase hex.

use crate::error::{BridgeError, BridgeResult};
use serde::Serialize;
use serde_json::Value;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

/// Body supplied by a publisher
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    Json(Value),
    Text(String),
    Binary(Vec<u8>),
}

impl MessagePayload {
    pub fn content_type(&self) -> &'static str {
        match self {
            MessagePayload::Json(_) => CONTENT_TYPE_JSON,
            MessagePayload::Text(_) => CONTENT_TYPE_TEXT,
            MessagePayload::Binary(_) => CONTENT_TYPE_BINARY,
        }
    }

    /// Wire bytes for this payload
    pub fn encode(&self) -> BridgeResult<Vec<u8>> {
        match self {
            MessagePayload::Json(value) => serde_json::to_vec(value)
                .map_err(|e| BridgeError::invalid_input(format!("payload is not serializable: {e}"))),
            MessagePayload::Text(text) => Ok(text.as_bytes().to_vec()),
            MessagePayload::Binary(bytes) => Ok(bytes.clone()),
        }
    }
}

/// Body handed back to a consumer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DecodedBody {
    Json(Value),
    Text(String),
}

fn is_json_content_type(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => {
            let essence = ct.split(';').next().unwrap_or_default().trim();
            essence.eq_ignore_ascii_case(CONTENT_TYPE_JSON) || essence.ends_with("+json")
        }
    }
}

/// Decode a received body for a client
pub fn decode_body(body: &[u8], content_type: Option<&str>) -> DecodedBody {
    if is_json_content_type(content_type) {
        if let Ok(value) = serde_json::from_slice::<Value>(body) {
            return DecodedBody::Json(value);
        }
    }

    match std::str::from_utf8(body) {
        Ok(text) => DecodedBody::Text(text.to_string()),
        Err(_) => DecodedBody::Text(to_hex(body)),
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
