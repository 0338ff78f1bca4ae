//! Name and header validation for HTTP input

use crate::error::{BridgeError, BridgeResult};
use once_cell::sync::Lazy;
use regex::Regex;

pub const MAX_NAME_LENGTH: usize = 255;
const MAX_REQUEST_ID_LENGTH: usize = 128;

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("name pattern is valid"));

const FORBIDDEN_PATTERNS: [&str; 2] = ["..", "//"];
const RESERVED_PREFIX: &str = "amq.";

/// Check an exchange, queue or routing-key name.
///
/// `#` and `*` are accepted anywhere so topic patterns pass.
pub fn validate_name(field: &str, name: &str) -> BridgeResult<()> {
    if name.is_empty() {
        return Err(BridgeError::invalid_input(format!("{field} cannot be empty")));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(BridgeError::invalid_input(format!(
            "{field} exceeds maximum length of {MAX_NAME_LENGTH}"
        )));
    }
    if let Some(pattern) = FORBIDDEN_PATTERNS.iter().find(|p| name.contains(*p)) {
        return Err(BridgeError::invalid_input(format!(
            "{field} contains forbidden pattern: '{pattern}'"
        )));
    }
    if name.starts_with(RESERVED_PREFIX) {
        return Err(BridgeError::invalid_input(format!(
            "{field} uses the reserved '{RESERVED_PREFIX}' prefix"
        )));
    }

    let stripped = name.replace(['#', '*'], "");
    if !stripped.is_empty() && !NAME_PATTERN.is_match(&stripped) {
        return Err(BridgeError::invalid_input(format!(
            "{field} contains invalid characters. Allowed: a-z, A-Z, 0-9, '.', '-', '_', '#', '*'"
        )));
    }

    Ok(())
}

pub fn validate_exchange(name: &str) -> BridgeResult<()> {
    validate_name("exchange", name)
}

pub fn validate_queue(name: &str) -> BridgeResult<()> {
    validate_name("queue", name)
}

pub fn validate_routing_key(key: &str) -> BridgeResult<()> {
    validate_name("routing_key", key)
}

/// Incoming `X-Request-ID` values are echoed back, so only plain tokens are kept
pub fn is_valid_request_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_REQUEST_ID_LENGTH && NAME_PATTERN.is_match(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(validate_exchange("orders").is_ok());
        assert!(validate_queue("erp.orders-in_v2").is_ok());
        assert!(validate_routing_key("order.*.created").is_ok());
        assert!(validate_routing_key("audit.#").is_ok());
    }

    #[test]
    fn test_rejected_names() {
        assert!(validate_queue("").is_err());
        assert!(validate_queue(&"q".repeat(256)).is_err());
        assert!(validate_queue("a..b").is_err());
        assert!(validate_exchange("amq.direct").is_err());
        assert!(validate_queue("orders queue").is_err());
        assert!(validate_queue("orders/in").is_err());
    }

    #[test]
    fn test_reserved_prefix_only_applies_at_start() {
        assert!(validate_queue("erp.amq.mirror").is_ok());
    }

    #[test]
    fn test_request_id_validation() {
        assert!(is_valid_request_id("3f2b8c9e-1d2a-4c55-9f0e-7a1b2c3d4e5f"));
        assert!(!is_valid_request_id(""));
        assert!(!is_valid_request_id("bad id\r\n"));
        assert!(!is_valid_request_id(&"x".repeat(129)));
    }
}
