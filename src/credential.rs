//! Broker credentials and the pool key derived from them

use sha2::{Digest, Sha256};
use std::fmt;

/// Principal and secret presented by a client.
///
/// The secret never appears in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    principal: String,
    secret: String,
}

impl Credential {
    pub fn new(principal: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            secret: secret.into(),
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Key under which sessions for this credential are pooled
    pub fn pool_key(&self) -> PoolKey {
        PoolKey::derive(&self.principal, &self.secret)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("principal", &self.principal)
            .field("secret", &"***")
            .finish()
    }
}

/// SHA-256 digest identifying one (principal, secret) pair.
///
/// Two different secrets for the same principal map to different keys, so a
/// stale password can never reuse a session opened with the current one.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey([u8; 32]);

impl PoolKey {
    fn derive(principal: &str, secret: &str) -> Self {
        let mut hasher = Sha256::new();
        // Length prefix keeps ("ab", "c") and ("a", "bc") apart
        hasher.update((principal.len() as u64).to_be_bytes());
        hasher.update(principal.as_bytes());
        hasher.update(secret.as_bytes());

        let mut key = [0u8; 32];
        key.copy_from_slice(&hasher.finalize());
        Self(key)
    }

    /// Short hex prefix for log correlation
    pub fn short(&self) -> String {
        self.0[..6].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolKey({})", self.short())
    }
}
