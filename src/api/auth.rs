//! HTTP Basic credentials
//!
//! The Basic username and password are the caller's broker credentials and
//! are passed through to the session pool unchanged.

use crate::credential::Credential;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authorization header is required")]
    Missing,
    #[error("Authorization must use the Basic scheme")]
    UnsupportedScheme,
    #[error("Malformed Basic credentials")]
    Malformed,
    #[error("Username and password are required")]
    Incomplete,
}

/// Decode an `Authorization: Basic ...` header value
pub fn parse_basic_auth(header: Option<&str>) -> Result<Credential, AuthError> {
    let header = header.ok_or(AuthError::Missing)?.trim();

    let (scheme, encoded) = header.split_once(' ').ok_or(AuthError::UnsupportedScheme)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AuthError::UnsupportedScheme);
    }

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::Malformed)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;
    let (principal, secret) = decoded.split_once(':').ok_or(AuthError::Malformed)?;

    if principal.is_empty() || secret.is_empty() {
        return Err(AuthError::Incomplete);
    }

    Ok(Credential::new(principal, secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(userinfo: &str) -> String {
        format!("Basic {}", STANDARD.encode(userinfo))
    }

    #[test]
    fn test_parse_valid_credentials() {
        let credential = parse_basic_auth(Some(&basic("erp:s3cret"))).unwrap();

        assert_eq!(credential.principal(), "erp");
        assert_eq!(credential.secret(), "s3cret");
    }

    #[test]
    fn test_password_may_contain_colons() {
        let credential = parse_basic_auth(Some(&basic("erp:a:b:c"))).unwrap();
        assert_eq!(credential.secret(), "a:b:c");
    }

    #[test]
    fn test_missing_and_malformed_headers() {
        assert_eq!(parse_basic_auth(None), Err(AuthError::Missing));
        assert_eq!(
            parse_basic_auth(Some("Bearer abc")),
            Err(AuthError::UnsupportedScheme)
        );
        assert_eq!(
            parse_basic_auth(Some("Basic !!!not-base64")),
            Err(AuthError::Malformed)
        );
        assert_eq!(
            parse_basic_auth(Some(&basic("no-colon"))),
            Err(AuthError::Malformed)
        );
        assert_eq!(
            parse_basic_auth(Some(&basic("erp:"))),
            Err(AuthError::Incomplete)
        );
    }
}
