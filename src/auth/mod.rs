//! Internal-caller authentication for the administrative surface.

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;


/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

/// Checks the request's bearer token against the configured internal secret.
///
/// Fails closed: with no secret configured every caller is rejected. The
/// comparison runs in constant time over the token bytes.
pub fn verify_internal_secret(headers: &HeaderMap, expected: Option<&str>) -> Result<(), TokenError> {
    let expected = match expected {
        Some(secret) if !secret.is_empty() => secret,
        _ => return Err(TokenError::NotConfigured),
    };

    let token = extract_bearer_token(headers)?;
    if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(TokenError::Mismatch)
    }
}

fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    let parts: Vec<&str> = header_value.splitn(2, ' ').collect();

    if parts.len() != 2 {
        return Err(TokenError::InvalidFormat);
    }

    if parts[0].to_lowercase() != "bearer" {
        return Err(TokenError::InvalidFormat);
    }

    let token = parts[1].trim();
    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// Token verification errors
#[derive(Debug, PartialEq, Clone)]
pub enum TokenError {
    /// Authorization header not present
    Missing,
    /// Not "Bearer <token>"
    InvalidFormat,
    /// Token is empty string
    Empty,
    /// Token does not match the internal secret
    Mismatch,
    /// No internal secret configured; admin calls are disabled
    NotConfigured,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Missing => write!(f, "Authorization token not provided"),
            TokenError::InvalidFormat => write!(f, "Invalid authorization token format"),
            TokenError::Empty => write!(f, "Authorization token is empty"),
            TokenError::Mismatch => write!(f, "Invalid internal secret"),
            TokenError::NotConfigured => write!(f, "Internal secret not configured"),
        }
    }
}

impl std::error::Error for TokenError {}
