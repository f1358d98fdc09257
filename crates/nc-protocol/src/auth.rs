//! API key credential carried in the `Authorization` header

use crate::error::ProtocolError;

/// Header carrying the API key
pub const AUTHORIZATION: &str = "authorization";

const BEARER_PREFIX: &str = "Bearer ";

/// Format an API key as an `Authorization` header value
pub fn bearer_value(api_key: &str) -> String {
    format!("{}{}", BEARER_PREFIX, api_key)
}

/// Extract the API key from an `Authorization` header value
pub fn bearer_token(header: Option<&str>) -> Result<&str, ProtocolError> {
    let header = header.ok_or(ProtocolError::MissingCredential)?;
    let token = header
        .strip_prefix(BEARER_PREFIX)
        .or_else(|| header.strip_prefix("bearer "))
        .ok_or(ProtocolError::MalformedCredential)?
        .trim();

    if token.is_empty() {
        return Err(ProtocolError::MalformedCredential);
    }
    Ok(token)
}
