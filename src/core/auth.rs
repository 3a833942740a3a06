use crate::traits::error::{Result, SocketError};
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::Value;

/// Decode the payload segment of a JWT in compact form
/// (`header.payload.signature`) into structured JSON.
///
/// No cryptographic verification happens here; callers that care must verify
/// the signature themselves before trusting the claims.
pub fn decode_jwt_payload(token: &str) -> Result<Value> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(SocketError::Protocol(format!(
            "auth token is not a compact jwt ({} segments)",
            parts.len()
        )));
    }

    let segment = parts[1].trim_end_matches('=');
    let raw = URL_SAFE_NO_PAD
        .decode(segment)
        .or_else(|_| STANDARD_NO_PAD.decode(segment))
        .map_err(|e| SocketError::Protocol(format!("auth token payload base64: {e}")))?;

    serde_json::from_slice(&raw)
        .map_err(|e| SocketError::Protocol(format!("auth token payload json: {e}")))
}
