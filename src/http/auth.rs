//! Front door authentication
//!
//! Accepted `Authorization` header forms:
//! - `Basic base64("mqtt:<token>")`
//! - `Bearer <token>`

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// User name expected in Basic credentials
pub const BASIC_USER: &str = "mqtt";

/// Check an `Authorization` header value against the configured token
pub fn is_authorized(header: Option<&str>, token: &str) -> bool {
    let Some(header) = header else {
        return false;
    };

    if let Some(encoded) = header.strip_prefix("Basic ") {
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Some(password) = decoded
            .strip_prefix(BASIC_USER.as_bytes())
            .and_then(|rest| rest.strip_prefix(b":"))
        else {
            return false;
        };
        password == token.as_bytes()
    } else if let Some(bearer) = header.strip_prefix("Bearer ") {
        bearer.trim() == token
    } else {
        false
    }
}

/// Build a Basic header value for the given token
pub fn basic_header(token: &str) -> String {
    format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", BASIC_USER, token))
    )
}
