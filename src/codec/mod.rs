//! Payload Codec
//!
//! Converts between raw MQTT payload bytes and the string form used in
//! HTTP bodies, in both directions:
//!
//! - **Inbound** (HTTP request → bus payload): [`parse_message`] honours a
//!   `plain:` or `base64:` prefix and falls back to the whole string as
//!   UTF-8 text.
//! - **Outbound** (bus payload → webhook body): [`format_message`] renders
//!   the bytes according to the subscription's [`PayloadFormat`].

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;


/// Prefix marking an explicitly plain-text message
pub const PLAIN_PREFIX: &str = "plain:";

/// Prefix marking a base64-encoded message
pub const BASE64_PREFIX: &str = "base64:";

/// Payload encoding used in outbound webhook bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// Payload embedded as UTF-8 text
    #[default]
    Plain,
    /// Payload base64-encoded and tagged with `base64:`
    Base64,
}

impl PayloadFormat {
    /// Integer code used in configuration files
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(PayloadFormat::Plain),
            1 => Some(PayloadFormat::Base64),
            _ => None,
        }
    }

    /// Parse a configuration value: the integer code or the format name
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Ok(code) = value.parse::<i64>() {
            return Self::from_code(code);
        }
        match value.to_ascii_lowercase().as_str() {
            "plain" => Some(PayloadFormat::Plain),
            "base64" => Some(PayloadFormat::Base64),
            _ => None,
        }
    }
}

impl fmt::Display for PayloadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadFormat::Plain => write!(f, "plain"),
            PayloadFormat::Base64 => write!(f, "base64"),
        }
    }
}

/// Codec error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Text after the `base64:` prefix is not valid base64
    InvalidBase64(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::InvalidBase64(msg) => write!(f, "Invalid base64 message: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<base64::DecodeError> for CodecError {
    fn from(e: base64::DecodeError) -> Self {
        CodecError::InvalidBase64(e.to_string())
    }
}

/// Parse a message string from an HTTP request into payload bytes.
///
/// The prefix check is order-sensitive: `plain:` is tested before `base64:`,
/// so `plain:base64:abc` publishes the literal text `base64:abc`.
pub fn parse_message(message: &str) -> Result<Bytes, CodecError> {
    if let Some(text) = message.strip_prefix(PLAIN_PREFIX) {
        Ok(Bytes::copy_from_slice(text.as_bytes()))
    } else if let Some(encoded) = message.strip_prefix(BASE64_PREFIX) {
        Ok(Bytes::from(STANDARD.decode(encoded)?))
    } else {
        Ok(Bytes::copy_from_slice(message.as_bytes()))
    }
}

/// Render payload bytes for a webhook body.
///
/// Plain payloads that are not valid UTF-8 are converted lossily.
pub fn format_message(payload: &[u8], format: PayloadFormat) -> String {
    match format {
        PayloadFormat::Plain => String::from_utf8_lossy(payload).into_owned(),
        PayloadFormat::Base64 => format!("{}{}", BASE64_PREFIX, STANDARD.encode(payload)),
    }
}
