//! Publish request decoding
//!
//! `POST /<topic>` with `{"message": str, "qos"?: int, "retained"?: bool}`
//! becomes one [`Envelope`].

use std::fmt;

use serde::Deserialize;

use crate::codec::{parse_message, CodecError};
use crate::envelope::{Envelope, QoS};

pub const MSG_EMPTY_TOPIC: &str = "Empty topic.";
pub const MSG_INVALID_TOPIC: &str = "Topic must be valid UTF-8.";
pub const MSG_INVALID_JSON: &str = "Body must be a valid JSON.";
pub const MSG_INVALID_MESSAGE: &str = "Body must be a valid MQTT message.";
pub const MSG_PUBLISH_FAILED: &str = "Cannot publish message to MQTT broker.";

/// Reasons a publish request is rejected with 400
#[derive(Debug)]
pub enum PublishError {
    EmptyTopic,
    InvalidTopic,
    /// Wildcard or NUL in a topic name
    ForbiddenTopic(String),
    InvalidJson(serde_json::Error),
    InvalidMessage(String),
}

impl PublishError {
    /// Message returned to the HTTP caller
    pub fn response_message(&self) -> &'static str {
        match self {
            PublishError::EmptyTopic => MSG_EMPTY_TOPIC,
            PublishError::InvalidTopic => MSG_INVALID_TOPIC,
            PublishError::ForbiddenTopic(_) => MSG_INVALID_MESSAGE,
            PublishError::InvalidJson(_) => MSG_INVALID_JSON,
            PublishError::InvalidMessage(_) => MSG_INVALID_MESSAGE,
        }
    }
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::EmptyTopic => write!(f, "Empty topic"),
            PublishError::InvalidTopic => write!(f, "Topic is not valid UTF-8"),
            PublishError::ForbiddenTopic(topic) => {
                write!(f, "Topic '{}' contains a wildcard or NUL character", topic)
            }
            PublishError::InvalidJson(e) => write!(f, "Invalid JSON body: {}", e),
            PublishError::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<CodecError> for PublishError {
    fn from(e: CodecError) -> Self {
        PublishError::InvalidMessage(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct PublishBody {
    message: String,
    #[serde(default)]
    qos: Option<i64>,
    #[serde(default)]
    retained: Option<bool>,
}

/// Topic from a request path: leading `/` removed, percent-decoded.
///
/// Topic names may not carry `#`, `+` or NUL.
pub fn topic_from_path(path: &str) -> Result<String, PublishError> {
    let raw = path.strip_prefix('/').unwrap_or(path);
    if raw.is_empty() {
        return Err(PublishError::EmptyTopic);
    }
    let topic = urlencoding::decode(raw).map_err(|_| PublishError::InvalidTopic)?;
    if topic.contains(['#', '+', '\0']) {
        return Err(PublishError::ForbiddenTopic(topic.into_owned()));
    }
    Ok(topic.into_owned())
}

/// Resolve the requested QoS. Absent or negative means `default_qos`.
fn resolve_qos(requested: Option<i64>, default_qos: QoS) -> Result<QoS, PublishError> {
    match requested {
        None => Ok(default_qos),
        Some(level) if level < 0 => Ok(default_qos),
        Some(level) => u8::try_from(level)
            .ok()
            .and_then(QoS::from_u8)
            .ok_or_else(|| PublishError::InvalidMessage(format!("Invalid QoS level: {}", level))),
    }
}

/// Decode a request body into an envelope for `topic`
pub fn decode_publish(
    topic: String,
    body: &[u8],
    default_qos: QoS,
) -> Result<Envelope, PublishError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(PublishError::InvalidJson)?;
    let body: PublishBody =
        serde_json::from_value(value).map_err(|e| PublishError::InvalidMessage(e.to_string()))?;

    let qos = resolve_qos(body.qos, default_qos)?;
    let payload = parse_message(&body.message)?;

    Ok(Envelope::new(topic, payload, qos, body.retained.unwrap_or(false)))
}
