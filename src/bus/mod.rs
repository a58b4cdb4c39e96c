//! Bus Adapter
//!
//! The MQTT side of the bridge. One explicitly owned connection serves both
//! directions:
//! - the HTTP front door publishes through [`BusClient::publish`];
//! - arrived messages are converted to [`Envelope`]s by the connection's
//!   event loop and handed to the distribution task over a channel.
//!
//! [`MqttBus`] is the production implementation on top of `rumqttc`.

use std::fmt;

use async_trait::async_trait;

use crate::envelope::{Envelope, QoS};

mod mqtt;


pub use mqtt::MqttBus;

/// Error type for bus operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Could not establish the connection
    Connect(String),
    /// Broker did not answer in time
    Timeout,
    /// Broker refused the connection
    Rejected(String),
    /// Request could not be handed to the client
    Client(String),
    /// TLS material could not be loaded
    Tls(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Connect(msg) => write!(f, "Connection failed: {}", msg),
            BusError::Timeout => write!(f, "Connection timed out"),
            BusError::Rejected(msg) => write!(f, "Connection rejected: {}", msg),
            BusError::Client(msg) => write!(f, "Client error: {}", msg),
            BusError::Tls(msg) => write!(f, "TLS error: {}", msg),
        }
    }
}

impl std::error::Error for BusError {}

impl From<rumqttc::ClientError> for BusError {
    fn from(e: rumqttc::ClientError) -> Self {
        BusError::Client(e.to_string())
    }
}

/// Status of the bus connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    /// Not connected
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and operational
    Connected,
    /// Connection lost, waiting before the next attempt
    Backoff,
}

impl fmt::Display for BusStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusStatus::Disconnected => write!(f, "disconnected"),
            BusStatus::Connecting => write!(f, "connecting"),
            BusStatus::Connected => write!(f, "connected"),
            BusStatus::Backoff => write!(f, "backoff"),
        }
    }
}

/// Operations the bridge needs from the message bus
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Current connection status
    fn status(&self) -> BusStatus;

    /// Subscribe to a topic pattern
    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), BusError>;

    /// Publish one message (exact topic, no wildcard expansion)
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError>;

    /// Unsubscribe everything and close the connection
    async fn disconnect(&self) -> Result<(), BusError>;
}
