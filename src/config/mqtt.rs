//! MQTT Configuration
//!
//! Connection settings for the bus adapter.

use std::time::Duration;

use serde::Deserialize;

use crate::envelope::QoS;

/// Broker connection protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqttProtocol {
    /// Plain MQTT over TCP
    #[default]
    Mqtt,
    /// MQTT over TLS
    Mqtts,
    /// MQTT over WebSocket
    Ws,
    /// MQTT over WebSocket with TLS
    Wss,
}

impl std::fmt::Display for MqttProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MqttProtocol::Mqtt => write!(f, "mqtt"),
            MqttProtocol::Mqtts => write!(f, "mqtts"),
            MqttProtocol::Ws => write!(f, "ws"),
            MqttProtocol::Wss => write!(f, "wss"),
        }
    }
}

impl MqttProtocol {
    /// Get default port for this protocol
    pub fn default_port(&self) -> u16 {
        match self {
            MqttProtocol::Mqtt => 1883,
            MqttProtocol::Mqtts => 8883,
            MqttProtocol::Ws => 80,
            MqttProtocol::Wss => 443,
        }
    }

    /// Check if this protocol uses TLS
    pub fn uses_tls(&self) -> bool {
        matches!(self, MqttProtocol::Mqtts | MqttProtocol::Wss)
    }

    /// Check if this protocol uses WebSocket
    pub fn uses_websocket(&self) -> bool {
        matches!(self, MqttProtocol::Ws | MqttProtocol::Wss)
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host name
    pub host: String,

    /// Broker port (defaults per protocol)
    pub port: Option<u16>,

    /// Connection protocol
    pub protocol: MqttProtocol,

    /// WebSocket path (when using ws or wss)
    pub ws_path: String,

    /// Client ID presented to the broker
    pub client_id: String,

    /// Username for authentication
    pub username: Option<String>,

    /// Password for authentication
    pub password: Option<String>,

    /// Time allowed for the initial CONNACK
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// Keep-alive interval
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,

    /// QoS used for HTTP publishes that do not specify one
    pub default_qos: u8,

    /// Maximum outgoing in-flight QoS 1/2 messages
    pub max_inflight: u16,

    /// Start with a clean session on every connect
    pub clean_session: bool,

    /// Delay before the first reconnection attempt
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Upper bound for the exponential reconnection delay
    #[serde(with = "humantime_serde")]
    pub max_reconnect_interval: Duration,

    /// Arrived messages buffered ahead of the distribution task
    pub channel_capacity: usize,

    /// Certificates for mqtts/wss
    pub tls: MqttTlsConfig,
}

/// TLS material for mqtts/wss connections.
///
/// Without a CA certificate the platform's default roots are used.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MqttTlsConfig {
    /// Path to CA certificate file (PEM format)
    pub ca_cert: Option<String>,

    /// Path to client certificate file (PEM format)
    pub client_cert: Option<String>,

    /// Path to client private key file (PEM format)
    pub client_key: Option<String>,
}

impl MqttTlsConfig {
    /// True when any certificate path is configured
    pub fn is_custom(&self) -> bool {
        self.ca_cert.is_some() || self.client_cert.is_some() || self.client_key.is_some()
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            protocol: MqttProtocol::default(),
            ws_path: "/mqtt".to_string(),
            client_id: "MQTTBridge".to_string(),
            username: None,
            password: None,
            connection_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(60),
            default_qos: 1,
            max_inflight: 10,
            clean_session: false,
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(60),
            channel_capacity: 64,
            tls: MqttTlsConfig::default(),
        }
    }
}

impl MqttConfig {
    /// Effective broker port
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// Broker address as `host:port`, or a WebSocket URL for ws/wss
    pub fn broker_url(&self) -> String {
        let port = self.effective_port();
        if self.protocol.uses_websocket() {
            format!("{}://{}:{}{}", self.protocol, self.host, port, self.ws_path)
        } else {
            format!("{}:{}", self.host, port)
        }
    }

    /// Default QoS for publishes without an explicit level
    pub fn default_qos(&self) -> QoS {
        QoS::from_u8(self.default_qos).unwrap_or_default()
    }

    /// Username and password, when a username is configured
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match self.username.as_deref() {
            Some(username) if !username.is_empty() => {
                Some((username, self.password.as_deref().unwrap_or("")))
            }
            _ => None,
        }
    }
}
