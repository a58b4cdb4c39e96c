//! mqtt-http-bridge - Bridge between an MQTT broker and HTTP
//!
//! Two independent directions share one broker connection:
//! - **publish**: authenticated `POST /<topic>` requests become MQTT
//!   publications;
//! - **notify**: MQTT messages matching configured subscriptions become
//!   webhook calls, one per matching subscription.

pub mod bus;
pub mod codec;
pub mod config;
pub mod distribution;
pub mod envelope;
pub mod http;
pub mod metrics;
pub mod subscription;
pub mod webhook;

pub use bus::{BusClient, BusError, BusStatus, MqttBus};
pub use codec::{format_message, parse_message, PayloadFormat};
pub use config::Config;
pub use distribution::{candidate_patterns, run_distribution, Dispatch, DistributionEngine};
pub use envelope::{Envelope, QoS};
pub use http::HttpServer;
pub use metrics::Metrics;
pub use subscription::{SubscriptionDefinition, SubscriptionTable};
pub use webhook::{UrlTemplate, WebhookDispatcher};
