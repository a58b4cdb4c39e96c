//! Prometheus metrics for the bridge
//!
//! Exposed by the HTTP front door at `/metrics`.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Outcome label values for webhook deliveries
pub const OUTCOME_DELIVERED: &str = "delivered";
pub const OUTCOME_REJECTED: &str = "rejected";
pub const OUTCOME_FAILED: &str = "failed";

/// Result label values for HTTP publish requests
pub const RESULT_PUBLISHED: &str = "published";
pub const RESULT_INVALID: &str = "invalid";
pub const RESULT_FAILED: &str = "failed";
pub const RESULT_UNAUTHORIZED: &str = "unauthorized";

/// All bridge metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Notification direction
    pub messages_received_total: IntCounter,
    pub messages_unmatched_total: IntCounter,
    pub webhook_deliveries_total: IntCounterVec,

    // Publish direction
    pub http_publish_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_received_total = IntCounter::with_opts(Opts::new(
            "bridge_messages_received_total",
            "Total messages received from the MQTT broker",
        ))
        .unwrap();

        let messages_unmatched_total = IntCounter::with_opts(Opts::new(
            "bridge_messages_unmatched_total",
            "Messages that matched no configured subscription",
        ))
        .unwrap();

        let webhook_deliveries_total = IntCounterVec::new(
            Opts::new(
                "bridge_webhook_deliveries_total",
                "Webhook delivery attempts by outcome",
            ),
            &["outcome"],
        )
        .unwrap();

        let http_publish_total = IntCounterVec::new(
            Opts::new(
                "bridge_http_publish_total",
                "HTTP publish requests by result",
            ),
            &["result"],
        )
        .unwrap();

        registry
            .register(Box::new(messages_received_total.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_unmatched_total.clone()))
            .unwrap();
        registry
            .register(Box::new(webhook_deliveries_total.clone()))
            .unwrap();
        registry
            .register(Box::new(http_publish_total.clone()))
            .unwrap();

        Self {
            registry,
            messages_received_total,
            messages_unmatched_total,
            webhook_deliveries_total,
            http_publish_total,
        }
    }

    pub fn message_received(&self) {
        self.messages_received_total.inc();
    }

    pub fn message_unmatched(&self) {
        self.messages_unmatched_total.inc();
    }

    pub fn webhook_delivery(&self, outcome: &str) {
        self.webhook_deliveries_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn http_publish(&self, result: &str) {
        self.http_publish_total.with_label_values(&[result]).inc();
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> Result<(String, Vec<u8>), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let metrics = Metrics::new();
        metrics.message_received();
        metrics.webhook_delivery(OUTCOME_DELIVERED);
        metrics.webhook_delivery(OUTCOME_FAILED);
        metrics.http_publish(RESULT_PUBLISHED);

        let (content_type, body) = metrics.encode().unwrap();
        let text = String::from_utf8(body).unwrap();

        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("bridge_messages_received_total 1"));
        assert!(text.contains("bridge_webhook_deliveries_total{outcome=\"delivered\"} 1"));
        assert!(text.contains("bridge_webhook_deliveries_total{outcome=\"failed\"} 1"));
        assert!(text.contains("bridge_http_publish_total{result=\"published\"} 1"));
    }
}
