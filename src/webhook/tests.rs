//! Webhook dispatcher tests

use std::collections::VecDeque;

use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;

use super::*;
use crate::codec::PayloadFormat;
use crate::distribution::DistributionEngine;

/// Client returning scripted results and recording each request
#[derive(Default)]
struct ScriptedClient {
    responses: Mutex<VecDeque<Result<u16, WebhookError>>>,
    requests: Mutex<Vec<(String, serde_json::Value)>>,
}

impl ScriptedClient {
    fn new(responses: Vec<Result<u16, WebhookError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<(String, serde_json::Value)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl WebhookClient for Arc<ScriptedClient> {
    async fn post_json(&self, url: Url, body: String) -> Result<u16, WebhookError> {
        let value = serde_json::from_str(&body).unwrap();
        self.requests.lock().push((url.to_string(), value));
        self.responses.lock().pop_front().unwrap_or(Ok(200))
    }
}

fn definition(pattern: &str, format: PayloadFormat) -> SubscriptionDefinition {
    SubscriptionDefinition::new(pattern, pattern, format, QoS::AtMostOnce)
}

fn dispatcher(
    template: &str,
    client: Arc<ScriptedClient>,
) -> WebhookDispatcher<Arc<ScriptedClient>> {
    WebhookDispatcher::new(UrlTemplate::new(template), client, Arc::new(Metrics::new()))
}

// =============================================================================
// URL template
// =============================================================================

#[test]
fn test_template_escaped_placeholder() {
    let template = UrlTemplate::new("http://hooks.local/notify/{{subscription}}");
    assert_eq!(
        template.resolve("home/#"),
        "http://hooks.local/notify/home%2F%23"
    );
}

#[test]
fn test_template_decoded_placeholder() {
    let template = UrlTemplate::new("http://hooks.local/notify?topic={{decodedsubscription}}");
    assert_eq!(
        template.resolve("home/kitchen/light"),
        "http://hooks.local/notify?topic=home/kitchen/light"
    );
}

#[test]
fn test_template_both_placeholders() {
    let template =
        UrlTemplate::new("http://h/{{subscription}}/{{decodedsubscription}}/{{subscription}}");
    assert_eq!(template.resolve("a b"), "http://h/a%20b/a b/a%20b");
}

#[test]
fn test_template_escapes_with_percent_encoding() {
    // RFC 3986 escaping: space is `%20`, never form-style `+`
    let template = UrlTemplate::new("http://h/{{subscription}}");
    assert_eq!(
        template.resolve("living room/+/#"),
        "http://h/living%20room%2F%2B%2F%23"
    );
    assert!(!template.resolve("a b").contains('+'));
}

#[test]
fn test_template_without_placeholders() {
    let template = UrlTemplate::new("http://h/fixed");
    assert_eq!(template.resolve("home/#"), "http://h/fixed");
}

#[test]
fn test_template_resolve_url_invalid() {
    let template = UrlTemplate::new("not a url {{subscription}}");
    assert!(matches!(
        template.resolve_url("home/#"),
        Err(WebhookError::InvalidUrl(_))
    ));
}

#[test]
fn test_template_validate_against_table() {
    let mut table = SubscriptionTable::new();
    table.insert(definition("home/#", PayloadFormat::Plain));
    table.insert(definition("#", PayloadFormat::Plain));

    assert!(UrlTemplate::new("http://h/{{subscription}}")
        .validate(&table)
        .is_ok());
    assert!(matches!(
        UrlTemplate::new("{{decodedsubscription}}").validate(&table),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_template_from_config() {
    let mut table = SubscriptionTable::new();
    let none = WebhookConfig { url: None };
    assert_eq!(UrlTemplate::from_config(&none, &table).unwrap(), None);

    table.insert(definition("home/#", PayloadFormat::Plain));
    assert!(matches!(
        UrlTemplate::from_config(&none, &table),
        Err(ConfigError::Validation(_))
    ));

    let set = WebhookConfig {
        url: Some("http://hooks.local/{{subscription}}".to_string()),
    };
    assert_eq!(
        UrlTemplate::from_config(&set, &table).unwrap(),
        Some(UrlTemplate::new("http://hooks.local/{{subscription}}"))
    );
}

// =============================================================================
// Body
// =============================================================================

#[test]
fn test_body_minimal() {
    let envelope = Envelope::new("home/door", Bytes::from_static(b"open"), QoS::AtMostOnce, false);
    let body = WebhookBody::new(&definition("home/#", PayloadFormat::Plain), &envelope);

    assert_eq!(
        serde_json::to_value(&body).unwrap(),
        json!({"topic": "home/door", "message": "open"})
    );
}

#[test]
fn test_body_with_qos_and_retained() {
    let envelope = Envelope::new("home/door", Bytes::from_static(b"open"), QoS::ExactlyOnce, true);
    let body = WebhookBody::new(&definition("home/#", PayloadFormat::Base64), &envelope);

    assert_eq!(
        serde_json::to_value(&body).unwrap(),
        json!({"topic": "home/door", "message": "base64:b3Blbg==", "qos": 2, "retained": true})
    );
}

#[test]
fn test_body_field_order() {
    let envelope = Envelope::new("t", Bytes::from_static(b"m"), QoS::AtLeastOnce, true);
    let body = WebhookBody::new(&definition("t", PayloadFormat::Plain), &envelope);

    assert_eq!(
        serde_json::to_string(&body).unwrap(),
        r#"{"topic":"t","message":"m","qos":1,"retained":true}"#
    );
}

// =============================================================================
// Delivery
// =============================================================================

#[test]
fn test_outcome_classification() {
    assert_eq!(DeliveryOutcome::classify(Ok(200)), DeliveryOutcome::Delivered(200));
    assert_eq!(DeliveryOutcome::classify(Ok(204)), DeliveryOutcome::Delivered(204));
    assert_eq!(DeliveryOutcome::classify(Ok(301)), DeliveryOutcome::Rejected(301));
    assert_eq!(DeliveryOutcome::classify(Ok(404)), DeliveryOutcome::Rejected(404));
    assert_eq!(DeliveryOutcome::classify(Ok(500)), DeliveryOutcome::Rejected(500));
    assert_eq!(
        DeliveryOutcome::classify(Err(WebhookError::Transport("refused".into()))),
        DeliveryOutcome::Failed(WebhookError::Transport("refused".into()))
    );
}

#[tokio::test]
async fn test_deliver_posts_once_to_resolved_url() {
    let client = ScriptedClient::new(vec![Ok(202)]);
    let dispatcher = dispatcher("http://hooks.local/{{subscription}}", client.clone());
    let envelope = Envelope::new("home/door", Bytes::from_static(b"open"), QoS::AtMostOnce, false);

    let outcome = dispatcher
        .deliver("home/#", &definition("home/#", PayloadFormat::Plain), &envelope)
        .await
        .unwrap();

    assert_eq!(outcome, DeliveryOutcome::Delivered(202));
    assert_eq!(
        client.requests(),
        vec![(
            "http://hooks.local/home%2F%23".to_string(),
            json!({"topic": "home/door", "message": "open"})
        )]
    );
}

#[tokio::test]
async fn test_deliver_never_retries() {
    let client = ScriptedClient::new(vec![
        Ok(503),
        Err(WebhookError::Transport("connection refused".into())),
    ]);
    let dispatcher = dispatcher("http://hooks.local/x", client.clone());
    let envelope = Envelope::new("a", Bytes::from_static(b"1"), QoS::AtMostOnce, false);
    let def = definition("a", PayloadFormat::Plain);

    let first = dispatcher.deliver("a", &def, &envelope).await.unwrap();
    assert_eq!(first, DeliveryOutcome::Rejected(503));
    assert_eq!(client.requests().len(), 1);

    let second = dispatcher.deliver("a", &def, &envelope).await.unwrap();
    assert!(matches!(second, DeliveryOutcome::Failed(WebhookError::Transport(_))));
    assert_eq!(client.requests().len(), 2);

    let metrics = &dispatcher.metrics;
    assert_eq!(
        metrics
            .webhook_deliveries_total
            .with_label_values(&[OUTCOME_REJECTED])
            .get(),
        1
    );
    assert_eq!(
        metrics
            .webhook_deliveries_total
            .with_label_values(&[OUTCOME_FAILED])
            .get(),
        1
    );
}

#[tokio::test]
async fn test_deliver_invalid_url_is_error() {
    let client = ScriptedClient::new(vec![]);
    let dispatcher = dispatcher("{{decodedsubscription}}", client.clone());
    let envelope = Envelope::new("a", Bytes::from_static(b"1"), QoS::AtMostOnce, false);

    let result = dispatcher
        .deliver("a", &definition("a", PayloadFormat::Plain), &envelope)
        .await;

    assert!(matches!(result, Err(WebhookError::InvalidUrl(_))));
    assert!(client.requests().is_empty());
}

#[tokio::test]
async fn test_failed_dispatch_does_not_block_next_match() {
    // First match gets a 500, the second must still be attempted
    let client = ScriptedClient::new(vec![Ok(500), Ok(200)]);
    let mut table = SubscriptionTable::new();
    table.insert(definition("home/kitchen/light", PayloadFormat::Plain));
    table.insert(definition("home/#", PayloadFormat::Base64));

    let metrics = Arc::new(Metrics::new());
    let engine = DistributionEngine::new(
        Arc::new(table),
        WebhookDispatcher::new(
            UrlTemplate::new("http://hooks.local/{{subscription}}"),
            client.clone(),
            metrics.clone(),
        ),
        metrics,
    );

    let envelope = Envelope::new(
        "home/kitchen/light",
        Bytes::from_static(b"on"),
        QoS::AtMostOnce,
        false,
    );
    let count = engine.distribute(&envelope).await;

    assert_eq!(count, 2);
    assert_eq!(
        client.requests(),
        vec![
            (
                "http://hooks.local/home%2Fkitchen%2Flight".to_string(),
                json!({"topic": "home/kitchen/light", "message": "on"})
            ),
            (
                "http://hooks.local/home%2F%23".to_string(),
                json!({"topic": "home/kitchen/light", "message": "base64:b24="})
            ),
        ]
    );
}
