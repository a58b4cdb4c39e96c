//! Webhook Dispatcher
//!
//! Turns one matched (pattern, envelope) pair into exactly one HTTP POST:
//!
//! 1. the destination URL is resolved from the configured template,
//! 2. a minimal JSON body is built (`qos` and `retained` only when set),
//! 3. the body is posted once, with no retry,
//! 4. the outcome is classified and logged.
//!
//! Delivery failures never leave the dispatcher. A template that cannot
//! produce a valid URL is rejected at startup by [`UrlTemplate::validate`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::codec::format_message;
use crate::config::{ConfigError, WebhookConfig};
use crate::distribution::Dispatch;
use crate::envelope::{Envelope, QoS};
use crate::metrics::{Metrics, OUTCOME_DELIVERED, OUTCOME_FAILED, OUTCOME_REJECTED};
use crate::subscription::{SubscriptionDefinition, SubscriptionTable};

#[cfg(test)]
mod tests;

/// Placeholder replaced by the URL-escaped subscription pattern
pub const SUBSCRIPTION_PLACEHOLDER: &str = "{{subscription}}";

/// Placeholder replaced by the raw subscription pattern
pub const DECODED_SUBSCRIPTION_PLACEHOLDER: &str = "{{decodedsubscription}}";

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Webhook error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookError {
    /// Connection refused, DNS failure, broken connection...
    Transport(String),
    /// Resolved URL could not be parsed
    InvalidUrl(String),
}

impl fmt::Display for WebhookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebhookError::Transport(msg) => write!(f, "Transport error: {}", msg),
            WebhookError::InvalidUrl(msg) => write!(f, "Invalid webhook URL: {}", msg),
        }
    }
}

impl std::error::Error for WebhookError {}

/// Webhook URL template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    template: String,
}

impl UrlTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Template for the configured subscriptions.
    ///
    /// A URL is required as soon as one subscription exists, and must resolve
    /// to a valid URL for every configured pattern.
    pub fn from_config(
        config: &WebhookConfig,
        table: &SubscriptionTable,
    ) -> Result<Option<Self>, ConfigError> {
        let Some(url) = config.url.as_deref() else {
            if table.is_empty() {
                return Ok(None);
            }
            return Err(ConfigError::Validation(format!(
                "webhook.url is required by {} subscription(s)",
                table.len()
            )));
        };

        let template = Self::new(url);
        template.validate(table)?;
        Ok(Some(template))
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Substitute both placeholders for a pattern
    pub fn resolve(&self, pattern: &str) -> String {
        self.template
            .replace(SUBSCRIPTION_PLACEHOLDER, &urlencoding::encode(pattern))
            .replace(DECODED_SUBSCRIPTION_PLACEHOLDER, pattern)
    }

    /// Substitute and parse the result as a URL
    pub fn resolve_url(&self, pattern: &str) -> Result<Url, WebhookError> {
        let resolved = self.resolve(pattern);
        Url::parse(&resolved).map_err(|e| WebhookError::InvalidUrl(format!("{}: {}", resolved, e)))
    }

    /// Check that every configured pattern yields a valid URL
    pub fn validate(&self, table: &SubscriptionTable) -> Result<(), ConfigError> {
        for definition in table.iter() {
            self.resolve_url(&definition.pattern).map_err(|e| {
                ConfigError::Validation(format!(
                    "webhook.url for subscription '{}': {}",
                    definition.name, e
                ))
            })?;
        }
        Ok(())
    }
}

/// JSON body posted to the webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookBody<'a> {
    pub topic: &'a str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qos: Option<u8>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retained: bool,
}

impl<'a> WebhookBody<'a> {
    pub fn new(definition: &SubscriptionDefinition, envelope: &'a Envelope) -> Self {
        let qos = match envelope.qos() {
            QoS::AtMostOnce => None,
            qos => Some(qos.as_u8()),
        };
        Self {
            topic: envelope.topic(),
            message: format_message(envelope.payload(), definition.format),
            qos,
            retained: envelope.is_retained(),
        }
    }
}

/// Outbound HTTP client used for deliveries.
///
/// Returns the response status code, or an error when no response was
/// received at all.
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn post_json(&self, url: Url, body: String) -> Result<u16, WebhookError>;
}

#[async_trait]
impl WebhookClient for reqwest::Client {
    async fn post_json(&self, url: Url, body: String) -> Result<u16, WebhookError> {
        let response = self
            .post(url)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| WebhookError::Transport(e.to_string()))?;
        Ok(response.status().as_u16())
    }
}

/// Classified result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 2xx response
    Delivered(u16),
    /// Any other response status
    Rejected(u16),
    /// No response
    Failed(WebhookError),
}

impl DeliveryOutcome {
    fn classify(result: Result<u16, WebhookError>) -> Self {
        match result {
            Ok(status) if (200..300).contains(&status) => DeliveryOutcome::Delivered(status),
            Ok(status) => DeliveryOutcome::Rejected(status),
            Err(e) => DeliveryOutcome::Failed(e),
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered(_))
    }

    fn metric_label(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered(_) => OUTCOME_DELIVERED,
            DeliveryOutcome::Rejected(_) => OUTCOME_REJECTED,
            DeliveryOutcome::Failed(_) => OUTCOME_FAILED,
        }
    }
}

/// Delivers matched messages to the configured webhook
pub struct WebhookDispatcher<C = reqwest::Client> {
    template: UrlTemplate,
    client: C,
    metrics: Arc<Metrics>,
}

impl WebhookDispatcher<reqwest::Client> {
    /// Dispatcher backed by a default `reqwest` client
    pub fn with_default_client(template: UrlTemplate, metrics: Arc<Metrics>) -> Self {
        Self::new(template, reqwest::Client::new(), metrics)
    }
}

impl<C: WebhookClient> WebhookDispatcher<C> {
    pub fn new(template: UrlTemplate, client: C, metrics: Arc<Metrics>) -> Self {
        Self {
            template,
            client,
            metrics,
        }
    }

    pub fn template(&self) -> &UrlTemplate {
        &self.template
    }

    /// Perform one delivery and classify it.
    ///
    /// Only an unresolvable URL is returned as an error; every network or
    /// HTTP level failure is an outcome.
    pub async fn deliver(
        &self,
        pattern: &str,
        definition: &SubscriptionDefinition,
        envelope: &Envelope,
    ) -> Result<DeliveryOutcome, WebhookError> {
        let url = self.template.resolve_url(pattern)?;
        let body = WebhookBody::new(definition, envelope);
        let json = serde_json::to_string(&body).map_err(|e| {
            WebhookError::Transport(format!("Cannot serialize webhook body: {}", e))
        })?;

        debug!("Subscription topic command: {} -> {}", url, json);

        let outcome = DeliveryOutcome::classify(self.client.post_json(url, json).await);
        self.metrics.webhook_delivery(outcome.metric_label());
        Ok(outcome)
    }
}

#[async_trait]
impl<C: WebhookClient> Dispatch for WebhookDispatcher<C> {
    async fn dispatch(
        &self,
        pattern: &str,
        definition: &SubscriptionDefinition,
        envelope: &Envelope,
    ) {
        match self.deliver(pattern, definition, envelope).await {
            Ok(DeliveryOutcome::Delivered(_)) => {
                info!("Subscription notified for: {}", pattern);
            }
            Ok(DeliveryOutcome::Rejected(status)) => {
                warn!(
                    "Subscription cannot be notified for: {}. Server returned: {}.",
                    pattern, status
                );
            }
            Ok(DeliveryOutcome::Failed(e)) => {
                warn!("Subscription failed for: {}. {}", pattern, e);
            }
            Err(e) => {
                error!("Subscription '{}' skipped: {}", definition.name, e);
            }
        }
    }
}
