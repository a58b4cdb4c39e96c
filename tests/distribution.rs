//! End-to-end notification tests
//!
//! Configuration text is parsed into a subscription table, arrived messages
//! are distributed, and the resulting webhook calls are observed on a mock
//! HTTP server.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mqtt_http_bridge::config::Config;
use mqtt_http_bridge::distribution::{run_distribution, DistributionEngine};
use mqtt_http_bridge::envelope::{Envelope, QoS};
use mqtt_http_bridge::metrics::Metrics;
use mqtt_http_bridge::webhook::{UrlTemplate, WebhookDispatcher};

fn engine(
    server: &MockServer,
    subscriptions: &str,
) -> (DistributionEngine<WebhookDispatcher>, Arc<Metrics>) {
    let config = Config::parse(&format!(
        "{}\n[webhook]\nurl = \"{}/notify/{{{{subscription}}}}\"\n",
        subscriptions,
        server.uri()
    ))
    .unwrap();

    let table = Arc::new(config.subscriptions().unwrap());
    let template = UrlTemplate::from_config(&config.webhook, &table)
        .unwrap()
        .unwrap();
    let metrics = Arc::new(Metrics::new());
    let dispatcher = WebhookDispatcher::with_default_client(template, metrics.clone());

    (
        DistributionEngine::new(table, dispatcher, metrics.clone()),
        metrics,
    )
}

async fn received_paths(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| request.url.path().to_string())
        .collect()
}

#[tokio::test]
async fn test_exact_and_wildcard_with_per_subscription_format() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/notify/home%2Fkitchen%2Flight"))
        .and(header("content-type", "application/json; charset=utf-8"))
        .and(body_json(
            json!({"topic": "home/kitchen/light", "message": "on"}),
        ))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/notify/home%2F%23"))
        .and(body_json(
            json!({"topic": "home/kitchen/light", "message": "base64:b24="}),
        ))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, _) = engine(
        &server,
        r##"
[mqtt.topic]
light = "home/kitchen/light"
home = "home/#"
"home.format" = 1
"##,
    );

    let envelope = Envelope::new(
        "home/kitchen/light",
        Bytes::from_static(b"on"),
        QoS::AtMostOnce,
        false,
    );
    assert_eq!(engine.distribute(&envelope).await, 2);

    assert_eq!(
        received_paths(&server).await,
        vec!["/notify/home%2Fkitchen%2Flight", "/notify/home%2F%23"]
    );
}

#[tokio::test]
async fn test_rejected_delivery_does_not_stop_later_matches() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/notify/a%2Fb%2F%23"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/notify/a%2F%23"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/notify/%23"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (engine, metrics) = engine(
        &server,
        r##"
[mqtt.topic]
1 = "a/b/#"
2 = "a/#"
3 = "#"
"##,
    );

    let envelope = Envelope::new("a/b/c", Bytes::from_static(b"x"), QoS::AtLeastOnce, true);
    assert_eq!(engine.distribute(&envelope).await, 3);

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(
        body,
        json!({"topic": "a/b/c", "message": "x", "qos": 1, "retained": true})
    );

    assert_eq!(
        metrics
            .webhook_deliveries_total
            .with_label_values(&["rejected"])
            .get(),
        1
    );
    assert_eq!(
        metrics
            .webhook_deliveries_total
            .with_label_values(&["delivered"])
            .get(),
        2
    );
}

#[tokio::test]
async fn test_unmatched_and_single_level_wildcard_are_silent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (engine, metrics) = engine(
        &server,
        r##"
[mqtt.topic]
temp = "sensors/+/temp"
other = "office/#"
"##,
    );

    let envelope = Envelope::new(
        "sensors/kitchen/temp",
        Bytes::from_static(b"21"),
        QoS::AtMostOnce,
        false,
    );
    assert_eq!(engine.distribute(&envelope).await, 0);
    assert_eq!(metrics.messages_unmatched_total.get(), 1);
}

#[tokio::test]
async fn test_message_task_preserves_arrival_order() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(20)))
        .mount(&server)
        .await;

    let (engine, _) = engine(
        &server,
        r##"
[mqtt.topic]
all = "#"
"##,
    );

    let (tx, rx) = mpsc::channel(8);
    let task = tokio::spawn(run_distribution(engine, rx));

    for n in 0..5 {
        let envelope = Envelope::new(
            format!("seq/{}", n),
            Bytes::from(n.to_string()),
            QoS::AtMostOnce,
            false,
        );
        tx.send(envelope).await.unwrap();
    }
    drop(tx);
    task.await.unwrap();

    let topics: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|request| {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            body["topic"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(topics, vec!["seq/0", "seq/1", "seq/2", "seq/3", "seq/4"]);
}

#[tokio::test]
async fn test_unreachable_webhook_is_contained() {
    // Nothing listens on the port once the listener is dropped
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let config = Config::parse(&format!(
        "[mqtt.topic]\nall = \"#\"\n[webhook]\nurl = \"http://127.0.0.1:{}/{{{{subscription}}}}\"\n",
        port
    ))
    .unwrap();
    let table = Arc::new(config.subscriptions().unwrap());
    let template = UrlTemplate::from_config(&config.webhook, &table)
        .unwrap()
        .unwrap();
    let metrics = Arc::new(Metrics::new());
    let engine = DistributionEngine::new(
        table,
        WebhookDispatcher::with_default_client(template, metrics.clone()),
        metrics.clone(),
    );

    let envelope = Envelope::new("x", Bytes::from_static(b"1"), QoS::AtMostOnce, false);
    assert_eq!(engine.distribute(&envelope).await, 1);
    assert_eq!(
        metrics
            .webhook_deliveries_total
            .with_label_values(&["failed"])
            .get(),
        1
    );
}
