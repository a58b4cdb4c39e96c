//! HTTP Front Door
//!
//! Accepts authenticated `POST /<topic>` requests and publishes them on the
//! bus. Also serves `GET /health` and `GET /metrics` without authentication.
//!
//! Each connection is served on its own task. Requests share only the bus
//! handle, the metrics and the immutable settings.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::bus::BusClient;
use crate::config::WebConfig;
use crate::envelope::QoS;
use crate::metrics::{
    Metrics, RESULT_FAILED, RESULT_INVALID, RESULT_PUBLISHED, RESULT_UNAUTHORIZED,
};

pub mod auth;
mod publish;


pub use publish::{
    decode_publish, topic_from_path, PublishError, MSG_EMPTY_TOPIC, MSG_INVALID_JSON,
    MSG_INVALID_MESSAGE, MSG_INVALID_TOPIC, MSG_PUBLISH_FAILED,
};

/// Largest accepted request body
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Response body for every JSON endpoint
#[derive(Debug, Serialize)]
struct ApiResponse<'a> {
    success: bool,
    message: &'a str,
}

/// HTTP server publishing requests to the bus
pub struct HttpServer {
    bind: SocketAddr,
    front_door: Arc<FrontDoor>,
}

struct FrontDoor {
    token: String,
    bus: Arc<dyn BusClient>,
    metrics: Arc<Metrics>,
    default_qos: QoS,
}

impl HttpServer {
    pub fn new(
        config: &WebConfig,
        bus: Arc<dyn BusClient>,
        metrics: Arc<Metrics>,
        default_qos: QoS,
    ) -> Self {
        Self {
            bind: config.bind,
            front_door: Arc::new(FrontDoor {
                token: config.token.clone(),
                bus,
                metrics,
                default_qos,
            }),
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind
    }

    /// Bind the configured address and serve until an error occurs
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.bind).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(
        self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("HTTP front door listening on http://{}", listener.local_addr()?);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept HTTP connection: {}", e);
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            let front_door = self.front_door.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let front_door = front_door.clone();
                    async move { front_door.handle(req, peer).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Error serving HTTP connection from {}: {:?}", peer, err);
                }
            });
        }
    }
}

impl FrontDoor {
    async fn handle<B>(
        &self,
        req: Request<B>,
        peer: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, Infallible>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if req.method() == Method::GET {
            match req.uri().path() {
                "/health" => return Ok(text_response(StatusCode::OK, "text/plain", "OK")),
                "/metrics" => return Ok(self.metrics_response()),
                _ => {}
            }
        }

        let header = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        if !auth::is_authorized(header, &self.token) {
            info!("Unauthorized request from {}", peer);
            if req.method() == Method::POST {
                self.metrics.http_publish(RESULT_UNAUTHORIZED);
            }
            return Ok(json_response(
                StatusCode::UNAUTHORIZED,
                false,
                "Unauthorized.",
            ));
        }

        if req.method() != Method::POST {
            return Ok(json_response(StatusCode::NOT_FOUND, false, "Not found."));
        }

        Ok(self.publish(req).await)
    }

    async fn publish<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let topic = match topic_from_path(req.uri().path()) {
            Ok(topic) => topic,
            Err(e) => return self.reject(e),
        };

        let body = match Limited::new(req.into_body(), MAX_BODY_SIZE).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                self.metrics.http_publish(RESULT_INVALID);
                return json_response(StatusCode::PAYLOAD_TOO_LARGE, false, "Body too large.");
            }
            Err(e) => {
                warn!("Cannot read request body: {}", e);
                self.metrics.http_publish(RESULT_INVALID);
                return json_response(StatusCode::BAD_REQUEST, false, MSG_INVALID_JSON);
            }
        };

        let envelope = match decode_publish(topic, &body, self.default_qos) {
            Ok(envelope) => envelope,
            Err(e) => return self.reject(e),
        };

        let topic = envelope.topic().to_string();
        match self.bus.publish(envelope).await {
            Ok(()) => {
                debug!("Published HTTP message to '{}'", topic);
                self.metrics.http_publish(RESULT_PUBLISHED);
                json_response(
                    StatusCode::OK,
                    true,
                    &format!("Successfully sent message to topic [{}]", topic),
                )
            }
            Err(e) => {
                warn!("{} {}", MSG_PUBLISH_FAILED, e);
                self.metrics.http_publish(RESULT_FAILED);
                json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    false,
                    MSG_PUBLISH_FAILED,
                )
            }
        }
    }

    fn reject(&self, e: PublishError) -> Response<Full<Bytes>> {
        warn!("{} {}", e.response_message(), e);
        self.metrics.http_publish(RESULT_INVALID);
        json_response(StatusCode::BAD_REQUEST, false, e.response_message())
    }

    fn metrics_response(&self) -> Response<Full<Bytes>> {
        match self.metrics.encode() {
            Ok((content_type, buffer)) => {
                let mut response = Response::new(Full::new(Bytes::from(buffer)));
                if let Ok(value) = HeaderValue::from_str(&content_type) {
                    response.headers_mut().insert(CONTENT_TYPE, value);
                }
                response
            }
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    "Failed to encode metrics",
                )
            }
        }
    }
}

fn text_response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response(status: StatusCode, success: bool, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(&ApiResponse { success, message }).unwrap_or_default();
    text_response(status, JSON_CONTENT_TYPE, body)
}
