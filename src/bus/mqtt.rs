//! MQTT bus connection on `rumqttc`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, SubscribeFilter, TlsConfiguration, Transport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::{BusClient, BusError, BusStatus};
use crate::config::{MqttConfig, MqttProtocol, MqttTlsConfig};
use crate::envelope::{Envelope, QoS};
use crate::subscription::SubscriptionTable;

/// Requests buffered between the client handle and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Time allowed for the event loop to wind down after DISCONNECT
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection to the MQTT broker
pub struct MqttBus {
    client: AsyncClient,
    broker: String,
    status: Arc<RwLock<BusStatus>>,
    subscriptions: Arc<Vec<(String, QoS)>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Client options derived from the configuration.
    ///
    /// Fails when a configured certificate file cannot be read.
    pub fn options(config: &MqttConfig) -> Result<MqttOptions, BusError> {
        let port = config.effective_port();
        let host = if config.protocol.uses_websocket() {
            config.broker_url()
        } else {
            config.host.clone()
        };

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(config.clean_session);
        options.set_inflight(config.max_inflight);
        if let Some((username, password)) = config.credentials() {
            options.set_credentials(username, password);
        }

        match config.protocol {
            MqttProtocol::Mqtt => {}
            MqttProtocol::Mqtts => {
                let transport = match tls_configuration(&config.tls)? {
                    Some(tls) => Transport::tls_with_config(tls),
                    None => Transport::tls_with_default_config(),
                };
                options.set_transport(transport);
            }
            MqttProtocol::Ws => {
                options.set_transport(Transport::Ws);
            }
            MqttProtocol::Wss => {
                let transport = match tls_configuration(&config.tls)? {
                    Some(tls) => Transport::wss_with_config(tls),
                    None => Transport::wss_with_default_config(),
                };
                options.set_transport(transport);
            }
        }

        Ok(options)
    }

    /// Connect to the broker and subscribe to every pattern in the table.
    ///
    /// Waits for the broker's CONNACK within `connection_timeout`; any
    /// failure up to that point is returned. Afterwards the connection is
    /// kept alive by a background task that forwards arrived messages to
    /// `sink` and reconnects with exponential backoff.
    pub async fn connect(
        config: &MqttConfig,
        table: &SubscriptionTable,
        sink: mpsc::Sender<Envelope>,
    ) -> Result<Self, BusError> {
        let broker = if config.protocol.uses_websocket() {
            config.broker_url()
        } else {
            format!("{}://{}", config.protocol, config.broker_url())
        };
        let (client, mut eventloop) =
            AsyncClient::new(Self::options(config)?, REQUEST_CHANNEL_CAPACITY);
        let status = Arc::new(RwLock::new(BusStatus::Connecting));

        debug!("Connecting to MQTT broker on [{}]", broker);
        let session_present = timeout(config.connection_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| BusError::Timeout)??;
        *status.write() = BusStatus::Connected;
        info!(
            "Connected to MQTT broker on [{}] (session_present={})",
            broker, session_present
        );

        let subscriptions: Arc<Vec<(String, QoS)>> = Arc::new(
            table
                .iter()
                .map(|definition| (definition.pattern.clone(), definition.qos))
                .collect(),
        );

        let handle = tokio::spawn(run_event_loop(
            eventloop,
            EventLoopContext {
                client: client.clone(),
                subscriptions: subscriptions.clone(),
                status: status.clone(),
                sink,
                reconnect_interval: config.reconnect_interval,
                max_reconnect_interval: config.max_reconnect_interval,
            },
        ));

        let bus = Self {
            client,
            broker,
            status,
            subscriptions,
            event_loop: Mutex::new(Some(handle)),
        };

        for (pattern, qos) in bus.subscriptions.iter() {
            if let Err(e) = bus.subscribe(pattern, *qos).await {
                abort_event_loop(&bus.event_loop);
                return Err(e);
            }
        }

        Ok(bus)
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }
}

#[async_trait]
impl BusClient for MqttBus {
    fn status(&self) -> BusStatus {
        *self.status.read()
    }

    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), BusError> {
        self.client.subscribe(pattern, qos.into()).await?;
        debug!("Subscribed to '{}' (qos={})", pattern, qos);
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<(), BusError> {
        let status = self.status();
        if status != BusStatus::Connected {
            return Err(BusError::Client(format!(
                "Not connected to MQTT broker ({})",
                status
            )));
        }

        self.client
            .publish_bytes(
                envelope.topic(),
                envelope.qos().into(),
                envelope.is_retained(),
                envelope.payload().clone(),
            )
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        if self.status() == BusStatus::Connected {
            for (pattern, _) in self.subscriptions.iter() {
                if let Err(e) = self.client.unsubscribe(pattern.as_str()).await {
                    warn!("Cannot unsubscribe from '{}': {}", pattern, e);
                }
            }
        }
        self.client.disconnect().await?;

        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            if timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!("MQTT event loop did not stop in time");
            }
        }

        *self.status.write() = BusStatus::Disconnected;
        info!("Disconnected from MQTT broker on [{}]", self.broker);
        Ok(())
    }
}

/// Stop the event-loop task, if still owned
pub(super) fn abort_event_loop(slot: &Mutex<Option<JoinHandle<()>>>) {
    if let Some(handle) = slot.lock().take() {
        handle.abort();
    }
}

/// Poll until the broker acknowledges the connection.
///
/// Returns the broker's `session_present` flag.
async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<bool, BusError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                if connack.code != ConnectReturnCode::Success {
                    return Err(BusError::Rejected(format!("{:?}", connack.code)));
                }
                return Ok(connack.session_present);
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(BusError::Rejected(format!("{:?}", code)));
            }
            Err(e) => return Err(BusError::Connect(e.to_string())),
        }
    }
}

struct EventLoopContext {
    client: AsyncClient,
    subscriptions: Arc<Vec<(String, QoS)>>,
    status: Arc<RwLock<BusStatus>>,
    sink: mpsc::Sender<Envelope>,
    reconnect_interval: Duration,
    max_reconnect_interval: Duration,
}

/// Drive the connection: forward arrived messages, reconnect after errors.
async fn run_event_loop(mut eventloop: EventLoop, ctx: EventLoopContext) {
    let mut retry_interval = ctx.reconnect_interval;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("Message arrived on '{}'", publish.topic);
                // The connection keeps serving publishes without a distribution task
                let topic = publish.topic.clone();
                if ctx.sink.send(Envelope::from(publish)).await.is_err() {
                    trace!("No distribution task, message on '{}' dropped", topic);
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                *ctx.status.write() = BusStatus::Connected;
                retry_interval = ctx.reconnect_interval;
                info!(
                    "Reconnected to MQTT broker (session_present={})",
                    connack.session_present
                );
                if !connack.session_present {
                    resubscribe(&ctx.client, &ctx.subscriptions);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent, stopping MQTT event loop");
                break;
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => {
                debug!("MQTT client dropped, stopping event loop");
                break;
            }
            Err(e) => {
                warn!("Connection to MQTT broker lost: {}", e);
                *ctx.status.write() = BusStatus::Backoff;

                debug!("Reconnecting to MQTT broker in {:?}", retry_interval);
                tokio::time::sleep(retry_interval).await;
                retry_interval = std::cmp::min(retry_interval * 2, ctx.max_reconnect_interval);

                *ctx.status.write() = BusStatus::Connecting;
            }
        }
    }

    *ctx.status.write() = BusStatus::Disconnected;
}

/// Re-issue every subscription after a reconnect without a stored session.
///
/// Uses the non-blocking request path since this runs on the task that
/// drains the request channel. All filters go out as one SUBSCRIBE so the
/// request takes a single slot regardless of the table size.
fn resubscribe(client: &AsyncClient, subscriptions: &[(String, QoS)]) {
    if subscriptions.is_empty() {
        return;
    }

    let filters: Vec<SubscribeFilter> = subscriptions
        .iter()
        .map(|(pattern, qos)| SubscribeFilter::new(pattern.clone(), (*qos).into()))
        .collect();

    match client.try_subscribe_many(filters) {
        Ok(()) => debug!("Resubscribing to {} pattern(s)", subscriptions.len()),
        Err(e) => warn!("Cannot resubscribe after reconnect: {}", e),
    }
}

/// Custom TLS settings, or `None` to use the default roots
fn tls_configuration(config: &MqttTlsConfig) -> Result<Option<TlsConfiguration>, BusError> {
    let Some(ca_path) = config.ca_cert.as_deref() else {
        return Ok(None);
    };

    let ca = read_pem(ca_path)?;
    let client_auth = match (config.client_cert.as_deref(), config.client_key.as_deref()) {
        (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
        _ => None,
    };

    Ok(Some(TlsConfiguration::Simple {
        ca,
        alpn: None,
        client_auth,
    }))
}

fn read_pem(path: &str) -> Result<Vec<u8>, BusError> {
    std::fs::read(path).map_err(|e| BusError::Tls(format!("Cannot read '{}': {}", path, e)))
}
