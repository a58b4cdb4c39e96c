//! mqtt-http-bridge - Bridge between an MQTT broker and HTTP
//!
//! Usage:
//!   mqtt-http-bridge [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mqtt_http_bridge::bus::{BusClient, MqttBus};
use mqtt_http_bridge::config::Config;
use mqtt_http_bridge::distribution::{run_distribution, DistributionEngine};
use mqtt_http_bridge::http::HttpServer;
use mqtt_http_bridge::metrics::Metrics;
use mqtt_http_bridge::webhook::{UrlTemplate, WebhookDispatcher};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::default(),
        }
    }
}

/// Bridge between an MQTT broker and HTTP
#[derive(Parser, Debug)]
#[command(name = "mqtt-http-bridge")]
#[command(version)]
#[command(about = "REST publishing to MQTT and webhook notifications from MQTT")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Without a file, defaults plus BRIDGE__* overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    if config.web.uses_default_token() {
        warn!("Using default security token, please change it in configuration property [web.token].");
    }

    let table = Arc::new(config.subscriptions()?);
    let template = UrlTemplate::from_config(&config.webhook, &table)?;

    info!("Starting MQTT HTTP bridge");
    info!("  HTTP front door: {}", config.web.bind);
    info!("  MQTT broker: {}", config.mqtt.broker_url());
    if config.mqtt.protocol.uses_tls() && config.mqtt.tls.is_custom() {
        info!("  MQTT TLS: custom certificates");
    }
    info!("  Subscriptions: {}", table.len());
    for definition in table.iter() {
        info!(
            "    - {} -> {} (qos={}, format={})",
            definition.name, definition.pattern, definition.qos, definition.format
        );
    }
    if let Some(template) = &template {
        info!("  Webhook: {}", template.as_str());
    }

    let metrics = Arc::new(Metrics::new());

    let (tx, rx) = mpsc::channel(config.mqtt.channel_capacity);
    let bus = match MqttBus::connect(&config.mqtt, &table, tx).await {
        Ok(bus) => Arc::new(bus),
        Err(e) => {
            error!("Cannot connect to MQTT broker [{}]: {}", config.mqtt.broker_url(), e);
            std::process::exit(1);
        }
    };

    if let Some(template) = template {
        let dispatcher = WebhookDispatcher::with_default_client(template, metrics.clone());
        let engine = DistributionEngine::new(table.clone(), dispatcher, metrics.clone());
        tokio::spawn(run_distribution(engine, rx));
    } else {
        drop(rx);
    }

    let server = HttpServer::new(
        &config.web,
        bus.clone(),
        metrics.clone(),
        config.mqtt.default_qos(),
    );

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("HTTP front door error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    if let Err(e) = bus.disconnect().await {
        warn!("Error while disconnecting from MQTT broker: {}", e);
    }

    info!("Bridge stopped");
    Ok(())
}
