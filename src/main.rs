//! Prometheus exporter for zigbee2mqtt power meter telemetry.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use zigbee2mqtt_exporter_prometheus::{
    ExporterConfig, HttpServer, MessageProcessor, MetricRegistry, MqttSubscriber,
};

/// Prometheus exporter for zigbee2mqtt power meter telemetry.
#[derive(Parser, Debug)]
#[command(name = "zigbee2mqtt-exporter-prometheus")]
#[command(about = "Export zigbee2mqtt power meter readings as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)?
    } else {
        ExporterConfig::default()
    };

    // Override listen address from CLI
    if let Some(listen) = args.listen {
        config.prometheus.listen = listen;
    }

    // Initialize logging
    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("zigbee2mqtt_exporter_prometheus={}", log_level).parse()?)
        .add_directive(format!("rumqttc={}", Level::WARN).parse()?);

    match config.logging.format {
        zigbee2mqtt_exporter_prometheus::config::LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
        zigbee2mqtt_exporter_prometheus::config::LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }

    info!("Starting zigbee2mqtt Prometheus exporter");

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create the shared registry
    let registry = Arc::new(MetricRegistry::new());

    // Parse listen address
    let listen_addr = config
        .prometheus
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    // Create components
    let subscriber = MqttSubscriber::new(
        MessageProcessor::new(registry.clone()),
        config.mqtt.clone(),
    );
    let http_server = HttpServer::new(
        registry.clone(),
        listen_addr,
        config.prometheus.path.clone(),
    );

    // Start subscriber
    let subscriber_shutdown = shutdown_rx.clone();
    let subscriber_task = tokio::spawn(async move {
        if let Err(e) = subscriber.run(subscriber_shutdown).await {
            error!("Subscriber error: {}", e);
        }
    });

    // Start HTTP server
    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate()
                ).expect("failed to install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    // Signal shutdown
    shutdown_tx.send(true)?;

    // Wait for tasks to complete
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = subscriber_task.await;
        let _ = http_task.await;
    })
    .await;

    // Print final stats
    let stats = registry.stats();
    info!(
        readings_applied = stats.readings_applied,
        unknown_topics = stats.unknown_topics,
        undecodable_payloads = stats.undecodable_payloads,
        device_count = registry.device_count(),
        "Final statistics"
    );

    info!("Exporter stopped");
    Ok(())
}
