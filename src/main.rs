//! Region-match - streaming geofence engine
//!
//! Consumes device positions and region definitions over MQTT, evaluates
//! every position against the current region set and publishes ENTRY, EXIT
//! and HANGOUT events per device and region.
//!
//! Module structure:
//! - `domain/` - Core types (observations, regions, polygons, events)
//! - `io/` - External interfaces (MQTT ingest and egress, JSONL, Prometheus)
//! - `services/` - Matching logic (RegionStore, MatchEngine, Dispatcher)
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use clap::Parser;
use region_match::infra::{Config, Metrics};

/// Region-match - geofence entry, exit and dwell detection
#[derive(Parser, Debug)]
#[command(name = "region-match", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}
use region_match::io::{
    create_egress_channel, start_metrics_server, start_mqtt_client, AttributeNames, EventLog,
    Ingest, MqttPublisher,
};
use region_match::services::{Dispatcher, DispatcherSettings, EventSink, FanoutSink, LogSink, RegionStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for per-observation visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git = env!("GIT_HASH"), "region-match starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    region_match::infra::broker::start_embedded_broker(&config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        observations_topic = %config.observations_topic(),
        regions_topic = %config.regions_topic(),
        workers = %config.engine_workers(),
        queue_depth = %config.engine_queue_depth(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(RegionStore::new());
    let names = AttributeNames::from_config(config.attributes());

    // Event sinks: MQTT egress and/or JSONL file, log-only when neither is configured
    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
    let mut publisher_handle = None;

    if config.mqtt_egress_enabled() {
        let (egress_sender, egress_rx) =
            create_egress_channel(config.engine_queue_depth(), config.site_id().to_string(), names.clone());
        let egress_sender = egress_sender.with_metrics(metrics.clone());

        // Runs until every sender is gone, after the workers have drained
        let publisher = MqttPublisher::new(&config, egress_rx);
        publisher_handle = Some(tokio::spawn(publisher.run()));

        // Periodic metrics snapshots (separate from logging)
        let metrics_egress = egress_sender.clone();
        let metrics_for_egress = metrics.clone();
        let egress_interval = config.mqtt_egress_metrics_interval_secs();
        let mut egress_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(egress_interval));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        metrics_egress.send_metrics(metrics_for_egress.snapshot());
                    }
                    _ = egress_shutdown.changed() => {
                        if *egress_shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        sinks.push(Arc::new(egress_sender));
    }

    if let Some(path) = config.egress_file() {
        sinks.push(Arc::new(EventLog::new(path, names.clone())));
    }

    let sink: Arc<dyn EventSink> = if sinks.is_empty() {
        info!("no_event_egress_configured: logging events");
        Arc::new(LogSink)
    } else {
        Arc::new(FanoutSink::new(sinks))
    };

    let dispatcher = Dispatcher::spawn(
        DispatcherSettings::from_config(&config),
        store,
        sink,
        metrics.clone(),
    );

    // Input channels (bounded for backpressure)
    let (observation_tx, observation_rx) = mpsc::channel(config.engine_queue_depth());
    let (region_tx, region_rx) = mpsc::channel(config.engine_queue_depth());

    // Start MQTT client
    let ingest = Ingest::new(&config, observation_tx, region_tx, metrics.clone());
    let mqtt_config = config.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = start_mqtt_client(&mqtt_config, ingest, mqtt_shutdown).await {
            tracing::error!(error = %format!("{e:#}"), "MQTT client error");
        }
    });

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) =
                start_metrics_server(prometheus_port, prom_metrics, prom_site, prom_shutdown).await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        // First tick fires immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = signal_tx.send(true);
    });

    // Run dispatcher - returns after shutdown once every worker has drained
    let engines = dispatcher.run(observation_rx, region_rx, shutdown_rx).await;
    let devices: usize = engines.iter().map(|e| e.device_count()).sum();

    // Inputs may also have closed on their own; stop the remaining tasks
    let _ = shutdown_tx.send(true);
    // Workers hold the last event senders
    drop(engines);
    if let Some(handle) = publisher_handle {
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(published)) => info!(published = %published, "mqtt_egress_flushed"),
            Ok(Err(e)) => tracing::error!(error = %e, "mqtt_egress_task_failed"),
            Err(_) => warn!("mqtt_egress_flush_timeout"),
        }
    }

    metrics.report().log();
    info!(devices = %devices, "region-match shutdown complete");
    Ok(())
}
