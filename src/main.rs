//! geotrack - GPS fix ingestion and geofencing daemon
//!
//! Accepts fixes over TCP (JSON lines) and HTTP, validates them, tracks
//! zone entries and exits per device, and publishes events and alerts to a
//! JSONL file and MQTT.
//!
//! Module structure:
//! - `domain/` - Core types (Fix, Zone, events, errors, geo math)
//! - `services/` - Business logic (Tracker, geofence, history, routes)
//! - `io/` - External interfaces (TCP listener, HTTP, egress)
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use anyhow::Context;
use chrono::{Duration as ChronoDuration, Utc};
use clap::Parser;
use geotrack::infra::{Config, Metrics};
use geotrack::io::{
    create_egress_channel, start_fix_listener, start_http_server, ApiState, FixListenerConfig,
    MqttPublisher,
};
use geotrack::services::{create_ingest_workers, Tracker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// geotrack - GPS geofencing and route analytics service
#[derive(Parser, Debug)]
#[command(name = "geotrack", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

/// How long to wait for workers to drain their queues on shutdown
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides; default INFO
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git = %env!("GIT_HASH"), "geotrack_starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    geotrack::infra::broker::start_embedded_broker(&config).context("starting embedded broker")?;

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        listener_port = %config.listener_port(),
        http_port = %config.http_port(),
        workers = %config.ingest_workers(),
        queue_size = %config.ingest_queue_size(),
        zones = %config.zones().len(),
        known_devices = %config.known_devices().len(),
        retention_days = %config.retention_days(),
        mqtt_egress = %config.mqtt_egress_enabled(),
        "config_loaded"
    );

    // Inputs stop first; egress stops after the workers have drained
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (egress_shutdown_tx, egress_shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());

    let mut publisher_handle = None;
    let egress_sender = if config.mqtt_egress_enabled() {
        let (egress_sender, egress_rx) = create_egress_channel(1000, config.site_id().to_string());
        let publisher = MqttPublisher::new(&config, egress_rx);
        publisher_handle = Some(tokio::spawn(publisher.run(egress_shutdown_rx)));
        Some(egress_sender.with_metrics(metrics.clone()))
    } else {
        None
    };

    let tracker = Arc::new(Tracker::new(&config, metrics.clone(), egress_sender.clone()));

    let (dispatcher, workers) = create_ingest_workers(
        tracker.clone(),
        metrics.clone(),
        config.ingest_workers(),
        config.ingest_queue_size(),
    );
    let worker_handles: Vec<_> = workers.into_iter().map(|w| tokio::spawn(w.run())).collect();

    // TCP fix listener
    let listener_config = FixListenerConfig::from(&config);
    let listener_dispatcher = dispatcher.clone();
    let listener_metrics = metrics.clone();
    let listener_shutdown = shutdown_rx.clone();
    let listener_handle = tokio::spawn(async move {
        if let Err(e) = start_fix_listener(
            listener_config,
            listener_dispatcher,
            listener_metrics,
            listener_shutdown,
        )
        .await
        {
            error!(error = %e, "fix_listener_error");
        }
    });

    // HTTP API
    let api_state = Arc::new(ApiState {
        tracker: tracker.clone(),
        metrics: metrics.clone(),
        site_id: config.site_id().to_string(),
    });
    let http_bind = config.http_bind_address().to_string();
    let http_port = config.http_port();
    let http_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = start_http_server(&http_bind, http_port, api_state, http_shutdown).await {
            error!(error = %e, "http_server_error");
        }
    });

    // Periodic metrics log
    let reporter_metrics = metrics.clone();
    let reporter_tracker = tracker.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            let summary = reporter_metrics
                .report(reporter_tracker.device_count(), reporter_tracker.zone_count());
            summary.log();
        }
    });

    // Metrics snapshots to MQTT
    if let Some(sender) = egress_sender {
        let egress_metrics = metrics.clone();
        let egress_tracker = tracker.clone();
        let egress_interval = config.mqtt_egress_metrics_interval_secs().max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(egress_interval));
            loop {
                interval.tick().await;
                let summary =
                    egress_metrics.report(egress_tracker.device_count(), egress_tracker.zone_count());
                sender.send_metrics(summary);
            }
        });
    }

    // Retention
    let retention_days = config.retention_days();
    if retention_days > 0 {
        let retention_tracker = tracker.clone();
        let retention_interval = config.retention_interval_secs().max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(retention_interval));
            loop {
                interval.tick().await;
                let cutoff = Utc::now() - ChronoDuration::days(i64::from(retention_days));
                retention_tracker.prune_older_than(cutoff);
            }
        });
    } else {
        info!("retention_disabled");
    }

    info!("geotrack_started");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    // Workers stop once every dispatcher clone is gone
    let _ = listener_handle.await;
    drop(dispatcher);
    for handle in worker_handles {
        if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, handle).await.is_err() {
            warn!("ingest_worker_drain_timeout");
        }
    }

    let _ = egress_shutdown_tx.send(true);
    if let Some(handle) = publisher_handle {
        let _ = handle.await;
    }

    info!(fixes_total = %metrics.fixes_total(), "geotrack_shutdown_complete");
    Ok(())
}
