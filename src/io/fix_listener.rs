//! TCP listener for tracker fixes
//!
//! Devices (or a gateway in front of them) connect and send one JSON fix per
//! line:
//! `{"device_id":7,"lat":19.43,"lon":-99.13,"speed_kmh":42.0,"timestamp":"2025-11-17T09:00:00Z"}`
//! `timestamp` may also be epoch milliseconds. Parsed fixes go to the ingest
//! workers via try_dispatch; full queues drop and count.

use crate::domain::types::Fix;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::ingest_worker::{DispatchError, FixDispatcher};
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Fix listener configuration
#[derive(Debug, Clone)]
pub struct FixListenerConfig {
    pub bind_address: String,
    pub port: u16,
    pub enabled: bool,
}

impl Default for FixListenerConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), port: 5055, enabled: true }
    }
}

impl From<&Config> for FixListenerConfig {
    fn from(config: &Config) -> Self {
        Self {
            bind_address: config.listener_bind_address().to_string(),
            port: config.listener_port(),
            enabled: config.listener_enabled(),
        }
    }
}

/// Bind and run the fix listener until shutdown
pub async fn start_fix_listener(
    config: FixListenerConfig,
    dispatcher: FixDispatcher,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if !config.enabled {
        info!("fix_listener_disabled");
        return Ok(());
    }

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener =
        TcpListener::bind(&addr).await.with_context(|| format!("binding fix listener on {addr}"))?;

    info!(addr = %addr, "fix_listener_started");
    serve(listener, dispatcher, metrics, shutdown).await;
    Ok(())
}

/// Accept connections on an already bound listener
pub async fn serve(
    listener: TcpListener,
    dispatcher: FixDispatcher,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("fix_listener_shutdown");
                    return;
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let dispatcher = dispatcher.clone();
                        let m = metrics.clone();
                        tokio::spawn(async move {
                            handle_connection(socket, addr, dispatcher, m).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "fix_listener_accept_failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    dispatcher: FixDispatcher,
    metrics: Arc<Metrics>,
) {
    let peer = addr.to_string();
    debug!(peer = %peer, "fix_connection_accepted");

    let reader = BufReader::new(socket);
    let mut lines = reader.lines();

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);
    let mut received = 0u64;

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fix = match Fix::from_json(line) {
            Ok(fix) => fix,
            Err(e) => {
                metrics.record_parse_error();
                warn!(peer = %peer, error = %e, "fix_parse_failed");
                continue;
            }
        };
        received += 1;

        match dispatcher.try_dispatch(fix) {
            Ok(()) => {}
            Err(DispatchError::Full) => {
                if last_drop_warn.elapsed() > Duration::from_secs(1) {
                    warn!(peer = %peer, "fix_dropped: queue full");
                    last_drop_warn = Instant::now();
                }
            }
            Err(DispatchError::Closed) => {
                warn!(peer = %peer, "fix_queue_closed");
                break;
            }
        }
    }

    debug!(peer = %peer, fixes = %received, "fix_connection_closed");
}
