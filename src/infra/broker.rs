//! Embedded MQTT broker using rumqttd
//!
//! For single-box deployments where no site broker exists; the egress
//! publisher then connects to localhost.

use crate::infra::config::Config as AppConfig;
use anyhow::Context;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Router and v4 listener settings for `listen`
fn broker_config(listen: SocketAddr) -> Config {
    let router = RouterConfig {
        max_segment_size: 16 * 1024 * 1024,
        max_segment_count: 10,
        max_connections: 1024,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: 262144,
                max_inflight_count: 200,
                auth: None,
                dynamic_filters: false,
                external_auth: None,
            },
        },
    );

    Config {
        id: 0,
        router,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}

/// Start the embedded broker on its own thread if enabled
pub fn start_embedded_broker(app_config: &AppConfig) -> anyhow::Result<()> {
    if !app_config.broker_enabled() {
        info!("broker_disabled");
        return Ok(());
    }

    let addr = format!("{}:{}", app_config.broker_bind_address(), app_config.broker_port());
    let listen: SocketAddr =
        addr.parse().with_context(|| format!("invalid broker bind address {addr}"))?;
    let config = broker_config(listen);

    thread::Builder::new()
        .name("mqtt-broker".to_string())
        .spawn(move || {
            let mut broker = Broker::new(config);
            // start() blocks for the life of the broker
            if let Err(e) = broker.start() {
                warn!(error = %e, "broker_start_failed");
            }
        })
        .context("spawning broker thread")?;

    // Give the listener a moment before clients connect
    thread::sleep(Duration::from_millis(100));
    info!(addr = %listen, "broker_started");
    Ok(())
}
