//! MQTT publisher for egress events
//!
//! Publishes tracking output to MQTT topics for downstream consumers:
//! - geotrack/fixes - Accepted fixes for live maps (QoS 0)
//! - geotrack/events - Zone entry/exit history events (QoS 1)
//! - geotrack/alerts - Zone and speed alerts (QoS 1)
//! - geotrack/metrics - Periodic metrics snapshots (QoS 0)

use crate::infra::config::Config;
use crate::io::egress_channel::EgressMessage;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// MQTT publisher actor
///
/// Receives messages from the egress channel and publishes to MQTT topics.
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<EgressMessage>,
    fixes_topic: String,
    events_topic: String,
    alerts_topic: String,
    metrics_topic: String,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    ///
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, rx: mpsc::Receiver<EgressMessage>) -> Self {
        let client_id = format!("geotrack-egress-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            client,
            rx,
            fixes_topic: config.mqtt_egress_fixes_topic().to_string(),
            events_topic: config.mqtt_egress_events_topic().to_string(),
            alerts_topic: config.mqtt_egress_alerts_topic().to_string(),
            metrics_topic: config.mqtt_egress_metrics_topic().to_string(),
        }
    }

    /// Run the publisher loop until shutdown, then drain what is queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            fixes = %self.fixes_topic,
            events = %self.events_topic,
            alerts = %self.alerts_topic,
            metrics = %self.metrics_topic,
            "mqtt_egress_started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("mqtt_egress_shutdown");
                        while let Ok(msg) = self.rx.try_recv() {
                            self.publish_message(msg).await;
                        }
                        return;
                    }
                }
                Some(msg) = self.rx.recv() => {
                    self.publish_message(msg).await;
                }
            }
        }
    }

    async fn publish_message(&self, msg: EgressMessage) {
        match msg {
            EgressMessage::Fix(payload) => {
                self.publish(&self.fixes_topic, QoS::AtMostOnce, &payload).await;
            }
            // History events and alerts must not be lost: at-least-once
            EgressMessage::ZoneEvent(payload) => {
                self.publish(&self.events_topic, QoS::AtLeastOnce, &payload).await;
            }
            EgressMessage::Alert(payload) => {
                self.publish(&self.alerts_topic, QoS::AtLeastOnce, &payload).await;
            }
            EgressMessage::Metrics(payload) => {
                self.publish(&self.metrics_topic, QoS::AtMostOnce, &payload).await;
            }
        }
    }

    async fn publish<T: Serialize>(&self, topic: &str, qos: QoS, payload: &T) {
        let json = match serde_json::to_vec(payload) {
            Ok(json) => json,
            Err(e) => {
                error!(topic = %topic, error = %e, "mqtt_egress_serialize_failed");
                return;
            }
        };

        if let Err(e) = self.client.publish(topic, qos, false, json).await {
            match qos {
                QoS::AtMostOnce => debug!(topic = %topic, error = %e, "mqtt_egress_publish_failed"),
                _ => error!(topic = %topic, error = %e, "mqtt_egress_publish_failed"),
            }
        }
    }
}
