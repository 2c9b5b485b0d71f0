//! Typed channel for MQTT egress messages
//!
//! Provides a non-blocking way to send events to the MQTT publisher.
//! Uses bounded mpsc channels to prevent unbounded memory growth.

use crate::domain::events::{Alert, ZoneHistoryEvent};
use crate::domain::types::Fix;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_NUM_BUCKETS};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messages that can be sent to the MQTT publisher
#[derive(Debug)]
pub enum EgressMessage {
    /// Accepted fix for live display
    Fix(SitePayload<Fix>),
    /// Zone entry or exit
    ZoneEvent(SitePayload<ZoneHistoryEvent>),
    /// Alert raised by geofencing or speed
    Alert(SitePayload<Alert>),
    /// Periodic metrics snapshot
    Metrics(MetricsPayload),
}

/// A record tagged with the site it came from
#[derive(Debug, Clone, Serialize)]
pub struct SitePayload<T> {
    pub site: String,
    #[serde(flatten)]
    pub body: T,
}

/// Payload for metrics snapshot
#[derive(Debug, Serialize)]
pub struct MetricsPayload {
    pub site: String,
    /// Timestamp (epoch ms)
    pub ts: i64,
    pub fixes_total: u64,
    pub fixes_per_sec: f64,
    /// Average ingest latency (microseconds)
    pub avg_latency_us: u64,
    /// Max ingest latency (microseconds)
    pub max_latency_us: u64,
    /// Ingest latency histogram buckets (Prometheus-style exponential)
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub rejected_invalid: u64,
    pub rejected_out_of_order: u64,
    pub rejected_jump: u64,
    pub zone_entries: u64,
    pub zone_exits: u64,
    pub alerts_zone: u64,
    pub alerts_speed: u64,
    pub fixes_dropped: u64,
    pub fix_queue_depth: u64,
    pub devices: usize,
    pub zones: usize,
}

impl MetricsPayload {
    pub fn from_summary(summary: MetricsSummary, site: String) -> Self {
        Self {
            site,
            ts: Utc::now().timestamp_millis(),
            fixes_total: summary.fixes_total,
            fixes_per_sec: summary.fixes_per_sec,
            avg_latency_us: summary.avg_ingest_latency_us,
            max_latency_us: summary.max_ingest_latency_us,
            lat_buckets: summary.lat_buckets,
            lat_p50_us: summary.lat_p50_us,
            lat_p95_us: summary.lat_p95_us,
            lat_p99_us: summary.lat_p99_us,
            rejected_invalid: summary.rejected_invalid,
            rejected_out_of_order: summary.rejected_out_of_order,
            rejected_jump: summary.rejected_jump,
            zone_entries: summary.zone_entries_total,
            zone_exits: summary.zone_exits_total,
            alerts_zone: summary.alerts_zone_total,
            alerts_speed: summary.alerts_speed_total,
            fixes_dropped: summary.fixes_dropped,
            fix_queue_depth: summary.fix_queue_depth,
            devices: summary.devices,
            zones: summary.zones,
        }
    }
}

/// Sender handle for egress messages
///
/// Clone this to share across multiple producers.
/// Non-blocking - if the channel is full, messages are dropped and counted.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    site_id: String,
    metrics: Option<Arc<Metrics>>,
}

impl EgressSender {
    pub fn new(tx: mpsc::Sender<EgressMessage>, site_id: String) -> Self {
        Self { tx, site_id, metrics: None }
    }

    /// Count dropped messages in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn wrap<T>(&self, body: T) -> SitePayload<T> {
        SitePayload { site: self.site_id.clone(), body }
    }

    fn send(&self, msg: EgressMessage) {
        // Use try_send to avoid blocking - drop if channel full
        if self.tx.try_send(msg).is_err() {
            if let Some(ref metrics) = self.metrics {
                metrics.record_mqtt_event_dropped();
            }
        }
    }

    /// Send an accepted fix for live display
    pub fn send_fix(&self, fix: &Fix) {
        self.send(EgressMessage::Fix(self.wrap(fix.clone())));
    }

    pub fn send_zone_event(&self, event: &ZoneHistoryEvent) {
        self.send(EgressMessage::ZoneEvent(self.wrap(event.clone())));
    }

    pub fn send_alert(&self, alert: &Alert) {
        self.send(EgressMessage::Alert(self.wrap(alert.clone())));
    }

    /// Send a metrics snapshot
    pub fn send_metrics(&self, summary: MetricsSummary) {
        let payload = MetricsPayload::from_summary(summary, self.site_id.clone());
        self.send(EgressMessage::Metrics(payload));
    }
}

/// Create a new egress channel pair
///
/// Returns (sender, receiver) where sender can be cloned and shared.
/// Buffer size determines how many messages can be queued.
/// site_id is included in every payload for downstream consumers.
pub fn create_egress_channel(
    buffer_size: usize,
    site_id: String,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, site_id), rx)
}
