//! Fix ingestion for the Tracker
//!
//! A fix passes validation, ordering and jump checks under the device lock,
//! is run through geofencing, and lands in history. Side effects (file
//! egress, MQTT, metrics) happen after the lock is released.
//!
//! Egress order is per call, not per device: two callers ingesting the same
//! device can publish in the opposite order to the one their fixes were
//! applied in. Consumers that need history order sort by fix timestamp or
//! event id (UUIDv7).

use super::Tracker;
use crate::domain::error::IngestError;
use crate::domain::events::{Alert, ZoneEventKind, ZoneHistoryEvent};
use crate::domain::types::Fix;
use crate::services::geofence;
use crate::services::jump_detector::implied_speed_kmh;
use crate::services::validator::{self, MAX_REALISTIC_SPEED_KMH};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What an accepted fix produced
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub fix: Fix,
    pub events: Vec<ZoneHistoryEvent>,
    pub alerts: Vec<Alert>,
}

impl Tracker {
    /// Ingest one fix as of `now`
    ///
    /// Rejected fixes leave history and zone state untouched.
    pub fn ingest(&self, fix: Fix, now: DateTime<Utc>) -> Result<IngestOutcome, IngestError> {
        let started = Instant::now();
        let device_id = fix.device_id;

        match self.apply_fix(fix, now) {
            Ok(outcome) => {
                // Lock already released; may interleave with another caller
                self.publish(&outcome);
                let latency_us = started.elapsed().as_micros() as u64;
                self.metrics.record_fix_accepted(latency_us);
                debug!(
                    device_id = %device_id,
                    events = %outcome.events.len(),
                    alerts = %outcome.alerts.len(),
                    latency_us = %latency_us,
                    "fix_accepted"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.metrics.record_fix_rejected(&e);
                warn!(device_id = %device_id, reason = %e.code(), error = %e, "fix_rejected");
                Err(e)
            }
        }
    }

    /// Checks and state changes, all under the device lock
    fn apply_fix(&self, fix: Fix, now: DateTime<Utc>) -> Result<IngestOutcome, IngestError> {
        validator::validate(&fix, now).into_result().map_err(IngestError::Invalid)?;

        let handle = self.history.device(fix.device_id);
        let mut state = handle.lock();

        if let Some(latest) = state.latest() {
            if fix.timestamp < latest.timestamp {
                return Err(IngestError::OutOfOrder {
                    device_id: fix.device_id,
                    timestamp: fix.timestamp,
                    latest: latest.timestamp,
                });
            }
            if let Some(speed) = implied_speed_kmh(latest, fix.lat, fix.lon, fix.timestamp) {
                if speed > MAX_REALISTIC_SPEED_KMH {
                    return Err(IngestError::ImpossibleJump {
                        device_id: fix.device_id,
                        implied_speed_kmh: speed,
                    });
                }
            }
        }

        let zones = self.zones.snapshot();
        let result = geofence::evaluate_fix(&fix, &zones, &mut state.zones);
        state.push(fix.clone());

        Ok(IngestOutcome { fix, events: result.events, alerts: result.alerts })
    }

    /// Egress and metrics for an accepted fix
    fn publish(&self, outcome: &IngestOutcome) {
        for event in &outcome.events {
            match event.kind {
                ZoneEventKind::Entry => self.metrics.record_zone_entry(),
                ZoneEventKind::Exit => self.metrics.record_zone_exit(),
            }
        }
        for alert in &outcome.alerts {
            self.metrics.record_alert(alert.kind);
            info!(
                device_id = %alert.device_id,
                kind = %alert.kind.as_str(),
                description = %alert.description,
                "alert_raised"
            );
        }

        if !outcome.events.is_empty() || !outcome.alerts.is_empty() {
            self.egress.write_all(&outcome.events, &outcome.alerts);
        }

        if let Some(ref sender) = self.egress_sender {
            sender.send_fix(&outcome.fix);
            for event in &outcome.events {
                sender.send_zone_event(event);
            }
            for alert in &outcome.alerts {
                sender.send_alert(alert);
            }
        }
    }
}
