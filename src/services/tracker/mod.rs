//! Fix ingestion and device queries
//!
//! The Tracker is the central processor that coordinates:
//! - Validation and jump rejection of incoming fixes
//! - Geofencing against the current zone snapshot
//! - Per-device fix history
//! - Egress of zone events and alerts (file and MQTT)
//!
//! It is shared behind an `Arc`; every method takes `&self`. Ingestion for a
//! device runs under that device's lock, so ingest workers and HTTP handlers
//! can call into it concurrently.

mod handlers;
#[cfg(test)]
mod tests;

pub use handlers::IngestOutcome;

use crate::domain::error::ZoneError;
use crate::domain::types::{DeviceId, Fix, ZoneId};
use crate::domain::zone::Zone;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::egress::Egress;
use crate::io::EgressSender;
use crate::services::history::History;
use crate::services::jump_detector::{self, LastFixLookup};
use crate::services::movement::{
    self, CurrentLocation, InactiveDevice, MovementStatus, MovementTimes, StateSummary,
    UnauthorizedStop, STOP_SCAN_LIMIT,
};
use crate::services::route::{
    self, RouteComparison, RouteEnd, RouteStart, RouteStats, COMPARISON_DAYS,
};
use crate::services::simplifier::{self, SimplifiedRoute, DEFAULT_TOLERANCE};
use crate::services::smoothing::{self, SmoothedPoint};
use crate::services::validator::{self, InvalidFixReport, QualityReport};
use crate::services::zone_set::ZoneSet;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Fixes looked at for route start/end detection
const ROUTE_DETECT_WINDOW: usize = 10;

/// Current view of one device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device_id: DeviceId,
    pub movement: MovementStatus,
    /// Zones with an open entry
    pub open_zones: Vec<ZoneId>,
    pub fixes_stored: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<Fix>,
}

/// Central fix processor and query surface
pub struct Tracker {
    /// Fix history and open zone entries per device
    pub(crate) history: History,
    /// Read-mostly zone definitions
    pub(crate) zones: ZoneSet,
    /// Writes zone events and alerts to file
    pub(crate) egress: Egress,
    /// Metrics collector
    pub(crate) metrics: Arc<Metrics>,
    /// MQTT egress sender (optional)
    pub(crate) egress_sender: Option<EgressSender>,
}

impl Tracker {
    pub fn new(config: &Config, metrics: Arc<Metrics>, egress_sender: Option<EgressSender>) -> Self {
        let history = History::new();
        for &device_id in config.known_devices() {
            history.register(device_id);
        }

        let zones = ZoneSet::new(config.zones().to_vec());
        info!(
            zones = %zones.len(),
            known_devices = %config.known_devices().len(),
            egress_file = %config.egress_file(),
            "tracker_initialized"
        );

        Self {
            history,
            zones,
            egress: Egress::new(config.egress_file()),
            metrics,
            egress_sender,
        }
    }

    /// Number of devices with state in memory
    pub fn device_count(&self) -> usize {
        self.history.device_count()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.history.device_ids()
    }

    // ---- zones ----

    /// Current zone set, active or not
    pub fn zones(&self) -> Arc<[Zone]> {
        self.zones.snapshot()
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// Atomically replace every zone definition
    ///
    /// Open entries are kept; a zone that disappears simply stops producing
    /// transitions.
    pub fn replace_zones(&self, zones: Vec<Zone>) -> Result<usize, ZoneError> {
        self.zones.replace(zones)
    }

    /// Active zones containing a raw point
    pub fn zones_containing(&self, lat: f64, lon: f64) -> Vec<Zone> {
        self.zones.containing(lat, lon)
    }

    /// Active zones containing the device's latest position, None without a fix
    pub fn zones_containing_device(&self, device_id: DeviceId) -> Option<Vec<Zone>> {
        let latest = self.history.last_fix(device_id)?;
        Some(self.zones.containing(latest.lat, latest.lon))
    }

    // ---- per-device queries ----

    /// Whether a position would be rejected as an impossible jump right now
    pub fn is_impossible_jump(
        &self,
        device_id: DeviceId,
        lat: f64,
        lon: f64,
        timestamp: DateTime<Utc>,
    ) -> bool {
        jump_detector::is_impossible_jump(&self.history, device_id, lat, lon, timestamp)
    }

    pub fn latest_fix(&self, device_id: DeviceId) -> Option<Fix> {
        self.history.last_fix(device_id)
    }

    /// Movement state plus open zones, None for an unknown device
    pub fn device_status(&self, device_id: DeviceId, now: DateTime<Utc>) -> Option<DeviceStatus> {
        let handle = self.history.get(device_id)?;
        let state = handle.lock();
        Some(DeviceStatus {
            device_id,
            movement: movement::movement_status(state.latest(), now),
            open_zones: state.zones.open_zones(),
            fixes_stored: state.len(),
            latest: state.latest().cloned(),
        })
    }

    pub fn movement_state(&self, device_id: DeviceId, now: DateTime<Utc>) -> MovementStatus {
        movement::movement_status(self.history.last_fix(device_id).as_ref(), now)
    }

    /// Raw fixes in `[start, end]`; with a limit, only the newest `limit`
    pub fn route_points(
        &self,
        device_id: DeviceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Vec<Fix> {
        let mut fixes = self.history.range(device_id, start, end);
        if let Some(limit) = limit {
            let skip = fixes.len().saturating_sub(limit);
            fixes.drain(..skip);
        }
        fixes
    }

    pub fn route_stats(
        &self,
        device_id: DeviceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> RouteStats {
        let fixes = self.history.range(device_id, start, end);
        route::route_stats(device_id, start, end, &fixes)
    }

    /// Route stats for `[start, end]` against the device's last 30 days
    pub fn compare_route(
        &self,
        device_id: DeviceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RouteComparison {
        let current = self.route_stats(device_id, start, end);
        let since = now
            .checked_sub_signed(Duration::days(COMPARISON_DAYS))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        route::compare_with_history(current, &self.history.range(device_id, since, now))
    }

    pub fn simplified_route(
        &self,
        device_id: DeviceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        tolerance: Option<f64>,
    ) -> SimplifiedRoute {
        let fixes = self.history.range(device_id, start, end);
        simplifier::simplify_route(&fixes, tolerance.unwrap_or(DEFAULT_TOLERANCE))
    }

    pub fn movement_times(
        &self,
        device_id: DeviceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MovementTimes {
        movement::movement_times(&self.history.range(device_id, start, end))
    }

    /// Long stops outside allowed zones among the device's newest fixes
    pub fn unauthorized_stops(&self, device_id: DeviceId, min_minutes: i64) -> Vec<UnauthorizedStop> {
        let fixes = self.history.recent(device_id, STOP_SCAN_LIMIT);
        movement::unauthorized_stops(&fixes, &self.zones.snapshot(), min_minutes)
    }

    pub fn smoothed(&self, device_id: DeviceId, window: usize) -> Vec<SmoothedPoint> {
        let fixes = self.history.recent(device_id, window.saturating_mul(2));
        smoothing::smooth(&fixes, window)
    }

    pub fn quality_report(
        &self,
        device_id: DeviceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QualityReport {
        validator::quality_report(&self.history.range(device_id, start, end), now)
    }

    /// Stored fixes in `[start, end]` that fail validation as of `now`
    pub fn invalid_fixes(
        &self,
        device_id: DeviceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> InvalidFixReport {
        validator::invalid_fixes(&self.history.range(device_id, start, end), now)
    }

    pub fn route_start(&self, device_id: DeviceId) -> Option<RouteStart> {
        route::detect_route_start(&self.history.recent(device_id, ROUTE_DETECT_WINDOW))
    }

    pub fn route_end(&self, device_id: DeviceId, stopped_minutes: i64) -> Option<RouteEnd> {
        route::detect_route_end(&self.history.recent(device_id, ROUTE_DETECT_WINDOW), stopped_minutes)
    }

    // ---- fleet queries ----

    /// Device counts per movement state
    pub fn state_summary(&self, now: DateTime<Utc>) -> StateSummary {
        let mut summary = StateSummary::default();
        for device_id in self.history.device_ids() {
            summary.record(self.movement_state(device_id, now).state);
        }
        summary
    }

    /// Known devices that have not reported recently
    pub fn inactive_devices(&self, now: DateTime<Utc>) -> Vec<InactiveDevice> {
        self.history
            .device_ids()
            .into_iter()
            .filter_map(|id| {
                let latest = self.history.last_fix(id);
                movement::inactive_device(id, latest.as_ref(), now)
            })
            .collect()
    }

    /// Newest position of every device that has reported
    pub fn current_locations(&self, now: DateTime<Utc>) -> Vec<CurrentLocation> {
        self.history
            .device_ids()
            .into_iter()
            .filter_map(|id| self.history.last_fix(id))
            .map(|latest| movement::current_location(&latest, now))
            .collect()
    }

    /// Remove fixes older than `cutoff`
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let removed = self.history.prune_older_than(cutoff);
        self.metrics.record_fixes_pruned(removed as u64);
        if removed > 0 {
            info!(removed = %removed, cutoff = %cutoff, "fixes_pruned");
        }
        removed
    }
}
