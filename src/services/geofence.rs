//! Zone entry/exit state machine
//!
//! Per (device, zone) the state cycles NoOpenEntry -> OpenEntry -> NoOpenEntry.
//! Entering a zone opens an entry; being observed outside closes it and
//! yields the dwell time. Alerts depend on the zone kind:
//! - Restricted: alert on entry
//! - Allowed: alert on exit
//! - Checkpoint: never
//!
//! The caller must hold the device's lock while evaluating, and must feed
//! fixes in non-decreasing timestamp order.

use crate::domain::events::{
    new_uuid_v7, Alert, AlertKind, AlertPriority, ZoneEventKind, ZoneHistoryEvent,
};
use crate::domain::types::{whole_minutes, Fix, ZoneId};
use crate::domain::zone::{Zone, ZoneKind};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, info};

/// Speed above which a speed alert is raised (km/h)
pub const SPEED_ALERT_KMH: f64 = 80.0;

/// An entry that has not been matched by an exit yet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenEntry {
    pub entered_at: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
}

/// Open entries of one device, keyed by zone
///
/// Keying by zone makes "at most one open entry per (device, zone)" a
/// property of the map rather than of the callers.
#[derive(Debug, Default, Clone)]
pub struct DeviceZoneState {
    open: FxHashMap<ZoneId, OpenEntry>,
}

impl DeviceZoneState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_entry(&self, zone_id: ZoneId) -> Option<&OpenEntry> {
        self.open.get(&zone_id)
    }

    /// Zones the device is currently inside, sorted by id
    pub fn open_zones(&self) -> Vec<ZoneId> {
        let mut ids: Vec<_> = self.open.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

/// Events and alerts produced by one fix
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GeofenceOutcome {
    pub events: Vec<ZoneHistoryEvent>,
    pub alerts: Vec<Alert>,
}

impl GeofenceOutcome {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.alerts.is_empty()
    }
}

/// Run one fix against one zone, updating the device's open entries
pub fn evaluate_zone(
    fix: &Fix,
    zone: &Zone,
    state: &mut DeviceZoneState,
    out: &mut GeofenceOutcome,
) {
    let inside = zone.contains(fix.lat, fix.lon);

    match (inside, state.open.contains_key(&zone.id)) {
        (true, false) => {
            state.open.insert(
                zone.id,
                OpenEntry { entered_at: fix.timestamp, lat: fix.lat, lon: fix.lon },
            );

            let alert_generated = zone.kind == ZoneKind::Restricted;
            out.events.push(history_event(fix, zone, ZoneEventKind::Entry, None, alert_generated));

            info!(
                device_id = %fix.device_id,
                zone_id = %zone.id,
                zone = %zone.name,
                kind = %zone.kind.as_str(),
                "zone_entry"
            );

            if alert_generated {
                out.alerts.push(Alert::new(
                    fix.device_id,
                    AlertKind::Zone,
                    AlertPriority::High,
                    format!("Entry to restricted zone: {}", zone.name),
                    fix.timestamp,
                ));
            }
        }
        (false, true) => {
            let Some(entry) = state.open.remove(&zone.id) else {
                return;
            };
            let dwell_minutes = whole_minutes(entry.entered_at, fix.timestamp);

            let alert_generated = zone.kind == ZoneKind::Allowed;
            out.events.push(history_event(
                fix,
                zone,
                ZoneEventKind::Exit,
                Some(dwell_minutes),
                alert_generated,
            ));

            info!(
                device_id = %fix.device_id,
                zone_id = %zone.id,
                zone = %zone.name,
                kind = %zone.kind.as_str(),
                dwell_minutes = %dwell_minutes,
                "zone_exit"
            );

            if alert_generated {
                out.alerts.push(Alert::new(
                    fix.device_id,
                    AlertKind::Zone,
                    AlertPriority::Medium,
                    format!("Exit from allowed zone: {}", zone.name),
                    fix.timestamp,
                ));
            }
        }
        _ => {}
    }
}

/// Run one fix against every active zone and the speed threshold
///
/// An empty or partially loaded zone list simply produces no transitions.
pub fn evaluate_fix(fix: &Fix, zones: &[Zone], state: &mut DeviceZoneState) -> GeofenceOutcome {
    let mut out = GeofenceOutcome::default();

    for zone in zones.iter().filter(|z| z.active) {
        evaluate_zone(fix, zone, state, &mut out);
    }

    if let Some(alert) = speed_alert(fix) {
        out.alerts.push(alert);
    }

    debug!(
        device_id = %fix.device_id,
        zones = %zones.len(),
        events = %out.events.len(),
        alerts = %out.alerts.len(),
        "geofence_evaluated"
    );

    out
}

/// Speed alert when the reported speed exceeds `SPEED_ALERT_KMH`
pub fn speed_alert(fix: &Fix) -> Option<Alert> {
    let speed = fix.speed_kmh?;
    if speed <= SPEED_ALERT_KMH {
        return None;
    }

    info!(device_id = %fix.device_id, speed_kmh = %speed, "speed_alert");
    Some(Alert::new(
        fix.device_id,
        AlertKind::Speed,
        AlertPriority::Medium,
        format!("Speed limit exceeded: {speed} km/h"),
        fix.timestamp,
    ))
}

fn history_event(
    fix: &Fix,
    zone: &Zone,
    kind: ZoneEventKind,
    dwell_minutes: Option<i64>,
    alert_generated: bool,
) -> ZoneHistoryEvent {
    ZoneHistoryEvent {
        id: new_uuid_v7(),
        zone_id: zone.id,
        zone_name: zone.name.clone(),
        device_id: fix.device_id,
        kind,
        timestamp: fix.timestamp,
        lat: fix.lat,
        lon: fix.lon,
        dwell_minutes,
        alert_generated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::DeviceId;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 17, 9, 0, 0).unwrap()
    }

    fn fix_at(lat: f64, lon: f64, minutes: i64) -> Fix {
        Fix::new(DeviceId(1), lat, lon, t0() + Duration::minutes(minutes))
    }

    fn restricted() -> Zone {
        Zone::circle(10, "Warehouse", ZoneKind::Restricted, 0.0, 0.0, 1000.0)
    }

    fn allowed() -> Zone {
        Zone::circle(20, "Route A", ZoneKind::Allowed, 0.0, 0.0, 1000.0)
    }

    #[test]
    fn test_restricted_zone_scenario() {
        let zones = vec![restricted()];
        let mut state = DeviceZoneState::new();

        // Outside: nothing happens
        let out = evaluate_fix(&fix_at(0.5, 0.5, 0), &zones, &mut state);
        assert!(out.is_empty());

        // Inside: entry plus zone alert
        let out = evaluate_fix(&fix_at(0.001, 0.0, 1), &zones, &mut state);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].kind, ZoneEventKind::Entry);
        assert!(out.events[0].alert_generated);
        assert_eq!(out.alerts.len(), 1);
        assert_eq!(out.alerts[0].kind, AlertKind::Zone);
        assert_eq!(out.alerts[0].description, "Entry to restricted zone: Warehouse");
        assert_eq!(state.open_zones(), vec![ZoneId(10)]);

        // Still inside: nothing
        let out = evaluate_fix(&fix_at(0.002, 0.0, 5), &zones, &mut state);
        assert!(out.is_empty());

        // Outside 10 minutes after the entry: exit with dwell, no alert
        let out = evaluate_fix(&fix_at(0.5, 0.5, 11), &zones, &mut state);
        assert_eq!(out.events.len(), 1);
        let exit = &out.events[0];
        assert_eq!(exit.kind, ZoneEventKind::Exit);
        assert_eq!(exit.dwell_minutes, Some(10));
        assert!(!exit.alert_generated);
        assert!(out.alerts.is_empty());
        assert_eq!(state.open_count(), 0);
    }

    #[test]
    fn test_allowed_zone_alerts_on_exit() {
        let zones = vec![allowed()];
        let mut state = DeviceZoneState::new();

        let out = evaluate_fix(&fix_at(0.0, 0.0, 0), &zones, &mut state);
        assert_eq!(out.events.len(), 1);
        assert!(!out.events[0].alert_generated);
        assert!(out.alerts.is_empty());

        let out = evaluate_fix(&fix_at(1.0, 1.0, 45), &zones, &mut state);
        assert_eq!(out.events[0].dwell_minutes, Some(45));
        assert!(out.events[0].alert_generated);
        assert_eq!(out.alerts.len(), 1);
        assert_eq!(out.alerts[0].description, "Exit from allowed zone: Route A");
        assert_eq!(out.alerts[0].priority, AlertPriority::Medium);
    }

    #[test]
    fn test_checkpoint_never_alerts() {
        let zones = vec![Zone::circle(30, "Gate", ZoneKind::Checkpoint, 0.0, 0.0, 500.0)];
        let mut state = DeviceZoneState::new();
        let entry = evaluate_fix(&fix_at(0.0, 0.0, 0), &zones, &mut state);
        let exit = evaluate_fix(&fix_at(1.0, 1.0, 3), &zones, &mut state);
        assert_eq!(entry.events.len() + exit.events.len(), 2);
        assert!(entry.alerts.is_empty() && exit.alerts.is_empty());
    }

    #[test]
    fn test_exit_without_entry_is_noop() {
        let zones = vec![allowed()];
        let mut state = DeviceZoneState::new();
        let out = evaluate_fix(&fix_at(5.0, 5.0, 0), &zones, &mut state);
        assert!(out.is_empty());
    }

    #[test]
    fn test_overlapping_zones_tracked_independently() {
        let zones = vec![
            restricted(),
            Zone::circle(11, "Yard", ZoneKind::Checkpoint, 0.0, 0.0, 100_000.0),
        ];
        let mut state = DeviceZoneState::new();

        let out = evaluate_fix(&fix_at(0.0, 0.0, 0), &zones, &mut state);
        assert_eq!(out.events.len(), 2);

        // Leave the small zone only
        let out = evaluate_fix(&fix_at(0.1, 0.0, 2), &zones, &mut state);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].zone_id, ZoneId(10));
        assert_eq!(state.open_zones(), vec![ZoneId(11)]);
    }

    #[test]
    fn test_inactive_and_malformed_zones_never_enter() {
        let zones = vec![
            restricted().inactive(),
            Zone::polygon(12, "broken", ZoneKind::Restricted, vec![[0.0, 0.0], [1.0, 1.0]]),
        ];
        let mut state = DeviceZoneState::new();
        let out = evaluate_fix(&fix_at(0.0, 0.0, 0), &zones, &mut state);
        assert!(out.is_empty());
        assert_eq!(state.open_count(), 0);
    }

    #[test]
    fn test_speed_alert() {
        let mut state = DeviceZoneState::new();
        let out = evaluate_fix(&fix_at(0.0, 0.0, 0).with_speed(95.0), &[], &mut state);
        assert!(out.events.is_empty());
        assert_eq!(out.alerts.len(), 1);
        assert_eq!(out.alerts[0].kind, AlertKind::Speed);

        assert!(speed_alert(&fix_at(0.0, 0.0, 0).with_speed(80.0)).is_none());
        assert!(speed_alert(&fix_at(0.0, 0.0, 0)).is_none());
    }
}
