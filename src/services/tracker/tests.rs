//! Tests for the Tracker module

use super::*;
use crate::domain::error::IngestError;
use crate::domain::events::{AlertKind, AlertPriority, ZoneEventKind};
use crate::domain::zone::ZoneKind;
use crate::io::egress_channel::{create_egress_channel, EgressMessage};
use crate::services::movement::MovementState;
use chrono::{Duration, TimeZone};
use std::fs;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Test harness that keeps the egress directory and channel receiver alive
struct TestTracker {
    tracker: Tracker,
    dir: TempDir,
    #[allow(dead_code)]
    egress_rx: Option<mpsc::Receiver<EgressMessage>>,
}

impl std::ops::Deref for TestTracker {
    type Target = Tracker;
    fn deref(&self) -> &Self::Target {
        &self.tracker
    }
}

impl TestTracker {
    fn egress_lines(&self) -> Vec<serde_json::Value> {
        let path = self.dir.path().join("events.jsonl");
        let Ok(content) = fs::read_to_string(path) else {
            return Vec::new();
        };
        content.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    fn drain_egress(&mut self) -> Vec<EgressMessage> {
        let mut out = Vec::new();
        if let Some(rx) = self.egress_rx.as_mut() {
            while let Ok(msg) = rx.try_recv() {
                out.push(msg);
            }
        }
        out
    }
}

fn create_test_tracker(zones: Vec<Zone>) -> TestTracker {
    create_test_tracker_with(zones, &[], false)
}

fn create_test_tracker_with(zones: Vec<Zone>, known: &[i64], with_mqtt: bool) -> TestTracker {
    let dir = tempfile::tempdir().unwrap();
    let egress_file = dir.path().join("events.jsonl");
    let config = Config::default()
        .with_egress_file(egress_file.to_str().unwrap())
        .with_zones(zones)
        .with_known_devices(known);
    let metrics = Arc::new(Metrics::new());

    let (sender, rx) = if with_mqtt {
        let (sender, rx) = create_egress_channel(64, "test".to_string());
        (Some(sender.with_metrics(metrics.clone())), Some(rx))
    } else {
        (None, None)
    };

    let tracker = Tracker::new(&config, metrics, sender);
    TestTracker { tracker, dir, egress_rx: rx }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 17, 9, 0, 0).unwrap()
}

fn at(minutes: i64) -> DateTime<Utc> {
    t0() + Duration::minutes(minutes)
}

/// A "now" comfortably after every fix in these tests
fn later() -> DateTime<Utc> {
    at(24 * 60)
}

fn fix(device: i64, lat: f64, lon: f64, minutes: i64) -> Fix {
    Fix::new(DeviceId(device), lat, lon, at(minutes))
}

fn warehouse() -> Zone {
    Zone::circle(10, "Warehouse", ZoneKind::Restricted, 0.0, 0.0, 1000.0)
}

fn depot() -> Zone {
    Zone::circle(20, "Depot", ZoneKind::Allowed, 0.0, 0.0, 1000.0)
}

#[test]
fn test_restricted_entry_and_exit() {
    let tracker = create_test_tracker(vec![warehouse()]);

    let out = tracker.ingest(fix(1, 0.02, 0.0, 0), later()).unwrap();
    assert!(out.events.is_empty());

    let out = tracker.ingest(fix(1, 0.001, 0.0, 5), later()).unwrap();
    assert_eq!(out.events.len(), 1);
    assert_eq!(out.events[0].kind, ZoneEventKind::Entry);
    assert_eq!(out.alerts.len(), 1);
    assert_eq!(out.alerts[0].priority, AlertPriority::High);

    let out = tracker.ingest(fix(1, 0.02, 0.0, 15), later()).unwrap();
    assert_eq!(out.events.len(), 1);
    assert_eq!(out.events[0].kind, ZoneEventKind::Exit);
    assert_eq!(out.events[0].dwell_minutes, Some(10));
    assert!(out.alerts.is_empty());

    let lines = tracker.egress_lines();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["record"], "zone_event");
    assert_eq!(lines[0]["kind"], "entry");
    assert_eq!(lines[1]["record"], "alert");
    assert_eq!(lines[2]["kind"], "exit");

    let summary = tracker.metrics.report(tracker.device_count(), tracker.zone_count());
    assert_eq!(summary.fixes_total, 3);
    assert_eq!(summary.zone_entries_total, 1);
    assert_eq!(summary.zone_exits_total, 1);
    assert_eq!(summary.alerts_zone_total, 1);
}

#[test]
fn test_invalid_fix_leaves_no_trace() {
    let tracker = create_test_tracker(vec![warehouse()]);

    let err = tracker.ingest(fix(1, 95.0, 0.0, 0), later()).unwrap_err();
    assert!(matches!(err, IngestError::Invalid(_)));
    assert_eq!(tracker.device_count(), 0);
    assert!(tracker.egress_lines().is_empty());

    // Future timestamp
    let err = tracker.ingest(fix(1, 0.0, 0.0, 10), at(5)).unwrap_err();
    assert_eq!(err.code(), "invalid");
    assert_eq!(tracker.metrics.rejected_total(), 2);
}

#[test]
fn test_out_of_order_rejected_equal_accepted() {
    let tracker = create_test_tracker(vec![]);

    tracker.ingest(fix(1, 0.0, 0.0, 10), later()).unwrap();
    let err = tracker.ingest(fix(1, 0.0, 0.0, 5), later()).unwrap_err();
    assert!(matches!(err, IngestError::OutOfOrder { .. }));

    // Same timestamp, same position
    tracker.ingest(fix(1, 0.0, 0.0, 10), later()).unwrap();
    assert_eq!(tracker.route_points(DeviceId(1), at(0), at(60), None).len(), 2);
}

#[test]
fn test_impossible_jump_rejected() {
    let tracker = create_test_tracker(vec![]);

    tracker.ingest(fix(1, 0.0, 0.0, 0), later()).unwrap();
    assert!(tracker.is_impossible_jump(DeviceId(1), 1.0, 0.0, at(1)));
    assert!(!tracker.is_impossible_jump(DeviceId(2), 1.0, 0.0, at(1)));

    // ~111 km in one minute
    let err = tracker.ingest(fix(1, 1.0, 0.0, 1), later()).unwrap_err();
    let IngestError::ImpossibleJump { implied_speed_kmh, .. } = err else {
        panic!("expected impossible jump, got {err:?}");
    };
    assert!(implied_speed_kmh > 6000.0);

    // History still ends at the first fix
    let latest = tracker.latest_fix(DeviceId(1)).unwrap();
    assert_eq!(latest.timestamp, at(0));
    assert_eq!(tracker.metrics.report(0, 0).rejected_jump, 1);
}

#[test]
fn test_mqtt_receives_fix_events_and_alerts() {
    let mut tracker = create_test_tracker_with(vec![depot()], &[], true);

    tracker.ingest(fix(3, 0.0, 0.0, 0), later()).unwrap();
    tracker.ingest(fix(3, 0.02, 0.0, 5).with_speed(95.0), later()).unwrap();

    let msgs = tracker.drain_egress();
    let fixes = msgs.iter().filter(|m| matches!(m, EgressMessage::Fix(_))).count();
    let events = msgs.iter().filter(|m| matches!(m, EgressMessage::ZoneEvent(_))).count();
    let alerts: Vec<_> = msgs
        .iter()
        .filter_map(|m| match m {
            EgressMessage::Alert(a) => Some(a.body.kind),
            _ => None,
        })
        .collect();

    assert_eq!(fixes, 2);
    // Entry then exit
    assert_eq!(events, 2);
    assert_eq!(alerts, vec![AlertKind::Zone, AlertKind::Speed]);
}

#[test]
fn test_route_points_limit_keeps_newest() {
    let tracker = create_test_tracker(vec![]);
    for m in 0..10 {
        tracker.ingest(fix(1, 0.0, m as f64 * 0.001, m), later()).unwrap();
    }

    let all = tracker.route_points(DeviceId(1), at(0), at(9), None);
    assert_eq!(all.len(), 10);

    let limited = tracker.route_points(DeviceId(1), at(0), at(9), Some(3));
    let ts: Vec<_> = limited.iter().map(|f| f.timestamp).collect();
    assert_eq!(ts, vec![at(7), at(8), at(9)]);

    assert!(tracker.route_points(DeviceId(99), at(0), at(9), None).is_empty());
}

#[test]
fn test_route_stats_and_simplified_route() {
    let tracker = create_test_tracker(vec![]);
    for m in 0..=6 {
        let f = fix(1, 0.0, m as f64 * 0.005, m * 5).with_speed(40.0);
        tracker.ingest(f, later()).unwrap();
    }

    let stats = tracker.route_stats(DeviceId(1), at(0), at(30));
    assert_eq!(stats.points, 7);
    assert_eq!(stats.duration.total_minutes, 30);
    assert_eq!(stats.max_speed_kmh, 40.0);
    assert!(stats.distance_km > 3.0 && stats.distance_km < 3.5);

    // A straight line collapses to its endpoints
    let simplified = tracker.simplified_route(DeviceId(1), at(0), at(30), None);
    assert_eq!(simplified.original_count, 7);
    assert_eq!(simplified.optimized_count, 2);
}

#[test]
fn test_state_summary_and_inactive_devices() {
    let tracker = create_test_tracker_with(vec![], &[1, 2, 3], false);
    let now = at(100);

    tracker.ingest(fix(1, 0.0, 0.0, 99).with_speed(30.0), now).unwrap();
    tracker.ingest(fix(3, 0.0, 0.0, 50), now).unwrap();

    let summary = tracker.state_summary(now);
    assert_eq!(summary.total, 3);
    assert_eq!(summary.moving, 1);
    assert_eq!(summary.out_of_range, 1);
    assert_eq!(summary.no_data, 1);

    let inactive = tracker.inactive_devices(now);
    let ids: Vec<_> = inactive.iter().map(|d| d.device_id).collect();
    assert_eq!(ids, vec![DeviceId(2), DeviceId(3)]);
    assert_eq!(inactive[0].last_fix_at, None);
    assert_eq!(inactive[1].minutes_inactive, Some(50));

    assert_eq!(tracker.movement_state(DeviceId(1), now).state, MovementState::Moving);
}

#[test]
fn test_unauthorized_stops_respect_allowed_zones() {
    // Allowed zone far from where the device parks
    let tracker = create_test_tracker(vec![Zone::circle(
        20,
        "Depot",
        ZoneKind::Allowed,
        1.0,
        1.0,
        500.0,
    )]);
    for m in (0..=40).step_by(10) {
        tracker.ingest(fix(1, 0.0, 0.0, m).with_speed(0.0), later()).unwrap();
    }
    tracker.ingest(fix(1, 0.0, 0.01, 45).with_speed(30.0), later()).unwrap();

    let stops = tracker.unauthorized_stops(DeviceId(1), 30);
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].duration_minutes, 40);
    assert_eq!(stops[0].started_at, at(0));

    // Same stop inside the allowed zone is fine
    let parked = create_test_tracker(vec![depot()]);
    for m in (0..=40).step_by(10) {
        parked.ingest(fix(1, 0.0, 0.0, m), later()).unwrap();
    }
    assert!(parked.unauthorized_stops(DeviceId(1), 30).is_empty());
}

#[test]
fn test_route_start_and_end_detection() {
    let tracker = create_test_tracker(vec![]);
    tracker.ingest(fix(1, 0.0, 0.0, 0).with_speed(20.0), later()).unwrap();
    assert!(tracker.route_start(DeviceId(1)).is_none());
    tracker.ingest(fix(1, 0.0, 0.002, 1).with_speed(25.0), later()).unwrap();

    let start = tracker.route_start(DeviceId(1)).unwrap();
    assert_eq!(start.started_at, at(0));

    for m in [10, 15, 21] {
        tracker.ingest(fix(1, 0.0, 0.004, m).with_speed(0.0), later()).unwrap();
    }
    let end = tracker.route_end(DeviceId(1), 10).unwrap();
    assert_eq!(end.ended_at, at(21));
    assert_eq!(end.stopped_minutes, 11);
    assert!(tracker.route_end(DeviceId(1), 20).is_none());
}

#[test]
fn test_replace_zones_keeps_open_entries() {
    let tracker = create_test_tracker(vec![warehouse()]);
    tracker.ingest(fix(1, 0.0, 0.0, 0), later()).unwrap();

    let status = tracker.device_status(DeviceId(1), later()).unwrap();
    assert_eq!(status.open_zones, vec![ZoneId(10)]);

    // Deactivate the zone: the open entry stays, no transitions happen
    assert_eq!(tracker.replace_zones(vec![warehouse().inactive(), depot()]).unwrap(), 2);
    let out = tracker.ingest(fix(1, 0.02, 0.0, 5), later()).unwrap();
    assert!(out.events.is_empty());

    let status = tracker.device_status(DeviceId(1), later()).unwrap();
    assert_eq!(status.open_zones, vec![ZoneId(10)]);
    assert_eq!(status.fixes_stored, 2);

    // Invalid replacement keeps the current set
    let bad = Zone::circle(30, "Bad", ZoneKind::Checkpoint, 0.0, 0.0, -1.0);
    assert!(tracker.replace_zones(vec![bad]).is_err());
    assert_eq!(tracker.zone_count(), 2);
}

#[test]
fn test_zones_containing_device() {
    let tracker = create_test_tracker(vec![warehouse(), depot()]);
    assert!(tracker.zones_containing_device(DeviceId(1)).is_none());

    tracker.ingest(fix(1, 0.0, 0.0, 0), later()).unwrap();
    let zones = tracker.zones_containing_device(DeviceId(1)).unwrap();
    assert_eq!(zones.len(), 2);
    assert!(tracker.zones_containing(0.5, 0.5).is_empty());
}

#[test]
fn test_smoothed_and_quality() {
    let tracker = create_test_tracker(vec![]);
    for m in 0..6 {
        let f = fix(1, 0.0, m as f64 * 0.001, m).with_speed(10.0 + m as f64);
        tracker.ingest(f, later()).unwrap();
    }

    let smoothed = tracker.smoothed(DeviceId(1), 5);
    assert_eq!(smoothed.len(), 2);
    assert_eq!(smoothed[0].speed_kmh, 12.0);
    assert_eq!(smoothed[1].timestamp, at(5));

    let quality = tracker.quality_report(DeviceId(1), at(0), at(10), later());
    assert_eq!(quality.total_points, 6);
    assert_eq!(quality.quality_pct, 100.0);
}

#[test]
fn test_prune_older_than() {
    let tracker = create_test_tracker(vec![]);
    for m in 0..10 {
        tracker.ingest(fix(1, 0.0, 0.0, m), later()).unwrap();
    }

    assert_eq!(tracker.prune_older_than(at(4)), 4);
    assert_eq!(tracker.route_points(DeviceId(1), at(0), at(60), None).len(), 6);
    assert_eq!(tracker.metrics.report(0, 0).fixes_pruned, 4);
}

#[test]
fn test_concurrent_ingest_keeps_zone_state_consistent() {
    const THREADS: i64 = 4;
    const PER_THREAD: i64 = 50;

    let TestTracker { tracker, dir: _dir, .. } = create_test_tracker(vec![warehouse()]);
    let tracker = Arc::new(tracker);

    // Threads interleave minutes so they constantly race each other; even
    // minutes are inside the warehouse, odd minutes 2.2 km north of it
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tracker = Arc::clone(&tracker);
            std::thread::spawn(move || {
                let mut accepted = Vec::new();
                let mut rejected = Vec::new();
                for k in 0..PER_THREAD {
                    let minute = k * THREADS + t;
                    let lat = if minute % 2 == 0 { 0.0 } else { 0.02 };
                    match tracker.ingest(fix(1, lat, 0.0, minute), later()) {
                        Ok(outcome) => accepted.push(outcome),
                        Err(e) => rejected.push((minute, e)),
                    }
                    let status = tracker.device_status(DeviceId(1), later()).unwrap();
                    assert!(status.open_zones.len() <= 1);
                }
                (accepted, rejected)
            })
        })
        .collect();

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for handle in handles {
        let (a, r) = handle.join().unwrap();
        accepted.extend(a);
        rejected.extend(r);
    }
    assert_eq!((accepted.len() + rejected.len()) as i64, THREADS * PER_THREAD);
    assert!(!accepted.is_empty());

    // Only ordering can reject here, and a rejected fix never reaches history
    let stored = tracker.route_points(DeviceId(1), at(0), later(), None);
    assert_eq!(stored.len(), accepted.len());
    assert!(stored.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    for (minute, err) in &rejected {
        assert!(matches!(err, IngestError::OutOfOrder { .. }), "{err:?}");
        assert!(stored.iter().all(|f| f.timestamp != at(*minute)));
    }

    // Replayed in application order, zone events strictly alternate
    accepted.sort_by_key(|o| o.fix.timestamp);
    let kinds: Vec<_> = accepted.iter().flat_map(|o| o.events.iter().map(|e| e.kind)).collect();
    for (i, kind) in kinds.iter().enumerate() {
        let expected = if i % 2 == 0 { ZoneEventKind::Entry } else { ZoneEventKind::Exit };
        assert_eq!(*kind, expected, "event {i} in {kinds:?}");
    }

    let open = tracker.device_status(DeviceId(1), later()).unwrap().open_zones;
    let entries = kinds.iter().filter(|k| **k == ZoneEventKind::Entry).count();
    assert_eq!(open.len(), entries - (kinds.len() - entries));
    assert_eq!(tracker.metrics.report(0, 0).rejected_out_of_order, rejected.len() as u64);
}

#[test]
fn test_compare_route_against_recent_days() {
    let tracker = create_test_tracker(vec![]);
    // Yesterday at 30 km/h, today at 50 km/h
    for m in 0..3 {
        tracker.ingest(fix(1, 0.0, m as f64 * 0.001, m).with_speed(30.0), later()).unwrap();
    }
    for m in 0..3 {
        let f = fix(1, 0.0, 0.01 + m as f64 * 0.001, 24 * 60 + m).with_speed(50.0);
        tracker.ingest(f, at(24 * 60 + 10)).unwrap();
    }

    let now = at(24 * 60 + 10);
    let cmp = tracker.compare_route(DeviceId(1), at(24 * 60), now, now);
    assert_eq!(cmp.current.points, 3);
    assert_eq!(cmp.days_compared, 2);
    assert_eq!(cmp.historical.as_ref().unwrap().avg_speed_kmh, 40.0);
    assert_eq!(cmp.avg_speed_diff_kmh, Some(10.0));

    // Fixes older than the comparison period are ignored
    let cmp = tracker.compare_route(DeviceId(1), at(0), at(2), at(40 * 24 * 60));
    assert_eq!(cmp.days_compared, 0);
    assert!(cmp.historical.is_none());
}

#[test]
fn test_current_locations_and_invalid_fixes() {
    let tracker = create_test_tracker_with(vec![], &[1, 2, 3], false);
    tracker.ingest(fix(1, 0.0, 0.0, 0), later()).unwrap();
    tracker.ingest(fix(1, 0.0, 0.001, 10).with_speed(20.0), later()).unwrap();
    tracker.ingest(fix(3, 1.0, 1.0, 30), later()).unwrap();

    let locations = tracker.current_locations(at(40));
    let ids: Vec<_> = locations.iter().map(|l| l.device_id).collect();
    assert_eq!(ids, vec![DeviceId(1), DeviceId(3)]);
    assert_eq!(locations[0].timestamp, at(10));
    assert_eq!(locations[0].minutes_ago, 30);
    assert_eq!(locations[1].minutes_ago, 10);
    assert_eq!(locations[1].state, MovementState::Stopped);

    // Checked as of minute 5, the fix at minute 10 is in the future
    let report = tracker.invalid_fixes(DeviceId(1), at(0), at(60), at(5));
    assert_eq!(report.checked, 2);
    assert_eq!(report.invalid, 1);
    assert_eq!(report.fixes[0].timestamp, at(10));
    assert_eq!(report.fixes[0].errors[0].code, "future_timestamp");

    assert_eq!(tracker.invalid_fixes(DeviceId(1), at(0), at(60), later()).invalid, 0);
}
