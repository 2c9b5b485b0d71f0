//! Motion state of a device derived from its newest fix
//!
//! Thresholds are fixed:
//! - older than 30 minutes: out of range
//! - older than 15 minutes: inactive
//! - otherwise moving at 5 km/h or more, else stopped

use crate::domain::types::{whole_minutes, DeviceId, Fix};
use crate::domain::zone::{Zone, ZoneKind};
use crate::services::validator::round2;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Slowest speed still counted as moving (km/h)
pub const MIN_MOVING_SPEED_KMH: f64 = 5.0;
/// Age after which a device counts as inactive (minutes)
pub const INACTIVE_MINUTES: i64 = 15;
/// Age after which a device counts as out of range (minutes)
pub const OUT_OF_RANGE_MINUTES: i64 = 30;
/// Default shortest stop reported as unauthorized (minutes)
pub const DEFAULT_STOP_MINUTES: i64 = 30;
/// Newest fixes scanned for unauthorized stops
pub const STOP_SCAN_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementState {
    NoData,
    OutOfRange,
    Inactive,
    Moving,
    Stopped,
}

impl MovementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementState::NoData => "no_data",
            MovementState::OutOfRange => "out_of_range",
            MovementState::Inactive => "inactive",
            MovementState::Moving => "moving",
            MovementState::Stopped => "stopped",
        }
    }
}

/// Classify from the newest fix's age (whole minutes) and speed
pub fn classify(latest: Option<(i64, f64)>) -> MovementState {
    match latest {
        None => MovementState::NoData,
        Some((age, _)) if age > OUT_OF_RANGE_MINUTES => MovementState::OutOfRange,
        Some((age, _)) if age > INACTIVE_MINUTES => MovementState::Inactive,
        Some((_, speed)) if speed >= MIN_MOVING_SPEED_KMH => MovementState::Moving,
        Some(_) => MovementState::Stopped,
    }
}

/// Classification plus the facts it was based on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovementStatus {
    pub state: MovementState,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fix_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minutes_since_last: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
}

pub fn movement_status(latest: Option<&Fix>, now: DateTime<Utc>) -> MovementStatus {
    let Some(fix) = latest else {
        return MovementStatus {
            state: MovementState::NoData,
            description: "No fixes recorded".to_string(),
            last_fix_at: None,
            minutes_since_last: None,
            speed_kmh: None,
        };
    };

    let age = fix_age_minutes(fix, now);
    let speed = fix.speed_or_zero();
    let state = classify(Some((age, speed)));
    let description = match state {
        MovementState::OutOfRange => format!("No connection for {age} minutes"),
        MovementState::Inactive => format!("Inactive for {age} minutes"),
        MovementState::Moving => format!("Moving at {speed} km/h"),
        MovementState::Stopped => "Stopped".to_string(),
        MovementState::NoData => "No fixes recorded".to_string(),
    };

    MovementStatus {
        state,
        description,
        last_fix_at: Some(fix.timestamp),
        minutes_since_last: Some(age),
        speed_kmh: Some(speed),
    }
}

/// Whole minutes between the fix and `now`, ignoring direction
#[inline]
pub fn fix_age_minutes(fix: &Fix, now: DateTime<Utc>) -> i64 {
    whole_minutes(fix.timestamp, now).abs()
}

/// Device counts per movement state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateSummary {
    pub moving: usize,
    pub stopped: usize,
    pub inactive: usize,
    pub out_of_range: usize,
    pub no_data: usize,
    pub total: usize,
}

impl StateSummary {
    pub fn record(&mut self, state: MovementState) {
        match state {
            MovementState::Moving => self.moving += 1,
            MovementState::Stopped => self.stopped += 1,
            MovementState::Inactive => self.inactive += 1,
            MovementState::OutOfRange => self.out_of_range += 1,
            MovementState::NoData => self.no_data += 1,
        }
        self.total += 1;
    }
}

/// A known device that has not reported recently
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InactiveDevice {
    pub device_id: DeviceId,
    pub last_fix_at: Option<DateTime<Utc>>,
    pub minutes_inactive: Option<i64>,
}

/// Some when the device has no fix or its newest fix is older than the inactivity threshold
pub fn inactive_device(
    device_id: DeviceId,
    latest: Option<&Fix>,
    now: DateTime<Utc>,
) -> Option<InactiveDevice> {
    match latest {
        None => Some(InactiveDevice { device_id, last_fix_at: None, minutes_inactive: None }),
        Some(fix) if fix.timestamp < now - Duration::minutes(INACTIVE_MINUTES) => {
            Some(InactiveDevice {
                device_id,
                last_fix_at: Some(fix.timestamp),
                minutes_inactive: Some(fix_age_minutes(fix, now)),
            })
        }
        Some(_) => None,
    }
}

/// Newest position of a device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentLocation {
    pub device_id: DeviceId,
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
    pub state: MovementState,
    pub timestamp: DateTime<Utc>,
    pub minutes_ago: i64,
}

pub fn current_location(latest: &Fix, now: DateTime<Utc>) -> CurrentLocation {
    let minutes_ago = fix_age_minutes(latest, now);
    CurrentLocation {
        device_id: latest.device_id,
        lat: latest.lat,
        lon: latest.lon,
        speed_kmh: latest.speed_kmh,
        accuracy_m: latest.accuracy_m,
        state: classify(Some((minutes_ago, latest.speed_or_zero()))),
        timestamp: latest.timestamp,
        minutes_ago,
    }
}

/// Time split between moving and stopped over a window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MovementTimes {
    pub moving_minutes: i64,
    pub stopped_minutes: i64,
    pub moving_pct: f64,
    pub stopped_pct: f64,
}

/// Attribute each gap between consecutive fixes by the earlier fix's speed
pub fn movement_times(fixes: &[Fix]) -> MovementTimes {
    let mut moving = 0;
    let mut stopped = 0;

    for pair in fixes.windows(2) {
        let gap = whole_minutes(pair[0].timestamp, pair[1].timestamp).abs();
        if pair[0].speed_or_zero() >= MIN_MOVING_SPEED_KMH {
            moving += gap;
        } else {
            stopped += gap;
        }
    }

    let total = moving + stopped;
    let pct = |part: i64| if total > 0 { round2(part as f64 / total as f64 * 100.0) } else { 0.0 };

    MovementTimes {
        moving_minutes: moving,
        stopped_minutes: stopped,
        moving_pct: pct(moving),
        stopped_pct: pct(stopped),
    }
}

/// A long stop outside every allowed zone
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnauthorizedStop {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub lat: f64,
    pub lon: f64,
}

/// Runs of consecutive slow fixes lasting at least `min_minutes`, located outside
/// every active Allowed zone
///
/// `fixes` must be in ascending timestamp order. The stop location is the
/// first fix of the run.
pub fn unauthorized_stops(fixes: &[Fix], zones: &[Zone], min_minutes: i64) -> Vec<UnauthorizedStop> {
    let allowed: Vec<&Zone> =
        zones.iter().filter(|z| z.active && z.kind == ZoneKind::Allowed).collect();

    let mut stops = Vec::new();
    let mut push_run = |run: &[Fix]| {
        let (Some(first), Some(last)) = (run.first(), run.last()) else {
            return;
        };
        let duration = whole_minutes(first.timestamp, last.timestamp);
        if duration < min_minutes {
            return;
        }
        if allowed.iter().any(|z| z.contains(first.lat, first.lon)) {
            return;
        }
        stops.push(UnauthorizedStop {
            started_at: first.timestamp,
            ended_at: last.timestamp,
            duration_minutes: duration,
            lat: first.lat,
            lon: first.lon,
        });
    };

    let mut run_start: Option<usize> = None;
    for (i, fix) in fixes.iter().enumerate() {
        let slow = fix.speed_or_zero() < MIN_MOVING_SPEED_KMH;
        match (slow, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                push_run(&fixes[start..i]);
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        push_run(&fixes[start..]);
    }

    stops
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 17, 12, 0, 0).unwrap()
    }

    fn fix_minutes_ago(minutes: i64, speed: f64) -> Fix {
        Fix::new(DeviceId(1), 0.0, 0.0, now() - Duration::minutes(minutes)).with_speed(speed)
    }

    #[test]
    fn test_classify_table() {
        assert_eq!(classify(Some((5, 10.0))), MovementState::Moving);
        assert_eq!(classify(Some((5, 2.0))), MovementState::Stopped);
        assert_eq!(classify(Some((20, 50.0))), MovementState::Inactive);
        assert_eq!(classify(Some((40, 50.0))), MovementState::OutOfRange);
        assert_eq!(classify(None), MovementState::NoData);
    }

    #[test]
    fn test_classify_thresholds_are_exclusive() {
        assert_eq!(classify(Some((15, 10.0))), MovementState::Moving);
        assert_eq!(classify(Some((30, 10.0))), MovementState::Inactive);
        assert_eq!(classify(Some((0, 5.0))), MovementState::Moving);
    }

    #[test]
    fn test_movement_status_from_fix() {
        let status = movement_status(Some(&fix_minutes_ago(5, 10.0)), now());
        assert_eq!(status.state, MovementState::Moving);
        assert_eq!(status.minutes_since_last, Some(5));

        // 15m59s floors to 15 minutes, which is not yet inactive
        let fix = Fix::new(DeviceId(1), 0.0, 0.0, now() - Duration::seconds(15 * 60 + 59));
        assert_eq!(movement_status(Some(&fix), now()).state, MovementState::Stopped);

        assert_eq!(movement_status(None, now()).state, MovementState::NoData);
    }

    #[test]
    fn test_state_summary() {
        let mut summary = StateSummary::default();
        for state in [MovementState::Moving, MovementState::Moving, MovementState::NoData] {
            summary.record(state);
        }
        assert_eq!(summary.moving, 2);
        assert_eq!(summary.no_data, 1);
        assert_eq!(summary.total, 3);
    }

    #[test]
    fn test_inactive_device() {
        assert!(inactive_device(DeviceId(1), Some(&fix_minutes_ago(10, 0.0)), now()).is_none());
        let stale = inactive_device(DeviceId(1), Some(&fix_minutes_ago(20, 0.0)), now()).unwrap();
        assert_eq!(stale.minutes_inactive, Some(20));
        let never = inactive_device(DeviceId(2), None, now()).unwrap();
        assert_eq!(never.last_fix_at, None);
    }

    #[test]
    fn test_current_location() {
        let loc = current_location(&fix_minutes_ago(20, 12.0).with_accuracy(6.0), now());
        assert_eq!(loc.minutes_ago, 20);
        assert_eq!(loc.state, MovementState::Inactive);
        assert_eq!(loc.accuracy_m, Some(6.0));
        assert_eq!(loc.timestamp, now() - Duration::minutes(20));

        let json = serde_json::to_value(current_location(&fix_minutes_ago(2, 30.0), now())).unwrap();
        assert_eq!(json["state"], "moving");
        assert!(json.get("accuracy_m").is_none());
    }

    #[test]
    fn test_movement_times() {
        let fixes = vec![
            fix_minutes_ago(60, 30.0),
            fix_minutes_ago(45, 0.0),
            fix_minutes_ago(15, 40.0),
            fix_minutes_ago(0, 40.0),
        ];
        let times = movement_times(&fixes);
        assert_eq!(times.moving_minutes, 30);
        assert_eq!(times.stopped_minutes, 30);
        assert_eq!(times.moving_pct, 50.0);
        assert_eq!(times.stopped_pct, 50.0);

        assert_eq!(movement_times(&fixes[..1]), MovementTimes::default());
    }

    #[test]
    fn test_unauthorized_stops() {
        let depot = Zone::circle(1, "depot", ZoneKind::Allowed, 0.0, 0.0, 500.0);
        let mut fixes = vec![
            // 40-minute stop at the depot: authorized
            fix_minutes_ago(200, 0.0),
            fix_minutes_ago(160, 1.0),
            fix_minutes_ago(150, 50.0),
        ];
        // 35-minute stop away from the depot
        for m in [120, 100, 85] {
            let mut f = fix_minutes_ago(m, 0.0);
            f.lat = 1.0;
            fixes.push(f);
        }
        fixes.push(fix_minutes_ago(80, 60.0));
        // short stop
        fixes.push(fix_minutes_ago(70, 0.0));
        fixes.push(fix_minutes_ago(60, 0.0));

        let stops = unauthorized_stops(&fixes, &[depot.clone()], DEFAULT_STOP_MINUTES);
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].duration_minutes, 35);
        assert_eq!(stops[0].lat, 1.0);

        // Deactivating the allowed zone exposes the depot stop too
        let stops = unauthorized_stops(&fixes, &[depot.inactive()], DEFAULT_STOP_MINUTES);
        assert_eq!(stops.len(), 2);
    }
}
