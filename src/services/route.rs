//! Distance, duration, speed and battery statistics over a fix window

use crate::domain::geo::distance_meters;
use crate::domain::types::{whole_minutes, DeviceId, Fix};
use crate::services::movement::MIN_MOVING_SPEED_KMH;
use crate::services::validator::round2;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Default stop length that ends a route (minutes)
pub const DEFAULT_ROUTE_END_MINUTES: i64 = 10;

/// History a route is compared against (days before now)
pub const COMPARISON_DAYS: i64 = 30;

/// Battery model: percent per 10 minutes of use
const BATTERY_PCT_PER_10_MIN: f64 = 1.0;
/// Battery model: percent per 5 km travelled
const BATTERY_PCT_PER_5_KM: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DurationBreakdown {
    pub total_minutes: i64,
    pub hours: i64,
    pub minutes: i64,
    /// `HH:MM`
    pub formatted: String,
}

impl DurationBreakdown {
    pub fn from_minutes(total_minutes: i64) -> Self {
        let total_minutes = total_minutes.max(0);
        let hours = total_minutes / 60;
        let minutes = total_minutes % 60;
        Self { total_minutes, hours, minutes, formatted: format!("{hours:02}:{minutes:02}") }
    }
}

/// Linear battery usage estimate. Not calibrated against real devices.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryEstimate {
    pub total_pct: f64,
    pub by_time_pct: f64,
    pub by_distance_pct: f64,
}

pub fn estimate_battery(distance_km: f64, minutes: i64) -> BatteryEstimate {
    let by_time = minutes as f64 / 10.0 * BATTERY_PCT_PER_10_MIN;
    let by_distance = distance_km / 5.0 * BATTERY_PCT_PER_5_KM;
    BatteryEstimate {
        total_pct: round1(by_time + by_distance),
        by_time_pct: round1(by_time),
        by_distance_pct: round1(by_distance),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteStats {
    pub device_id: DeviceId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub points: usize,
    pub distance_km: f64,
    pub duration: DurationBreakdown,
    pub avg_speed_kmh: f64,
    pub max_speed_kmh: f64,
    pub battery: BatteryEstimate,
}

/// Sum of great-circle legs in km, unrounded
pub fn total_distance_km(fixes: &[Fix]) -> f64 {
    fixes.windows(2).map(|w| distance_meters(w[0].point(), w[1].point())).sum::<f64>() / 1000.0
}

/// Whole minutes from the first to the last fix, 0 with fewer than two
pub fn duration_minutes(fixes: &[Fix]) -> i64 {
    match (fixes.first(), fixes.last()) {
        (Some(first), Some(last)) if fixes.len() >= 2 => {
            whole_minutes(first.timestamp, last.timestamp).max(0)
        }
        _ => 0,
    }
}

/// Mean of the strictly positive speeds, 0 when there are none
pub fn average_speed_kmh(fixes: &[Fix]) -> f64 {
    let (sum, count) = fixes
        .iter()
        .filter_map(|f| f.speed_kmh)
        .filter(|&s| s > 0.0)
        .fold((0.0, 0usize), |(sum, n), s| (sum + s, n + 1));
    if count == 0 {
        0.0
    } else {
        round2(sum / count as f64)
    }
}

/// Highest reported speed, 0 when none is reported
pub fn max_speed_kmh(fixes: &[Fix]) -> f64 {
    round2(fixes.iter().filter_map(|f| f.speed_kmh).fold(0.0, f64::max))
}

/// Statistics over an ascending fix sequence from one device's window
pub fn route_stats(
    device_id: DeviceId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    fixes: &[Fix],
) -> RouteStats {
    let distance_km = round2(total_distance_km(fixes));
    let minutes = duration_minutes(fixes);

    RouteStats {
        device_id,
        start,
        end,
        points: fixes.len(),
        distance_km,
        duration: DurationBreakdown::from_minutes(minutes),
        avg_speed_kmh: average_speed_kmh(fixes),
        max_speed_kmh: max_speed_kmh(fixes),
        battery: estimate_battery(distance_km, minutes),
    }
}

/// Mean of per-day speeds over the comparison period
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoricalSpeeds {
    pub avg_speed_kmh: f64,
    pub max_speed_kmh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteComparison {
    pub current: RouteStats,
    /// None when no fix falls in the comparison period
    pub historical: Option<HistoricalSpeeds>,
    /// Current average minus historical average
    pub avg_speed_diff_kmh: Option<f64>,
    /// Calendar days (UTC) with at least one fix
    pub days_compared: usize,
}

#[derive(Default)]
struct DaySpeeds {
    sum: f64,
    reported: usize,
    max: f64,
}

impl DaySpeeds {
    fn avg(&self) -> f64 {
        if self.reported == 0 {
            0.0
        } else {
            self.sum / self.reported as f64
        }
    }
}

/// Compare a route against per-day speeds in `history`
///
/// Each UTC day contributes the mean and the maximum of its reported speeds
/// (stationary fixes included). The historical figures are the means of
/// those per-day values.
pub fn compare_with_history(current: RouteStats, history: &[Fix]) -> RouteComparison {
    let mut days: BTreeMap<NaiveDate, DaySpeeds> = BTreeMap::new();
    for fix in history {
        let day = days.entry(fix.timestamp.date_naive()).or_default();
        if let Some(speed) = fix.speed_kmh {
            day.sum += speed;
            day.reported += 1;
            day.max = day.max.max(speed);
        }
    }

    if days.is_empty() {
        return RouteComparison { current, historical: None, avg_speed_diff_kmh: None, days_compared: 0 };
    }

    let n = days.len() as f64;
    let historical = HistoricalSpeeds {
        avg_speed_kmh: round2(days.values().map(DaySpeeds::avg).sum::<f64>() / n),
        max_speed_kmh: round2(days.values().map(|d| d.max).sum::<f64>() / n),
    };
    let diff = round2(current.avg_speed_kmh - historical.avg_speed_kmh);

    RouteComparison {
        current,
        historical: Some(historical),
        avg_speed_diff_kmh: Some(diff),
        days_compared: days.len(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteStart {
    pub started_at: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
}

/// A route has started when the two newest fixes are both moving
///
/// `recent` is in ascending timestamp order.
pub fn detect_route_start(recent: &[Fix]) -> Option<RouteStart> {
    let [older, newest] = last_n::<2>(recent)?;
    let moving = |f: &Fix| f.speed_or_zero() > MIN_MOVING_SPEED_KMH;
    if moving(older) && moving(newest) {
        Some(RouteStart { started_at: older.timestamp, lat: older.lat, lon: older.lon })
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteEnd {
    pub ended_at: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub stopped_minutes: i64,
}

/// A route has ended when the three newest fixes are all slow and span at
/// least `stopped_minutes`
pub fn detect_route_end(recent: &[Fix], stopped_minutes: i64) -> Option<RouteEnd> {
    let [third, second, newest] = last_n::<3>(recent)?;
    let slow = |f: &Fix| f.speed_or_zero() < MIN_MOVING_SPEED_KMH;
    if !(slow(third) && slow(second) && slow(newest)) {
        return None;
    }

    let span = whole_minutes(third.timestamp, newest.timestamp);
    (span >= stopped_minutes).then(|| RouteEnd {
        ended_at: newest.timestamp,
        lat: newest.lat,
        lon: newest.lon,
        stopped_minutes: span,
    })
}

fn last_n<const N: usize>(fixes: &[Fix]) -> Option<[&Fix; N]> {
    let tail = fixes.get(fixes.len().checked_sub(N)?..)?;
    Some(std::array::from_fn(|i| &tail[i]))
}

#[inline]
fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
