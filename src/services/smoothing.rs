//! Moving-average noise filter over a device's newest fixes

use crate::domain::types::Fix;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub const DEFAULT_WINDOW: usize = 5;

/// Largest window the API accepts
pub const MAX_WINDOW: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmoothedPoint {
    pub lat: f64,
    pub lon: f64,
    pub speed_kmh: f64,
    pub timestamp: DateTime<Utc>,
}

/// Average each fix with the `window - 1` fixes before it
///
/// Only the newest `2 * window` fixes are considered. Returns an empty list
/// when there are fewer than `window` of them. Each output point carries the
/// timestamp of the fix that closes its window. Missing speeds are left out
/// of the speed average.
pub fn smooth(fixes: &[Fix], window: usize) -> Vec<SmoothedPoint> {
    if window == 0 {
        return Vec::new();
    }

    let tail = &fixes[fixes.len().saturating_sub(window.saturating_mul(2))..];
    if tail.len() < window {
        return Vec::new();
    }

    tail.windows(window)
        .map(|group| {
            let n = group.len() as f64;
            let lat = group.iter().map(|f| f.lat).sum::<f64>() / n;
            let lon = group.iter().map(|f| f.lon).sum::<f64>() / n;

            let speeds: Vec<f64> = group.iter().filter_map(|f| f.speed_kmh).collect();
            let speed = if speeds.is_empty() {
                0.0
            } else {
                speeds.iter().sum::<f64>() / speeds.len() as f64
            };

            SmoothedPoint {
                lat: round_to(lat, 8),
                lon: round_to(lon, 8),
                speed_kmh: round_to(speed, 2),
                timestamp: group[group.len() - 1].timestamp,
            }
        })
        .collect()
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::DeviceId;
    use chrono::{Duration, TimeZone};

    fn track(n: usize) -> Vec<Fix> {
        let t0 = Utc.with_ymd_and_hms(2025, 11, 17, 8, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                Fix::new(DeviceId(3), i as f64, -(i as f64), t0 + Duration::minutes(i as i64))
                    .with_speed(10.0 * i as f64)
            })
            .collect()
    }

    #[test]
    fn test_too_few_fixes() {
        assert!(smooth(&track(2), 3).is_empty());
        assert!(smooth(&track(5), 0).is_empty());
    }

    #[test]
    fn test_window_averages() {
        let fixes = track(4);
        let out = smooth(&fixes, 3);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].lat, 1.0);
        assert_eq!(out[0].lon, -1.0);
        assert_eq!(out[0].speed_kmh, 10.0);
        assert_eq!(out[0].timestamp, fixes[2].timestamp);
        assert_eq!(out[1].lat, 2.0);
        assert_eq!(out[1].timestamp, fixes[3].timestamp);
    }

    #[test]
    fn test_only_newest_fixes_used() {
        let fixes = track(20);
        let out = smooth(&fixes, 3);
        // newest 6 fixes -> 4 windows
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].lat, 15.0);
        assert_eq!(out[3].timestamp, fixes[19].timestamp);
    }

    #[test]
    fn test_huge_window_is_empty() {
        assert!(smooth(&track(5), usize::MAX).is_empty());
        assert!(smooth(&track(5), usize::MAX / 2 + 1).is_empty());
        assert_eq!(smooth(&track(5), 5).len(), 1);
    }

    #[test]
    fn test_missing_speeds_skipped() {
        let mut fixes = track(3);
        fixes[0].speed_kmh = None;
        let out = smooth(&fixes, 3);
        assert_eq!(out[0].speed_kmh, 15.0);
    }
}
