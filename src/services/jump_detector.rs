//! Impossible-jump detection between consecutive fixes
//!
//! A fix is implausible when reaching it from the device's previous fix would
//! require travelling faster than `MAX_REALISTIC_SPEED_KMH`.

use crate::domain::geo::distance_meters;
use crate::domain::types::{DeviceId, Fix};
use crate::services::validator::MAX_REALISTIC_SPEED_KMH;
use chrono::{DateTime, Utc};
use tracing::debug;

/// Source of a device's most recent accepted fix
pub trait LastFixLookup {
    fn last_fix(&self, device_id: DeviceId) -> Option<Fix>;
}

/// Implied travel speed from `prior` to the new position, in km/h
///
/// Returns None when it cannot be evaluated: elapsed time rounds to zero
/// whole seconds.
pub fn implied_speed_kmh(prior: &Fix, lat: f64, lon: f64, timestamp: DateTime<Utc>) -> Option<f64> {
    let elapsed_secs = (timestamp - prior.timestamp).num_seconds().abs();
    if elapsed_secs == 0 {
        return None;
    }

    let distance = distance_meters(prior.point(), (lat, lon));
    Some(distance / elapsed_secs as f64 * 3.6)
}

/// Whether moving from `prior` to the new position is physically impossible
///
/// No prior fix, or zero elapsed time, is never a jump.
pub fn is_impossible_jump_from(
    prior: Option<&Fix>,
    lat: f64,
    lon: f64,
    timestamp: DateTime<Utc>,
) -> bool {
    let Some(prior) = prior else {
        return false;
    };
    match implied_speed_kmh(prior, lat, lon, timestamp) {
        Some(speed) => {
            let impossible = speed > MAX_REALISTIC_SPEED_KMH;
            if impossible {
                debug!(
                    device_id = %prior.device_id,
                    implied_speed_kmh = %format!("{speed:.1}"),
                    "impossible_jump_detected"
                );
            }
            impossible
        }
        None => false,
    }
}

/// Look up the device's latest fix and test the new position against it
pub fn is_impossible_jump<L: LastFixLookup + ?Sized>(
    lookup: &L,
    device_id: DeviceId,
    lat: f64,
    lon: f64,
    timestamp: DateTime<Utc>,
) -> bool {
    let prior = lookup.last_fix(device_id);
    is_impossible_jump_from(prior.as_ref(), lat, lon, timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;

    struct MapLookup(HashMap<DeviceId, Fix>);

    impl LastFixLookup for MapLookup {
        fn last_fix(&self, device_id: DeviceId) -> Option<Fix> {
            self.0.get(&device_id).cloned()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 11, 17, 8, 0, 0).unwrap()
    }

    fn lookup_with_origin() -> MapLookup {
        MapLookup(HashMap::from([(DeviceId(1), Fix::new(DeviceId(1), 0.0, 0.0, t0()))]))
    }

    #[test]
    fn test_fast_jump_is_impossible() {
        // ~111 km in one minute is ~6670 km/h
        let lookup = lookup_with_origin();
        assert!(is_impossible_jump(&lookup, DeviceId(1), 0.0, 1.0, t0() + Duration::seconds(60)));
    }

    #[test]
    fn test_same_jump_over_an_hour_is_fine() {
        // ~111 km in one hour is ~111 km/h
        let lookup = lookup_with_origin();
        assert!(!is_impossible_jump(&lookup, DeviceId(1), 0.0, 1.0, t0() + Duration::seconds(3600)));

        let speed =
            implied_speed_kmh(&lookup.0[&DeviceId(1)], 0.0, 1.0, t0() + Duration::seconds(3600))
                .unwrap();
        assert!((speed - 111.19).abs() < 0.1, "got {speed}");
    }

    #[test]
    fn test_first_fix_is_never_a_jump() {
        let lookup = lookup_with_origin();
        assert!(!is_impossible_jump(&lookup, DeviceId(2), 45.0, 45.0, t0()));
    }

    #[test]
    fn test_zero_elapsed_cannot_evaluate() {
        let lookup = lookup_with_origin();
        assert!(!is_impossible_jump(&lookup, DeviceId(1), 10.0, 10.0, t0()));
        assert!(!is_impossible_jump(
            &lookup,
            DeviceId(1),
            10.0,
            10.0,
            t0() + Duration::milliseconds(400)
        ));
    }
}
