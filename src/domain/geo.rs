//! Great-circle and planar distance primitives
//!
//! All coordinates are decimal degrees as (lat, lon).

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine great-circle distance in meters
///
/// Symmetric and never negative; identical points give 0.
pub fn distance_meters(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = a;
    let (lat2, lon2) = b;

    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    // Rounding can push h a hair outside [0, 1] for antipodal points
    let h = h.clamp(0.0, 1.0);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// Perpendicular distance from `p` to the infinite line through `s1` and `s2`
///
/// Treats lat/lon as planar Cartesian coordinates, so the result is in degrees
/// and only meaningful over small extents. A degenerate segment yields 0.
pub fn point_to_segment_distance(p: (f64, f64), s1: (f64, f64), s2: (f64, f64)) -> f64 {
    let (x0, y0) = p;
    let (x1, y1) = s1;
    let (x2, y2) = s2;

    let denominator = ((y2 - y1).powi(2) + (x2 - x1).powi(2)).sqrt();
    if denominator == 0.0 {
        return 0.0;
    }

    let numerator = ((y2 - y1) * x0 - (x2 - x1) * y0 + x2 * y1 - y2 * x1).abs();
    numerator / denominator
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_identical_points() {
        assert_eq!(distance_meters((19.4326, -99.1332), (19.4326, -99.1332)), 0.0);
    }

    #[test]
    fn test_one_degree_longitude_at_equator() {
        let d = distance_meters((0.0, 0.0), (0.0, 1.0));
        assert!((d - 111_194.93).abs() < 1.0, "got {d}");
    }

    #[test]
    fn test_antipodal_points() {
        let d = distance_meters((0.0, 0.0), (0.0, 180.0));
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_M).abs() < 1.0);
    }

    #[test]
    fn test_point_to_segment_perpendicular() {
        let d = point_to_segment_distance((1.0, 1.0), (0.0, 0.0), (0.0, 2.0));
        assert!((d - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_point_to_segment_degenerate() {
        assert_eq!(point_to_segment_distance((5.0, 5.0), (1.0, 1.0), (1.0, 1.0)), 0.0);
    }

    fn coord() -> impl Strategy<Value = (f64, f64)> {
        (-90.0f64..=90.0, -180.0f64..=180.0)
    }

    proptest! {
        #[test]
        fn prop_distance_symmetric(a in coord(), b in coord()) {
            let ab = distance_meters(a, b);
            let ba = distance_meters(b, a);
            prop_assert!((ab - ba).abs() < 1e-6);
            prop_assert!(ab >= 0.0);
        }

        #[test]
        fn prop_distance_triangle_inequality(a in coord(), b in coord(), c in coord()) {
            let ac = distance_meters(a, c);
            let ab = distance_meters(a, b);
            let bc = distance_meters(b, c);
            // Small slack for floating point error
            prop_assert!(ac <= ab + bc + 1e-3);
        }

        #[test]
        fn prop_distance_to_self_is_zero(a in coord()) {
            prop_assert!(distance_meters(a, a).abs() < 1e-9);
        }
    }
}
