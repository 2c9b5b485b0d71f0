//! Douglas-Peucker trajectory simplification
//!
//! Distances are planar on raw (lat, lon) degrees, so the tolerance is in
//! degrees too. Good enough for the short extents of a single route.

use crate::domain::geo::point_to_segment_distance;
use crate::domain::types::Fix;
use crate::services::validator::round2;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Tolerance used when a caller does not give one (degrees, roughly 11 m)
pub const DEFAULT_TOLERANCE: f64 = 0.0001;

/// A trajectory vertex
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RoutePoint {
    pub lat: f64,
    pub lon: f64,
    pub timestamp: DateTime<Utc>,
}

impl From<&Fix> for RoutePoint {
    fn from(fix: &Fix) -> Self {
        Self { lat: fix.lat, lon: fix.lon, timestamp: fix.timestamp }
    }
}

impl RoutePoint {
    #[inline]
    fn xy(&self) -> (f64, f64) {
        (self.lat, self.lon)
    }
}

/// Reduce `points` to the vertices that deviate more than `tolerance`
///
/// Endpoints are always kept. Fewer than three points come back unchanged.
/// Uses an explicit work stack so long trajectories cannot blow the call stack.
pub fn simplify(points: &[RoutePoint], tolerance: f64) -> Vec<RoutePoint> {
    if points.len() < 3 {
        return points.to_vec();
    }

    let last = points.len() - 1;
    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[last] = true;

    let mut stack = vec![(0usize, last)];
    while let Some((first, end)) = stack.pop() {
        if end <= first + 1 {
            continue;
        }

        let (s1, s2) = (points[first].xy(), points[end].xy());
        let mut max_dist = 0.0;
        let mut index = first;
        for (i, point) in points.iter().enumerate().take(end).skip(first + 1) {
            let d = point_to_segment_distance(point.xy(), s1, s2);
            if d > max_dist {
                max_dist = d;
                index = i;
            }
        }

        if max_dist > tolerance {
            keep[index] = true;
            stack.push((index, end));
            stack.push((first, index));
        }
    }

    points.iter().zip(keep).filter_map(|(p, k)| k.then_some(*p)).collect()
}

/// Simplification result with before/after counts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimplifiedRoute {
    pub original_count: usize,
    pub optimized_count: usize,
    /// Share of points removed, 0-100 with two decimals
    pub reduction_pct: f64,
    pub points: Vec<RoutePoint>,
}

/// Simplify a fix sequence and report how much it shrank
pub fn simplify_route(fixes: &[Fix], tolerance: f64) -> SimplifiedRoute {
    let points: Vec<RoutePoint> = fixes.iter().map(RoutePoint::from).collect();
    let simplified = simplify(&points, tolerance);

    let original = points.len();
    let optimized = simplified.len();
    let reduction_pct = if original > 0 {
        round2((original - optimized) as f64 / original as f64 * 100.0)
    } else {
        0.0
    };

    SimplifiedRoute {
        original_count: original,
        optimized_count: optimized,
        reduction_pct,
        points: simplified,
    }
}
