//! Zone definitions and containment tests

use crate::domain::error::ZoneError;
use crate::domain::geo::distance_meters;
use crate::domain::types::ZoneId;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// Behavioral kind of a zone, which decides when transitions raise alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    Checkpoint,
    /// Leaving raises an alert
    Allowed,
    /// Entering raises an alert
    Restricted,
}

impl ZoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneKind::Checkpoint => "checkpoint",
            ZoneKind::Allowed => "allowed",
            ZoneKind::Restricted => "restricted",
        }
    }
}

/// Zone geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "lowercase")]
pub enum ZoneShape {
    Circle { center_lat: f64, center_lon: f64, radius_m: f64 },
    /// Vertices as [lat, lon], implicitly closed last to first
    Polygon { vertices: Vec<[f64; 2]> },
}

/// A named geographic region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub kind: ZoneKind,
    #[serde(flatten)]
    pub shape: ZoneShape,
    /// Stored for administrators; containment ignores it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_start: Option<NaiveTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_end: Option<NaiveTime>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Zone {
    pub fn circle(
        id: i32,
        name: &str,
        kind: ZoneKind,
        center_lat: f64,
        center_lon: f64,
        radius_m: f64,
    ) -> Self {
        Self {
            id: ZoneId(id),
            name: name.to_string(),
            kind,
            shape: ZoneShape::Circle { center_lat, center_lon, radius_m },
            schedule_start: None,
            schedule_end: None,
            active: true,
        }
    }

    pub fn polygon(id: i32, name: &str, kind: ZoneKind, vertices: Vec<[f64; 2]>) -> Self {
        Self {
            id: ZoneId(id),
            name: name.to_string(),
            kind,
            shape: ZoneShape::Polygon { vertices },
            schedule_start: None,
            schedule_end: None,
            active: true,
        }
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Whether the point lies inside the zone
    ///
    /// Malformed geometry (non-positive radius, fewer than 3 vertices) never
    /// contains anything. Points exactly on a polygon edge may land either way.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        match &self.shape {
            ZoneShape::Circle { center_lat, center_lon, radius_m } => {
                if !(radius_m.is_finite() && *radius_m > 0.0) {
                    return false;
                }
                distance_meters((*center_lat, *center_lon), (lat, lon)) <= *radius_m
            }
            ZoneShape::Polygon { vertices } => point_in_polygon(vertices, lat, lon),
        }
    }

    /// Check an administrator-supplied definition
    pub fn validate(&self) -> Result<(), ZoneError> {
        if self.name.trim().is_empty() {
            return Err(ZoneError::EmptyName(self.id));
        }
        match &self.shape {
            ZoneShape::Circle { center_lat, center_lon, radius_m } => {
                check_coordinate(self.id, *center_lat, *center_lon)?;
                if !(radius_m.is_finite() && *radius_m > 0.0) {
                    return Err(ZoneError::InvalidRadius { zone_id: self.id, radius_m: *radius_m });
                }
            }
            ZoneShape::Polygon { vertices } => {
                if vertices.len() < 3 {
                    return Err(ZoneError::TooFewVertices {
                        zone_id: self.id,
                        count: vertices.len(),
                    });
                }
                for [lat, lon] in vertices {
                    check_coordinate(self.id, *lat, *lon)?;
                }
            }
        }
        Ok(())
    }
}

fn check_coordinate(zone_id: ZoneId, lat: f64, lon: f64) -> Result<(), ZoneError> {
    if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon) {
        Ok(())
    } else {
        Err(ZoneError::CoordinateOutOfRange { zone_id, lat, lon })
    }
}

/// Ray-casting parity test with latitude as x and longitude as y
fn point_in_polygon(vertices: &[[f64; 2]], lat: f64, lon: f64) -> bool {
    if vertices.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let [xi, yi] = vertices[i];
        let [xj, yj] = vertices[j];

        // The first clause guarantees yi != yj, so the division is safe
        if (yi > lon) != (yj > lon) && lat < (xj - xi) * (lon - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}
