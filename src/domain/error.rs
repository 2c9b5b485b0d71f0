//! Error types for fix ingestion and zone administration

use crate::domain::types::{DeviceId, ZoneId};
use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use thiserror::Error;

/// A single failed plausibility rule on a fix
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("latitude out of range (-90 to 90): {0}")]
    LatitudeOutOfRange(f64),

    #[error("longitude out of range (-180 to 180): {0}")]
    LongitudeOutOfRange(f64),

    #[error("unrealistic speed: {speed_kmh} km/h (max: {max_kmh})")]
    UnrealisticSpeed { speed_kmh: f64, max_kmh: f64 },

    #[error("timestamp is in the future: {0}")]
    FutureTimestamp(DateTime<Utc>),

    #[error("accuracy too low: {accuracy_m} m (max: {max_m} m)")]
    LowAccuracy { accuracy_m: f64, max_m: f64 },
}

impl ValidationError {
    /// Short stable code for wire payloads and metrics labels
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::LatitudeOutOfRange(_) => "latitude_out_of_range",
            ValidationError::LongitudeOutOfRange(_) => "longitude_out_of_range",
            ValidationError::UnrealisticSpeed { .. } => "unrealistic_speed",
            ValidationError::FutureTimestamp(_) => "future_timestamp",
            ValidationError::LowAccuracy { .. } => "low_accuracy",
        }
    }
}

/// Every rule a fix violated. Rarely more than a couple.
pub type ValidationErrors = SmallVec<[ValidationError; 4]>;

/// Why a fix was not accepted into history
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    #[error("fix failed validation: {}", join_errors(.0))]
    Invalid(ValidationErrors),

    #[error("fix for device {device_id} at {timestamp} is older than latest accepted fix at {latest}")]
    OutOfOrder { device_id: DeviceId, timestamp: DateTime<Utc>, latest: DateTime<Utc> },

    #[error("impossible jump for device {device_id}: implied speed {implied_speed_kmh:.1} km/h")]
    ImpossibleJump { device_id: DeviceId, implied_speed_kmh: f64 },
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Invalid(_) => "invalid",
            IngestError::OutOfOrder { .. } => "out_of_order",
            IngestError::ImpossibleJump { .. } => "impossible_jump",
        }
    }
}

fn join_errors(errors: &ValidationErrors) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

/// Problems with an administrator-supplied zone definition
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ZoneError {
    #[error("zone {0}: name must not be empty")]
    EmptyName(ZoneId),

    #[error("zone {zone_id}: radius must be a positive number of meters, got {radius_m}")]
    InvalidRadius { zone_id: ZoneId, radius_m: f64 },

    #[error("zone {zone_id}: polygon needs at least 3 vertices, got {count}")]
    TooFewVertices { zone_id: ZoneId, count: usize },

    #[error("zone {zone_id}: coordinate out of range ({lat}, {lon})")]
    CoordinateOutOfRange { zone_id: ZoneId, lat: f64, lon: f64 },

    #[error("duplicate zone id {0}")]
    DuplicateId(ZoneId),
}
