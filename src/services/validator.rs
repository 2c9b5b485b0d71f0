//! Stateless plausibility checks on a single fix
//!
//! Every rule is evaluated; a fix is valid only when none fail.

use crate::domain::error::{ValidationError, ValidationErrors};
use crate::domain::types::Fix;
use chrono::{DateTime, Utc};
use serde::Serialize;
use smallvec::SmallVec;

/// Fastest speed considered realistic for the tracked vehicle class (km/h)
pub const MAX_REALISTIC_SPEED_KMH: f64 = 200.0;

/// Worst accepted horizontal accuracy (meters)
pub const MAX_ACCURACY_M: f64 = 50.0;

/// Result of validating one fix
#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub errors: ValidationErrors,
}

impl Validation {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Validate a fix as of `now`
pub fn validate(fix: &Fix, now: DateTime<Utc>) -> Validation {
    let mut errors: ValidationErrors = SmallVec::new();

    // NaN fails the range checks too
    if !(-90.0..=90.0).contains(&fix.lat) {
        errors.push(ValidationError::LatitudeOutOfRange(fix.lat));
    }
    if !(-180.0..=180.0).contains(&fix.lon) {
        errors.push(ValidationError::LongitudeOutOfRange(fix.lon));
    }

    if let Some(speed) = fix.speed_kmh {
        if speed > MAX_REALISTIC_SPEED_KMH {
            errors.push(ValidationError::UnrealisticSpeed {
                speed_kmh: speed,
                max_kmh: MAX_REALISTIC_SPEED_KMH,
            });
        }
    }

    if fix.timestamp > now {
        errors.push(ValidationError::FutureTimestamp(fix.timestamp));
    }

    if let Some(accuracy) = fix.accuracy_m {
        if accuracy > MAX_ACCURACY_M {
            errors.push(ValidationError::LowAccuracy {
                accuracy_m: accuracy,
                max_m: MAX_ACCURACY_M,
            });
        }
    }

    Validation { errors }
}

/// Data quality over a set of stored fixes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub total_points: usize,
    pub valid_points: usize,
    pub invalid_points: usize,
    /// Share of valid points, 0-100 with two decimals
    pub quality_pct: f64,
}

/// Re-run validation over stored fixes
pub fn quality_report(fixes: &[Fix], now: DateTime<Utc>) -> QualityReport {
    let total = fixes.len();
    let invalid = fixes.iter().filter(|f| !validate(f, now).is_valid()).count();
    let valid = total - invalid;
    let quality_pct = if total > 0 { round2(valid as f64 / total as f64 * 100.0) } else { 0.0 };

    QualityReport { total_points: total, valid_points: valid, invalid_points: invalid, quality_pct }
}

/// One failed rule, as reported to API clients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleViolation {
    pub code: &'static str,
    pub message: String,
}

impl From<&ValidationError> for RuleViolation {
    fn from(err: &ValidationError) -> Self {
        Self { code: err.code(), message: err.to_string() }
    }
}

/// A stored fix that no longer passes validation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidFix {
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub errors: Vec<RuleViolation>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvalidFixReport {
    pub checked: usize,
    pub invalid: usize,
    /// Oldest first
    pub fixes: Vec<InvalidFix>,
}

/// List every fix that fails validation as of `now`, with its errors
pub fn invalid_fixes(fixes: &[Fix], now: DateTime<Utc>) -> InvalidFixReport {
    let invalid: Vec<InvalidFix> = fixes
        .iter()
        .filter_map(|fix| {
            let validation = validate(fix, now);
            (!validation.is_valid()).then(|| InvalidFix {
                timestamp: fix.timestamp,
                lat: fix.lat,
                lon: fix.lon,
                errors: validation.errors.iter().map(RuleViolation::from).collect(),
            })
        })
        .collect();

    InvalidFixReport { checked: fixes.len(), invalid: invalid.len(), fixes: invalid }
}

#[inline]
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
