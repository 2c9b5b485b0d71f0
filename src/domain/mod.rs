//! Domain models - core types and geometry
//!
//! This module contains the canonical data types used throughout the system:
//! - `Fix` - one reported device position
//! - `Zone` - a circular or polygonal region with a behavioral kind
//! - `ZoneHistoryEvent` / `Alert` - outputs of geofencing
//! - `geo` - great-circle and planar distance primitives

pub mod error;
pub mod events;
pub mod geo;
pub mod types;
pub mod zone;

// Re-export commonly used types at module level
pub use error::{IngestError, ValidationError, ValidationErrors, ZoneError};
pub use events::{Alert, AlertKind, AlertPriority, AlertStatus, ZoneEventKind, ZoneHistoryEvent};
pub use types::{DeviceId, Fix, ZoneId};
pub use zone::{Zone, ZoneKind, ZoneShape};
