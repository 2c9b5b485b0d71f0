//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `validator` - Per-fix plausibility rules and data quality
//! - `jump_detector` - Impossible jumps between consecutive fixes
//! - `zone_set` - Atomically replaceable zone definitions
//! - `geofence` - Zone entry/exit state machine and alerts
//! - `history` - Per-device fix history and state
//! - `simplifier` - Douglas-Peucker route simplification
//! - `smoothing` - Moving-average smoothing
//! - `movement` - Movement state, stops, inactivity
//! - `route` - Route statistics and start/end detection
//! - `tracker` - Ingestion pipeline and query surface
//! - `ingest_worker` - Per-device sharded ingest workers

pub mod geofence;
pub mod history;
pub mod ingest_worker;
pub mod jump_detector;
pub mod movement;
pub mod route;
pub mod simplifier;
pub mod smoothing;
pub mod tracker;
pub mod validator;
pub mod zone_set;

// Re-export commonly used types
pub use ingest_worker::{create_ingest_workers, FixDispatcher, IngestWorker};
pub use tracker::{IngestOutcome, Tracker};
pub use zone_set::ZoneSet;
