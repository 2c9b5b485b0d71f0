//! Zone history events and alerts produced by geofencing

use crate::domain::types::{DeviceId, ZoneId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Direction of a zone transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneEventKind {
    Entry,
    Exit,
}

impl ZoneEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneEventKind::Entry => "entry",
            ZoneEventKind::Exit => "exit",
        }
    }
}

/// Append-only record of a device entering or leaving a zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneHistoryEvent {
    pub id: String,
    pub zone_id: ZoneId,
    pub zone_name: String,
    pub device_id: DeviceId,
    pub kind: ZoneEventKind,
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    /// Whole minutes since the matching entry (exit only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dwell_minutes: Option<i64>,
    pub alert_generated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Speed,
    Zone,
    Battery,
    Disconnect,
    Emergency,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Speed => "speed",
            AlertKind::Zone => "zone",
            AlertKind::Battery => "battery",
            AlertKind::Disconnect => "disconnect",
            AlertKind::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Pending,
    Reviewed,
    Resolved,
}

/// Alert handed to the persistence/notification layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub device_id: DeviceId,
    pub kind: AlertKind,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub priority: AlertPriority,
    pub status: AlertStatus,
}

impl Alert {
    /// New pending alert
    pub fn new(
        device_id: DeviceId,
        kind: AlertKind,
        priority: AlertPriority,
        description: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_uuid_v7(),
            device_id,
            kind,
            description,
            timestamp,
            priority,
            status: AlertStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_v7_generation() {
        let a = new_uuid_v7();
        let b = new_uuid_v7();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_alert_starts_pending() {
        let alert = Alert::new(
            DeviceId(3),
            AlertKind::Speed,
            AlertPriority::Medium,
            "Speeding: 95 km/h".to_string(),
            Utc::now(),
        );
        assert_eq!(alert.status, AlertStatus::Pending);
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["kind"], "speed");
        assert_eq!(json["priority"], "medium");
        assert_eq!(json["device_id"], 3);
    }

    #[test]
    fn test_entry_event_omits_dwell() {
        let event = ZoneHistoryEvent {
            id: new_uuid_v7(),
            zone_id: ZoneId(1),
            zone_name: "yard".to_string(),
            device_id: DeviceId(2),
            kind: ZoneEventKind::Entry,
            timestamp: Utc::now(),
            lat: 1.0,
            lon: 2.0,
            dwell_minutes: None,
            alert_generated: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "entry");
        assert!(json.get("dwell_minutes").is_none());
    }
}
