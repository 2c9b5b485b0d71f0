//! Event egress - writes zone history events and alerts to file
//!
//! Records are written in JSONL format (one JSON object per line)
//! to the file specified in config. Each line carries a `record` tag so
//! events and alerts can share one file.

use crate::domain::events::{Alert, ZoneHistoryEvent};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum EgressRecord<'a> {
    ZoneEvent(&'a ZoneHistoryEvent),
    Alert(&'a Alert),
}

/// Egress writer for zone events and alerts
pub struct Egress {
    file_path: PathBuf,
}

impl Egress {
    pub fn new(file_path: impl AsRef<Path>) -> Self {
        let file_path = file_path.as_ref().to_path_buf();
        info!(file_path = %file_path.display(), "egress_initialized");
        Self { file_path }
    }

    /// Write a zone event; returns true if successful
    pub fn write_event(&self, event: &ZoneHistoryEvent) -> bool {
        match self.write_record(&EgressRecord::ZoneEvent(event)) {
            Ok(()) => {
                debug!(id = %event.id, device_id = %event.device_id, "zone_event_egressed");
                true
            }
            Err(e) => {
                error!(id = %event.id, error = %e, "zone_event_egress_failed");
                false
            }
        }
    }

    /// Write an alert; returns true if successful
    pub fn write_alert(&self, alert: &Alert) -> bool {
        match self.write_record(&EgressRecord::Alert(alert)) {
            Ok(()) => {
                debug!(id = %alert.id, device_id = %alert.device_id, "alert_egressed");
                true
            }
            Err(e) => {
                error!(id = %alert.id, error = %e, "alert_egress_failed");
                false
            }
        }
    }

    /// Write events then alerts, returning how many lines succeeded
    pub fn write_all(&self, events: &[ZoneHistoryEvent], alerts: &[Alert]) -> usize {
        let events_ok = events.iter().filter(|e| self.write_event(e)).count();
        let alerts_ok = alerts.iter().filter(|a| self.write_alert(a)).count();
        events_ok + alerts_ok
    }

    fn write_record(&self, record: &EgressRecord<'_>) -> std::io::Result<()> {
        let json = serde_json::to_string(record)?;
        self.append_line(&json)
    }

    /// Append a line to the egress file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = self.file_path.as_path();

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        writeln!(file, "{}", line)?;
        debug!(file = %self.file_path.display(), bytes = %line.len(), "egress_written");

        Ok(())
    }
}
