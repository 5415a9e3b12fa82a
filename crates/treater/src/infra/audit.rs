//! Audit journal of operator-visible events.
//!
//! One JSON object per line: process start and stop, dispense requests and
//! their outcome, completed cycles and capture results.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use treat_io::{CaptureEvent, DispenserEvent};

/// Types of events that are logged in the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SystemStart,
    SystemShutdown,
    /// A dispense request started a cycle
    DispenseAccepted,
    /// A dispense request arrived while the machine was busy
    DispenseRejected,
    CycleCompleted,
    CaptureCompleted,
    CaptureFailed,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic timestamp in microseconds
    pub timestamp_us: u64,
    /// Wall-clock Unix timestamp in microseconds
    pub unix_us: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

/// Thread-safe audit logger that writes to a JSONL file
pub struct AuditLogger {
    writer: Mutex<BufWriter<File>>,
}

impl AuditLogger {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
        })
    }

    pub fn log(&self, entry: AuditEntry) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        serde_json::to_writer(&mut *writer, &entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        timestamp_us: u64,
        unix_us: u64,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.log(AuditEntry {
            timestamp_us,
            unix_us,
            event_type,
            details,
        })
    }
}

/// Journal entry for a dispenser event, if it is one worth keeping.
pub fn dispenser_entry(event: &DispenserEvent) -> Option<(AuditEventType, serde_json::Value)> {
    match event {
        DispenserEvent::DispenseAccepted => {
            Some((AuditEventType::DispenseAccepted, serde_json::json!({})))
        }
        DispenserEvent::DispenseRejected { state } => Some((
            AuditEventType::DispenseRejected,
            serde_json::json!({ "state": state.map(|s| s.as_str()) }),
        )),
        DispenserEvent::CycleCompleted { treats } => Some((
            AuditEventType::CycleCompleted,
            serde_json::json!({ "treats": treats }),
        )),
        DispenserEvent::StateChanged { .. } => None,
    }
}

pub fn capture_entry(event: &CaptureEvent) -> (AuditEventType, serde_json::Value) {
    match event {
        CaptureEvent::Completed { name, waiters } => (
            AuditEventType::CaptureCompleted,
            serde_json::json!({ "capture": name, "waiters": waiters }),
        ),
        CaptureEvent::Failed { reason } => (
            AuditEventType::CaptureFailed,
            serde_json::json!({ "reason": reason }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;
    use treat_core::StateKind;

    #[test]
    fn test_audit_logger_writes_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/audit.jsonl");

        let logger = AuditLogger::new(&path).unwrap();

        logger
            .log_event(
                1000,
                1704067200000000,
                AuditEventType::SystemStart,
                serde_json::json!({"version": "0.1.0"}),
            )
            .unwrap();

        let (event_type, details) = dispenser_entry(&DispenserEvent::DispenseRejected {
            state: Some(StateKind::Recovering),
        })
        .unwrap();
        logger
            .log_event(2000, 1704067201000000, event_type, details)
            .unwrap();

        let mut content = String::new();
        File::open(&path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();

        let lines: Vec<&str> = content.trim().split('\n').collect();
        assert_eq!(lines.len(), 2);

        let entry1: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(entry1.timestamp_us, 1000);
        assert_eq!(entry1.event_type, AuditEventType::SystemStart);

        let entry2: AuditEntry = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(entry2.event_type, AuditEventType::DispenseRejected);
        assert_eq!(entry2.details["state"], "Recovering");
    }

    #[test]
    fn state_changes_are_not_journaled() {
        let event = DispenserEvent::StateChanged {
            from: Some(StateKind::Idle),
            to: Some(StateKind::LightLcd),
        };
        assert!(dispenser_entry(&event).is_none());

        let (event_type, details) = capture_entry(&CaptureEvent::Completed {
            name: "capture-20240301-120000.jpg".into(),
            waiters: 2,
        });
        assert_eq!(event_type, AuditEventType::CaptureCompleted);
        assert_eq!(details["waiters"], 2);
    }
}
