//! Append-only audit log.
//!
//! One JSON line per state transition, written and flushed synchronously
//! before the transition's side effect is considered complete. The engine
//! treats a failed append as fatal to the transition (fail-closed): the PR
//! stays in its prior state.

use crate::error::{Error, Result};
use crate::types::{AuditEvent, PrId};
use chrono::{DateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Durable, append-only record of every decision and state transition
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    /// Open (or create) the audit log at `path`, creating parent directories
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent)
                .map_err(|e| Error::AuditWrite(format!("failed to create {}: {e}", parent.display())))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| Error::AuditWrite(format!("failed to open {}: {e}", path.display())))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Append one event and flush it to disk.
    ///
    /// Returns [`Error::AuditWrite`] if serialization, the write, or the
    /// flush fails; callers must then roll back the transition.
    pub fn append(&self, event: &AuditEvent) -> Result<()> {
        let line = serde_json::to_string(event)
            .map_err(|e| Error::AuditWrite(format!("failed to serialize audit event: {e}")))?;

        let mut file = self
            .file
            .lock()
            .map_err(|_| Error::AuditWrite("audit log lock poisoned".to_string()))?;
        writeln!(file, "{line}")
            .map_err(|e| Error::AuditWrite(format!("failed to append audit event: {e}")))?;
        file.sync_data()
            .map_err(|e| Error::AuditWrite(format!("failed to sync audit log: {e}")))?;

        debug!(
            pr_id = event.pr_id,
            from = %event.from,
            to = %event.to,
            reason = %event.reason,
            "audit"
        );
        Ok(())
    }

    /// Read every event in append order
    pub fn read_all(&self) -> Result<Vec<AuditEvent>> {
        let file = File::open(&self.path)
            .map_err(|e| Error::AuditWrite(format!("failed to read {}: {e}", self.path.display())))?;
        let reader = BufReader::new(file);

        let mut events = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line
                .map_err(|e| Error::AuditWrite(format!("failed to read audit line: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: AuditEvent = serde_json::from_str(&line).map_err(|e| {
                Error::AuditWrite(format!(
                    "corrupt audit entry at line {}: {e}",
                    lineno + 1
                ))
            })?;
            events.push(event);
        }
        Ok(events)
    }

    /// Events for one PR, optionally bounded to a time range
    pub fn query(
        &self,
        pr_id: Option<PrId>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditEvent>> {
        let events = self.read_all()?;
        Ok(events
            .into_iter()
            .filter(|e| pr_id.is_none_or(|id| e.pr_id == id))
            .filter(|e| since.is_none_or(|t| e.timestamp >= t))
            .filter(|e| until.is_none_or(|t| e.timestamp <= t))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Actor, PrPhase};
    use chrono::Duration;
    use tempfile::TempDir;

    fn event(pr_id: PrId, from: PrPhase, to: PrPhase) -> AuditEvent {
        AuditEvent {
            timestamp: Utc::now(),
            pr_id,
            from,
            to,
            reason: "test".to_string(),
            actor: Actor::System,
        }
    }

    #[test]
    fn append_then_read_roundtrip() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::open(&temp.path().join("audit.log")).unwrap();

        log.append(&event(1, PrPhase::PendingChecks, PrPhase::Eligible))
            .unwrap();
        log.append(&event(1, PrPhase::Eligible, PrPhase::Queued))
            .unwrap();
        log.append(&event(2, PrPhase::PendingChecks, PrPhase::Blocked))
            .unwrap();

        let all = log.read_all().unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].to, PrPhase::Eligible);
        assert_eq!(all[2].pr_id, 2);
    }

    #[test]
    fn query_filters_by_pr() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::open(&temp.path().join("audit.log")).unwrap();

        log.append(&event(1, PrPhase::PendingChecks, PrPhase::Eligible))
            .unwrap();
        log.append(&event(2, PrPhase::PendingChecks, PrPhase::Blocked))
            .unwrap();

        let for_pr1 = log.query(Some(1), None, None).unwrap();
        assert_eq!(for_pr1.len(), 1);
        assert_eq!(for_pr1[0].pr_id, 1);
    }

    #[test]
    fn query_filters_by_time_range() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::open(&temp.path().join("audit.log")).unwrap();

        log.append(&event(1, PrPhase::PendingChecks, PrPhase::Eligible))
            .unwrap();

        let future = Utc::now() + Duration::hours(1);
        assert!(log.query(None, Some(future), None).unwrap().is_empty());
        assert_eq!(log.query(None, None, Some(future)).unwrap().len(), 1);
    }

    #[test]
    fn open_creates_parent_directories() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("state").join("audit.log");
        let log = AuditLog::open(&nested).unwrap();
        log.append(&event(1, PrPhase::PendingChecks, PrPhase::Eligible))
            .unwrap();
        assert!(nested.exists());
    }

    #[test]
    fn corrupt_line_surfaces_as_audit_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("audit.log");
        std::fs::write(&path, "not json\n").unwrap();

        let log = AuditLog::open(&path).unwrap();
        let err = log.read_all().unwrap_err();
        assert!(matches!(err, Error::AuditWrite(_)));
    }
}
