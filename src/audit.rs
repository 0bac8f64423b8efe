//! JSONL audit trail.
//!
//! Every cycle appends events to the audit file, one JSON object per line:
//! `cycle_started` before the cycle, `cycle_report` with the full report
//! after it, and `user_confirmed` when a LIVE run was confirmed at the prompt.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;

use crate::cycle::{ExecutionReport, Reconciler};
use crate::error::Result;
use crate::sequencer::Mode;

/// An audit event written to the JSONL trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub event: &'static str,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub data: serde_json::Value,
}

/// Append-only audit logger.
pub struct AuditLog {
    writer: BufWriter<Box<dyn Write + Send>>,
}

impl AuditLog {
    /// Open (or create) the audit file for appending, creating parent dirs.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_writer(file))
    }

    /// Write events to any sink instead of a file.
    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: BufWriter::new(Box::new(writer)),
        }
    }

    /// Append one event and flush it.
    pub fn log(&mut self, event: &'static str, data: serde_json::Value) -> Result<()> {
        let entry = AuditEvent {
            event,
            ts: Utc::now(),
            data,
        };
        let json = serde_json::to_string(&entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(self.writer, "{json}")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn cycle_started(&mut self, account_id: &str, mode: Mode) -> Result<()> {
        self.log(
            "cycle_started",
            serde_json::json!({ "account": account_id, "mode": mode }),
        )
    }

    pub fn cycle_report(&mut self, report: &ExecutionReport) -> Result<()> {
        let data = serde_json::to_value(report)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.log("cycle_report", data)
    }

    pub fn user_confirmed(&mut self, accounts: &[String], approved: bool) -> Result<()> {
        self.log(
            "user_confirmed",
            serde_json::json!({ "accounts": accounts, "approved": approved }),
        )
    }
}

/// Run one cycle per account in order, auditing each. A failed audit write
/// is logged and the remaining accounts still run.
pub fn run_audited(
    reconciler: &Reconciler<'_>,
    accounts: &[String],
    mode: Mode,
    audit: &mut AuditLog,
    on_report: &mut dyn FnMut(&ExecutionReport),
) -> Vec<ExecutionReport> {
    let mut reports = Vec::with_capacity(accounts.len());
    for account_id in accounts {
        if let Err(e) = audit.cycle_started(account_id, mode) {
            warn!("{account_id}: failed to write audit event: {e}");
        }
        let report = reconciler.run_cycle(account_id);
        on_report(&report);
        if let Err(e) = audit.cycle_report(&report) {
            warn!("{account_id}: failed to write audit event: {e}");
        }
        reports.push(report);
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        {
            let mut log = AuditLog::open(&path).unwrap();
            log.cycle_started("ACC-1", Mode::Live).unwrap();
            log.user_confirmed(&["ACC-1".to_string()], true).unwrap();
        }

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "cycle_started");
        assert_eq!(lines[0]["account"], "ACC-1");
        assert_eq!(lines[0]["mode"], "live");
        assert_eq!(lines[1]["event"], "user_confirmed");
        assert_eq!(lines[1]["approved"], true);
        assert!(lines[1]["ts"].is_string());
    }

    #[test]
    fn appends_across_opens_and_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("nested").join("audit.jsonl");

        AuditLog::open(&path)
            .unwrap()
            .cycle_started("A", Mode::DryRun)
            .unwrap();
        AuditLog::open(&path)
            .unwrap()
            .cycle_started("B", Mode::DryRun)
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\"mode\":\"dry_run\""));
    }
}
