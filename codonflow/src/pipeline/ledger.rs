//! The run ledger.
//!
//! Every per-unit outcome and every exclusion from downstream analysis is
//! recorded as one entry. With a backing file the ledger is appended as JSON
//! lines, so an interrupted run still leaves a complete audit trail.

use crate::core::UnitId;
use crate::errors::CodonflowError;
use crate::stages::{StageOutcome, UnitStageResult};
use crate::utils::{now_utc, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File name of the ledger inside the work directory.
pub const LEDGER_FILE: &str = "ledger.jsonl";

/// Status recorded for a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// Stage outputs produced.
    Succeeded,
    /// Stage outputs already present.
    Skipped,
    /// Tool failure.
    Failed,
    /// Required input absent.
    MissingDependency,
    /// Removed from hypothesis testing or correction.
    Excluded,
    /// A recombination block that was not kept.
    Discarded,
}

impl LedgerStatus {
    /// True when the unit cannot continue past this entry.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::MissingDependency)
    }
}

/// One ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The run that wrote the entry.
    pub run_id: Uuid,
    /// Unit id.
    pub unit: String,
    /// Stage name, or an analysis step (`extract`, `test`, `partition`).
    pub stage: String,
    /// Ordinal of the stage, for pipeline stages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_index: Option<usize>,
    /// What happened.
    pub status: LedgerStatus,
    /// Tool exit code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Tool log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    /// Error type name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Error message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time of the unit's stage, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    /// When the entry was written.
    pub timestamp: Timestamp,
}

impl LedgerEntry {
    /// Creates an entry with only the required fields.
    #[must_use]
    pub fn new(run_id: Uuid, unit: &UnitId, stage: impl Into<String>, status: LedgerStatus) -> Self {
        Self {
            run_id,
            unit: unit.to_string(),
            stage: stage.into(),
            stage_index: None,
            status,
            exit_code: None,
            log_path: None,
            error_type: None,
            error: None,
            duration_ms: None,
            timestamp: now_utc(),
        }
    }

    /// Sets the error type and message.
    #[must_use]
    pub fn with_error(mut self, error_type: impl Into<String>, error: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self.error = Some(error.into());
        self
    }

    /// Builds the entry for one unit's stage result.
    #[must_use]
    pub fn from_stage_result(run_id: Uuid, stage_index: usize, result: &UnitStageResult) -> Self {
        let status = match &result.outcome {
            StageOutcome::Succeeded { .. } => LedgerStatus::Succeeded,
            StageOutcome::Skipped => LedgerStatus::Skipped,
            StageOutcome::Failed { .. } => LedgerStatus::Failed,
            StageOutcome::MissingDependency { .. } => LedgerStatus::MissingDependency,
        };
        let mut entry = Self::new(run_id, &result.unit, &result.stage, status);
        entry.stage_index = Some(stage_index);
        entry.duration_ms = Some(result.duration_ms);
        match &result.outcome {
            StageOutcome::Failed { exit_code, log_path, reason } => {
                entry.exit_code = *exit_code;
                entry.log_path = Some(log_path.clone());
                entry.error_type = Some("ToolInvocationFailed".to_string());
                entry.error = result.outcome.failure_message().or_else(|| Some(reason.to_string()));
            }
            StageOutcome::MissingDependency { .. } => {
                entry.error_type = Some("MissingDependency".to_string());
                entry.error = result.outcome.failure_message();
            }
            _ => {}
        }
        entry
    }
}

/// Counts derived from a ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    /// Distinct units seen.
    pub total_units: usize,
    /// Units with at least one stage failure.
    pub failed_units: usize,
    /// Units excluded from analysis.
    pub excluded_units: usize,
    /// Failure reasons by error type.
    pub failures_by_type: BTreeMap<String, usize>,
}

impl LedgerSummary {
    /// Share of units that never failed a stage.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_units == 0 {
            return 0.0;
        }
        (self.total_units - self.failed_units) as f64 / self.total_units as f64
    }

    /// Returns true if any unit failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failed_units > 0
    }
}

/// Collects ledger entries for one run.
#[derive(Debug)]
pub struct RunLedger {
    run_id: Uuid,
    path: Option<PathBuf>,
    entries: Mutex<Vec<LedgerEntry>>,
}

impl RunLedger {
    /// Creates an in-memory ledger.
    #[must_use]
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            path: None,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Creates a ledger that also appends to `path`.
    #[must_use]
    pub fn with_file(run_id: Uuid, path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new(run_id)
        }
    }

    /// Returns the run id.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Records an entry and appends it to the backing file.
    ///
    /// The entry is kept in memory even if the append fails.
    pub fn record(&self, entry: LedgerEntry) -> io::Result<()> {
        let mut entries = self.entries.lock();
        let written = match &self.path {
            Some(path) => append_line(path, &entry),
            None => Ok(()),
        };
        entries.push(entry);
        written
    }

    /// Records a unit's stage result.
    pub fn record_stage_result(&self, stage_index: usize, result: &UnitStageResult) -> io::Result<()> {
        self.record(LedgerEntry::from_stage_result(self.run_id, stage_index, result))
    }

    /// Records that a unit was left out of an analysis step.
    pub fn record_exclusion(
        &self,
        unit: &UnitId,
        step: &str,
        error_type: &str,
        error: impl Into<String>,
    ) -> io::Result<()> {
        self.record(LedgerEntry::new(self.run_id, unit, step, LedgerStatus::Excluded).with_error(error_type, error))
    }

    /// Returns a copy of all entries.
    #[must_use]
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().clone()
    }

    /// Summarises the entries recorded so far.
    #[must_use]
    pub fn summary(&self) -> LedgerSummary {
        summarize(&self.entries.lock())
    }

    /// Loads every entry from a ledger file.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be read, or a serialization
    /// error for a malformed line.
    pub fn load(path: &Path) -> Result<Vec<LedgerEntry>, CodonflowError> {
        let text = fs::read_to_string(path)?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(CodonflowError::from))
            .collect()
    }
}

/// Computes summary counts over ledger entries.
#[must_use]
pub fn summarize(entries: &[LedgerEntry]) -> LedgerSummary {
    let mut units = BTreeSet::new();
    let mut failed = BTreeSet::new();
    let mut excluded = BTreeSet::new();
    let mut failures_by_type = BTreeMap::new();
    for entry in entries {
        units.insert(entry.unit.as_str());
        if entry.status.is_failure() {
            failed.insert(entry.unit.as_str());
        }
        if entry.status == LedgerStatus::Excluded {
            excluded.insert(entry.unit.as_str());
        }
        if let Some(kind) = &entry.error_type {
            *failures_by_type.entry(kind.clone()).or_insert(0) += 1;
        }
    }
    LedgerSummary {
        total_units: units.len(),
        failed_units: failed.len(),
        excluded_units: excluded.len(),
        failures_by_type,
    }
}

fn append_line(path: &Path, entry: &LedgerEntry) -> io::Result<()> {
    let line = serde_json::to_string(entry).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::FailureReason;
    use tempfile::TempDir;

    fn failed_result(unit: &str) -> UnitStageResult {
        UnitStageResult::new(
            UnitId::new(unit),
            "tree",
            StageOutcome::Failed {
                exit_code: Some(2),
                log_path: PathBuf::from("tree.log"),
                reason: FailureReason::NonZeroExit,
            },
            12.0,
        )
    }

    #[test]
    fn test_entry_from_failed_result() {
        let entry = LedgerEntry::from_stage_result(Uuid::new_v4(), 4, &failed_result("A"));
        assert_eq!(entry.status, LedgerStatus::Failed);
        assert_eq!(entry.exit_code, Some(2));
        assert_eq!(entry.stage_index, Some(4));
        assert_eq!(entry.log_path, Some(PathBuf::from("tree.log")));
        assert_eq!(entry.error_type.as_deref(), Some("ToolInvocationFailed"));
    }

    #[test]
    fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LEDGER_FILE);
        let ledger = RunLedger::with_file(Uuid::new_v4(), &path);

        ledger.record_stage_result(0, &failed_result("A")).unwrap();
        ledger
            .record_exclusion(&UnitId::new("B"), "extract", "UnrecognizedFormat", "no lnL line")
            .unwrap();

        let loaded = RunLedger::load(&path).unwrap();
        assert_eq!(loaded, ledger.entries());
        assert_eq!(loaded[1].status, LedgerStatus::Excluded);
    }

    #[test]
    fn test_summary() {
        let ledger = RunLedger::new(Uuid::new_v4());
        ledger.record_stage_result(0, &failed_result("A")).unwrap();
        ledger
            .record(LedgerEntry::new(ledger.run_id(), &UnitId::new("B"), "tree", LedgerStatus::Succeeded))
            .unwrap();

        let summary = ledger.summary();
        assert_eq!(summary.total_units, 2);
        assert_eq!(summary.failed_units, 1);
        assert!(summary.has_failures());
        assert!((summary.success_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(summary.failures_by_type["ToolInvocationFailed"], 1);
    }
}
