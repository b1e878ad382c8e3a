//! Test assertions for stage results and ledgers.

use crate::pipeline::{LedgerEntry, LedgerStatus};
use crate::stages::{StageOutcome, UnitStageResult};

/// Asserts that the result let the unit continue.
pub fn assert_unit_succeeded(result: &UnitStageResult) {
    assert!(
        result.outcome.is_success(),
        "Expected {} to succeed at '{}', got {:?}",
        result.unit,
        result.stage,
        result.outcome
    );
}

/// Asserts that the tool failed for the unit.
pub fn assert_unit_failed(result: &UnitStageResult) {
    assert!(
        matches!(result.outcome, StageOutcome::Failed { .. }),
        "Expected {} to fail at '{}', got {:?}",
        result.unit,
        result.stage,
        result.outcome
    );
}

/// Asserts that the stage was skipped for the unit.
pub fn assert_unit_skipped(result: &UnitStageResult) {
    assert_eq!(
        result.outcome,
        StageOutcome::Skipped,
        "Expected {} to be skipped at '{}'",
        result.unit,
        result.stage
    );
}

/// Asserts that `entries` hold an entry for `unit` at `stage` with `status`.
pub fn assert_ledger_has(entries: &[LedgerEntry], unit: &str, stage: &str, status: LedgerStatus) {
    assert!(
        entries
            .iter()
            .any(|e| e.unit == unit && e.stage == stage && e.status == status),
        "No ledger entry ({unit}, {stage}, {status:?}); entries: {:?}",
        entries
            .iter()
            .map(|e| (e.unit.as_str(), e.stage.as_str(), e.status))
            .collect::<Vec<_>>()
    );
}
