//! Per-unit stage outcome types.

use crate::core::{ArtifactKind, UnitId, UnitStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Why a unit's stage invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The tool exited with a non-zero code.
    NonZeroExit,
    /// The tool exceeded the per-unit timeout and was killed.
    TimedOut,
    /// The tool could not be started.
    Spawn(String),
    /// The tool exited cleanly but declared outputs are missing.
    MissingOutput(Vec<ArtifactKind>),
    /// The unit's working directory or control file could not be prepared.
    Setup(String),
    /// The unit task panicked.
    Panicked(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonZeroExit => write!(f, "non-zero exit"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Spawn(msg) => write!(f, "spawn failed: {msg}"),
            Self::MissingOutput(kinds) => {
                let names: Vec<String> = kinds.iter().map(ToString::to_string).collect();
                write!(f, "missing outputs: {}", names.join(", "))
            }
            Self::Setup(msg) => write!(f, "setup failed: {msg}"),
            Self::Panicked(msg) => write!(f, "task panicked: {msg}"),
        }
    }
}

/// Outcome of one stage for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    /// The tool ran and every declared output was sealed.
    Succeeded {
        /// Sealed artifact paths.
        artifacts: Vec<PathBuf>,
    },
    /// The tool failed.
    Failed {
        /// Exit code, absent when the tool was killed or never started.
        exit_code: Option<i32>,
        /// The captured tool log.
        log_path: PathBuf,
        /// Failure classification.
        reason: FailureReason,
    },
    /// The completion marker already existed; no tool was run.
    Skipped,
    /// A required input was absent; no tool was run.
    MissingDependency {
        /// The missing input kinds.
        missing: Vec<ArtifactKind>,
    },
}

impl StageOutcome {
    /// True for outcomes that let the unit continue (`Succeeded` or `Skipped`).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Skipped)
    }

    /// Maps the outcome onto the unit lifecycle.
    #[must_use]
    pub const fn status(&self) -> UnitStatus {
        match self {
            Self::Succeeded { .. } => UnitStatus::Succeeded,
            Self::Skipped => UnitStatus::Skipped,
            Self::Failed { .. } | Self::MissingDependency { .. } => UnitStatus::Failed,
        }
    }

    /// Short label used in the ledger.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Skipped => "skipped",
            Self::MissingDependency { .. } => "missing_dependency",
        }
    }

    /// Human-readable failure description, if any.
    #[must_use]
    pub fn failure_message(&self) -> Option<String> {
        match self {
            Self::Failed { exit_code: Some(code), reason, .. } => Some(format!("{reason} (exit code {code})")),
            Self::Failed { reason, .. } => Some(reason.to_string()),
            Self::MissingDependency { missing } => {
                let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
                Some(format!("missing inputs: {}", names.join(", ")))
            }
            _ => None,
        }
    }
}

/// Result of running one stage for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitStageResult {
    /// The unit.
    pub unit: UnitId,
    /// The stage name.
    pub stage: String,
    /// What happened.
    pub outcome: StageOutcome,
    /// Wall time in milliseconds.
    pub duration_ms: f64,
}

impl UnitStageResult {
    /// Creates a new result.
    #[must_use]
    pub fn new(unit: UnitId, stage: impl Into<String>, outcome: StageOutcome, duration_ms: f64) -> Self {
        Self {
            unit,
            stage: stage.into(),
            outcome,
            duration_ms,
        }
    }

    /// Returns the artifacts sealed by this result.
    #[must_use]
    pub fn artifacts(&self) -> &[PathBuf] {
        match &self.outcome {
            StageOutcome::Succeeded { artifacts } => artifacts,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_status_mapping() {
        assert_eq!(StageOutcome::Skipped.status(), UnitStatus::Skipped);
        assert!(StageOutcome::Skipped.is_success());
        let missing = StageOutcome::MissingDependency {
            missing: vec![ArtifactKind::Tree],
        };
        assert_eq!(missing.status(), UnitStatus::Failed);
        assert_eq!(missing.failure_message().unwrap(), "missing inputs: tree");
    }

    #[test]
    fn test_failure_message_includes_exit_code() {
        let failed = StageOutcome::Failed {
            exit_code: Some(2),
            log_path: PathBuf::from("qc.log"),
            reason: FailureReason::NonZeroExit,
        };
        assert_eq!(failed.failure_message().unwrap(), "non-zero exit (exit code 2)");

        let timed_out = StageOutcome::Failed {
            exit_code: None,
            log_path: PathBuf::from("qc.log"),
            reason: FailureReason::TimedOut,
        };
        assert_eq!(timed_out.failure_message().unwrap(), "timed out");
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(StageOutcome::Skipped).unwrap();
        assert_eq!(json["status"], "skipped");
    }
}
