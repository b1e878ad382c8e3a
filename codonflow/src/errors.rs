//! Error types for the codonflow workflow.
//!
//! Errors split into two families. Run-level errors ([`CodonflowError`]) stop
//! the whole batch. Unit-local errors ([`ExtractError`], [`HypothesisError`],
//! [`PartitionError`]) only remove one unit (or one model pairing) from the
//! downstream analysis and are written to the run ledger.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for codonflow operations.
#[derive(Debug, Error)]
pub enum CodonflowError {
    /// The unit registry found nothing to analyse.
    #[error("No units found under '{}' matching '{pattern}'", root.display())]
    NoUnitsFound {
        /// The scanned root directory.
        root: PathBuf,
        /// The file-name pattern used.
        pattern: String,
    },

    /// Two source files map to the same unit identity.
    #[error("Duplicate unit '{unit}': '{}' and '{}'", first.display(), second.display())]
    DuplicateUnit {
        /// The colliding unit name.
        unit: String,
        /// The first source file.
        first: PathBuf,
        /// The second source file.
        second: PathBuf,
    },

    /// The pipeline definition is not runnable.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A cycle was detected in the derived stage graph.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// Every unit of a stage failed.
    #[error("Stage {stage_index} ('{stage}') failed for every unit")]
    StageAllFailed {
        /// Ordinal position of the stage.
        stage_index: usize,
        /// Stage name.
        stage: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Report writing failed.
    #[error("Report error: {0}")]
    Report(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for CodonflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<csv::Error> for CodonflowError {
    fn from(err: csv::Error) -> Self {
        Self::Report(err.to_string())
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "CONTRACT-004-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when pipeline validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the contract code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "CONTRACT-004-CYCLE",
            format!("Pipeline contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("A stage consumes an artifact kind that is only produced downstream of it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for PipelineValidationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// Unit-local failure to recover a model summary from a tool report.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractError {
    /// Neither known report layout matched.
    #[error("Unrecognized report format in '{}'", path.display())]
    UnrecognizedFormat {
        /// The report path.
        path: PathBuf,
    },

    /// A layout matched but a numeric field did not parse.
    #[error("Failed to parse {field} from '{value}' in '{}'", path.display())]
    ParseFailure {
        /// The report path.
        path: PathBuf,
        /// Which field failed (`lnL` or `np`).
        field: &'static str,
        /// The raw text that failed to parse.
        value: String,
    },

    /// The report could not be read.
    #[error("Cannot read report '{}': {message}", path.display())]
    Io {
        /// The report path.
        path: PathBuf,
        /// The underlying error message.
        message: String,
    },
}

impl ExtractError {
    /// Short tag used in ledger entries.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnrecognizedFormat { .. } => "UnrecognizedFormat",
            Self::ParseFailure { .. } => "ParseFailure",
            Self::Io { .. } => "Io",
        }
    }
}

/// Unit-local failure to form a likelihood-ratio test.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HypothesisError {
    /// The alternative model does not have more free parameters than the null.
    #[error(
        "Invalid nesting for unit '{unit}': {null} has {null_params} parameters, {alternative} has {alt_params}"
    )]
    InvalidNesting {
        /// The unit id.
        unit: String,
        /// Null model label.
        null: String,
        /// Alternative model label.
        alternative: String,
        /// Null parameter count.
        null_params: u32,
        /// Alternative parameter count.
        alt_params: u32,
    },

    /// The two runs were fitted to different units.
    #[error("Cannot compare {null} of unit '{null_unit}' with {alternative} of unit '{alt_unit}'")]
    UnitMismatch {
        /// Null model label.
        null: String,
        /// Alternative model label.
        alternative: String,
        /// Unit of the null run.
        null_unit: String,
        /// Unit of the alternative run.
        alt_unit: String,
    },

    /// The two runs marked different foreground lineages.
    #[error("Foreground mismatch for unit '{unit}': null marks '{null_foreground}', alternative marks '{alt_foreground}'")]
    ForegroundMismatch {
        /// The unit id.
        unit: String,
        /// Lineage marked in the null run.
        null_foreground: String,
        /// Lineage marked in the alternative run.
        alt_foreground: String,
    },
}

impl HypothesisError {
    /// Short tag used in ledger entries.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidNesting { .. } => "InvalidNesting",
            Self::UnitMismatch { .. } => "UnitMismatch",
            Self::ForegroundMismatch { .. } => "ForegroundMismatch",
        }
    }
}

/// Unit-local failure to split an alignment at recombination breakpoints.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// The breakpoint report was not valid JSON or had no usable blocks.
    #[error("Malformed breakpoint report '{}': {message}", path.display())]
    MalformedReport {
        /// The report path.
        path: PathBuf,
        /// What was wrong.
        message: String,
    },

    /// The alignment had no records or records of differing length.
    #[error("Unusable alignment '{}': {message}", path.display())]
    BadAlignment {
        /// The alignment path.
        path: PathBuf,
        /// What was wrong.
        message: String,
    },

    /// IO error while reading or writing blocks.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
