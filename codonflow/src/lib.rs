//! # Codonflow
//!
//! Batch orchestration of codon-model selection analyses.
//!
//! Codonflow takes a directory of per-gene sequence files and drives each
//! gene through an ordered chain of external tools (quality control,
//! alignment, trimming, stop-codon masking, optional recombination
//! partitioning, tree inference and one likelihood fit per model variant),
//! then compares nested models with likelihood-ratio tests and corrects the
//! batch for multiple testing.
//!
//! - **Unit registry**: one unit per gene, or per recombination block
//! - **Foreground lineages**: branch models run once per marked lineage
//! - **Stage graph**: dependencies derived from declared artifact kinds
//! - **Fan-out scheduling**: bounded parallelism with a per-stage barrier
//! - **Failure isolation**: a failing unit drops out, the batch continues
//! - **Resumable runs**: completion markers and a per-unit digest manifest
//! - **Analysis**: report extraction, LRT and Benjamini-Hochberg correction
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use codonflow::prelude::*;
//!
//! let config = PipelineConfig::from_file("codonflow.toml")?;
//! let outcome = BatchRunner::new(config).run().await?;
//! if let Some(report) = outcome.report {
//!     println!("{} tests, {} significant", report.len(), report.significant(0.05).len());
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss
)]

pub mod analysis;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod foreground;
pub mod partition;
pub mod pipeline;
pub mod registry;
pub mod runner;
pub mod stages;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::analysis::{
        benjamini_hochberg, correct, BatchReport, CorrectionScope, HypothesisResult, HypothesisTester,
        ModelPairing, ModelRun, ReportRecord, ResultExtractor,
    };
    pub use crate::config::{ModelVariantConfig, PipelineConfig, ToolsConfig};
    pub use crate::core::{ArtifactKey, ArtifactKind, ArtifactStore, UnitId, UnitStatus};
    pub use crate::errors::{
        CodonflowError, ContractErrorInfo, CycleDetectedError, ExtractError, HypothesisError, PartitionError,
        PipelineValidationError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        standard_stages, FanOutScheduler, LedgerEntry, LedgerStatus, PipelineController, RunLedger, RunOutcome,
        RunState, StageGraph, StageSpec,
    };
    pub use crate::registry::{Unit, UnitRegistry};
    pub use crate::runner::{BatchOutcome, BatchPlan, BatchRunner};
    pub use crate::stages::{
        CommandTemplate, ControlSpec, ProcessToolRunner, StageExecutor, StageOutcome, ToolRunner, UnitStageResult,
    };
    pub use crate::utils::{iso_timestamp, Timestamp};
}
