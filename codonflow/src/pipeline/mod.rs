//! Pipeline definition and execution.
//!
//! This module provides:
//! - Stage specifications and the derived, validated stage graph
//! - The standard stage catalog
//! - The fan-out scheduler and the pipeline controller
//! - The run ledger

mod catalog;
mod controller;
mod dag;
pub mod ledger;
mod scheduler;
mod spec;

#[cfg(test)]
mod integration_tests;

pub use catalog::{
    model_stage_name, standard_stages, ALIGN_STAGE, BREAKPOINTS_STAGE, MASK_STAGE, QC_STAGE, TREE_STAGE, TRIM_STAGE,
};
pub use controller::{PipelineController, RunOutcome, RunState};
pub use dag::StageGraph;
pub use ledger::{summarize, LedgerEntry, LedgerStatus, LedgerSummary, RunLedger, LEDGER_FILE};
pub use scheduler::{default_concurrency, FanOutScheduler};
pub use spec::{OutputSpec, StageSpec};
