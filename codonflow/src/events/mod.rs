//! Event sink system for observability.
//!
//! Pipeline and stage lifecycle events are published through an
//! [`EventSink`]. Event type names are collected in [`names`] so emitters and
//! tests agree on them.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names emitted by the controller and executor.
pub mod names {
    /// A run has started.
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// Every stage finished with at least one surviving unit.
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// A stage ended with no successful unit.
    pub const PIPELINE_ABORTED: &str = "pipeline.aborted";
    /// A stage was dispatched over its active units.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage reached its barrier.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// Every unit of a stage failed.
    pub const STAGE_ABORTED: &str = "stage.aborted";
    /// A unit's tool invocation started.
    pub const UNIT_STARTED: &str = "unit.started";
    /// A unit's outputs were produced and sealed.
    pub const UNIT_SUCCEEDED: &str = "unit.succeeded";
    /// A unit failed its stage.
    pub const UNIT_FAILED: &str = "unit.failed";
    /// A unit's stage output already existed.
    pub const UNIT_SKIPPED: &str = "unit.skipped";
    /// A unit lacked a required input.
    pub const UNIT_MISSING_DEPENDENCY: &str = "unit.missing_dependency";
    /// A unit was split into recombination blocks.
    pub const PARTITION_COMPLETED: &str = "partition.completed";
}
