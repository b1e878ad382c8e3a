//! Stage execution.
//!
//! A stage turns declared input artifacts into declared output artifacts by
//! running one external tool per unit. This module holds the pieces of a
//! single unit's execution: argument templates, control files, the tool
//! runner seam, outcomes, and the [`StageExecutor`] that ties them together.

mod command;
mod control;
mod executor;
mod result;
mod tool;

pub use command::{placeholders, CommandContext, CommandTemplate, Placeholder};
pub use control::{control_value, render_control, ControlSpec, DEFAULT_CONTROL_TEMPLATE};
pub use executor::StageExecutor;
pub use result::{FailureReason, StageOutcome, UnitStageResult};
pub use tool::{ProcessToolRunner, ToolExit, ToolInvocation, ToolRunner};

#[cfg(test)]
pub use tool::MockToolRunner;
