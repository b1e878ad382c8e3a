//! Unit lifecycle status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a unit within the current run.
///
/// A unit moves `Pending -> Running` when a stage is dispatched for it and
/// settles on one of the terminal values once the stage barrier is reached.
/// `Skipped` means the unit's stage output already existed and is treated as
/// success by downstream stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    /// Not yet dispatched.
    #[default]
    Pending,
    /// A stage is currently running for the unit.
    Running,
    /// The last stage produced its outputs.
    Succeeded,
    /// The unit failed and takes no further part in the run.
    Failed,
    /// The last stage was skipped because its outputs already existed.
    Skipped,
}

impl UnitStatus {
    /// Returns true if this status is terminal for the current stage.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Returns true if the unit may continue to the next stage.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}
