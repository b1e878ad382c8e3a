//! Statistical aggregation over finished units.
//!
//! Model reports are parsed into [`ModelRun`]s, nested pairs are tested with
//! a likelihood-ratio test, and the batch of p-values is corrected with
//! Benjamini-Hochberg into a [`BatchReport`].

mod correction;
mod extract;
mod hypothesis;

pub use correction::{benjamini_hochberg, correct, correct_with_scope, BatchReport, CorrectionScope, ReportRecord};
pub use extract::{EnumeratedModelLayout, ModelRun, ReportLayout, ReportSource, ResultExtractor, SingleModelLayout};
pub use hypothesis::{default_pairings, HypothesisResult, HypothesisTester, ModelPairing};
