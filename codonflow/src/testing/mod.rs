//! Testing utilities for codonflow pipelines.
//!
//! This module provides:
//! - A scripted fake tool runner
//! - Report, alignment and input fixtures
//! - Assertions for stage results and ledgers

mod assertions;
pub mod fixtures;
mod mocks;

pub use assertions::{assert_ledger_has, assert_unit_failed, assert_unit_skipped, assert_unit_succeeded};
pub use mocks::ScriptedToolRunner;
