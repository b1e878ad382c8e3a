//! Core domain model types for codonflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Unit identity and lifecycle status
//! - Artifact kinds and keys
//! - The on-disk artifact store

mod artifact;
mod status;
mod store;
mod unit;

pub use artifact::{ArtifactKey, ArtifactKind};
pub use status::UnitStatus;
pub use store::{ArtifactStore, Manifest, ManifestEntry, MANIFEST_FILE};
pub use unit::UnitId;
