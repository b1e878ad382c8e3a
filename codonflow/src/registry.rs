//! Unit discovery and per-unit run state.
//!
//! The registry owns the authoritative list of units for a run. It is built
//! by scanning an input tree for sequence files and grows when a unit is
//! split into recombination blocks.

use crate::core::{UnitId, UnitStatus};
use crate::errors::CodonflowError;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// One gene (or block) being analysed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Stable identity.
    pub id: UnitId,
    /// The unit's source sequence file.
    pub source: PathBuf,
    /// Parent unit for block units.
    pub parent: Option<UnitId>,
    /// Name of the stage the unit was last dispatched to.
    pub current_stage: Option<String>,
    /// Lifecycle status.
    pub status: UnitStatus,
    /// Artifacts sealed so far.
    pub artifacts: BTreeSet<PathBuf>,
    /// Last failure description, if any.
    pub failure: Option<String>,
}

impl Unit {
    fn new(id: UnitId, source: PathBuf, parent: Option<UnitId>) -> Self {
        Self {
            id,
            source,
            parent,
            current_stage: None,
            status: UnitStatus::Pending,
            artifacts: BTreeSet::new(),
            failure: None,
        }
    }
}

/// Thread-safe registry of units keyed by id.
#[derive(Debug, Default)]
pub struct UnitRegistry {
    units: RwLock<BTreeMap<UnitId, Unit>>,
}

impl UnitRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans `root` recursively for files whose name matches `pattern`.
    ///
    /// Each match becomes one unit named after the file name up to its first
    /// `.`. Files are visited in sorted path order.
    ///
    /// # Errors
    ///
    /// Returns [`CodonflowError::NoUnitsFound`] if nothing matches and
    /// [`CodonflowError::DuplicateUnit`] if two files map to the same name.
    pub fn scan(root: &Path, pattern: &Regex) -> Result<Self, CodonflowError> {
        let mut files = Vec::new();
        collect_files(root, &mut files)?;
        files.sort();

        let registry = Self::new();
        for path in files {
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| pattern.is_match(name));
            if !matches {
                continue;
            }
            let Some(id) = UnitId::from_path(&path) else {
                continue;
            };
            registry.insert(id, path, None)?;
        }

        if registry.is_empty() {
            return Err(CodonflowError::NoUnitsFound {
                root: root.to_path_buf(),
                pattern: pattern.as_str().to_string(),
            });
        }
        tracing::info!(units = registry.len(), root = %root.display(), "Registered units");
        Ok(registry)
    }

    /// Adds a unit.
    ///
    /// # Errors
    ///
    /// Returns [`CodonflowError::DuplicateUnit`] if the id is already taken by
    /// a different source file.
    pub fn insert(&self, id: UnitId, source: PathBuf, parent: Option<UnitId>) -> Result<(), CodonflowError> {
        let mut units = self.units.write();
        if let Some(existing) = units.get(&id) {
            if existing.source == source {
                return Ok(());
            }
            return Err(CodonflowError::DuplicateUnit {
                unit: id.to_string(),
                first: existing.source.clone(),
                second: source,
            });
        }
        units.insert(id.clone(), Unit::new(id, source, parent));
        Ok(())
    }

    /// Registers block `index` of `parent`, backed by `source`.
    ///
    /// Re-registering the same block (a resumed run) is a no-op.
    pub fn register_block(&self, parent: &UnitId, index: u32, source: PathBuf) -> Result<UnitId, CodonflowError> {
        let id = parent.block(index);
        self.insert(id.clone(), source, Some(parent.clone()))?;
        Ok(id)
    }

    /// Returns all unit ids in sorted order.
    #[must_use]
    pub fn ids(&self) -> Vec<UnitId> {
        self.units.read().keys().cloned().collect()
    }

    /// Returns a snapshot of one unit.
    #[must_use]
    pub fn get(&self, id: &UnitId) -> Option<Unit> {
        self.units.read().get(id).cloned()
    }

    /// Returns a snapshot of all units.
    #[must_use]
    pub fn units(&self) -> Vec<Unit> {
        self.units.read().values().cloned().collect()
    }

    /// Number of registered units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    /// True if no units are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.read().is_empty()
    }

    /// Marks a unit as running `stage`.
    pub fn mark_running(&self, id: &UnitId, stage: &str) {
        if let Some(unit) = self.units.write().get_mut(id) {
            unit.current_stage = Some(stage.to_string());
            unit.status = UnitStatus::Running;
        }
    }

    /// Records the terminal status of a unit for its current stage.
    pub fn mark_finished(&self, id: &UnitId, status: UnitStatus, failure: Option<String>, artifacts: &[PathBuf]) {
        if let Some(unit) = self.units.write().get_mut(id) {
            unit.status = status;
            if failure.is_some() {
                unit.failure = failure;
            }
            unit.artifacts.extend(artifacts.iter().cloned());
        }
    }

    /// Returns units that ended in failure.
    #[must_use]
    pub fn failed(&self) -> Vec<Unit> {
        self.units
            .read()
            .values()
            .filter(|u| u.status == UnitStatus::Failed)
            .cloned()
            .collect()
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if path.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fasta_pattern() -> Regex {
        Regex::new(r"(?i)\.(fasta|fas|fa)$").unwrap()
    }

    #[test]
    fn test_scan_finds_nested_units() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("mammals")).unwrap();
        fs::write(dir.path().join("ACE2.fasta"), ">a\nATG\n").unwrap();
        fs::write(dir.path().join("mammals/BRCA1.cds.fa"), ">a\nATG\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignore").unwrap();

        let registry = UnitRegistry::scan(dir.path(), &fasta_pattern()).unwrap();
        let ids: Vec<String> = registry.ids().iter().map(ToString::to_string).collect();
        assert_eq!(ids, vec!["ACE2", "BRCA1"]);
        assert_eq!(registry.get(&UnitId::new("ACE2")).unwrap().status, UnitStatus::Pending);
    }

    #[test]
    fn test_scan_empty_is_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("readme.md"), "x").unwrap();
        let err = UnitRegistry::scan(dir.path(), &fasta_pattern()).unwrap_err();
        assert!(matches!(err, CodonflowError::NoUnitsFound { .. }));
    }

    #[test]
    fn test_scan_duplicate_names() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("ACE2.fasta"), ">a\nATG\n").unwrap();
        fs::write(dir.path().join("ACE2.aligned.fas"), ">a\nATG\n").unwrap();
        let err = UnitRegistry::scan(dir.path(), &fasta_pattern()).unwrap_err();
        assert!(matches!(err, CodonflowError::DuplicateUnit { unit, .. } if unit == "ACE2"));
    }

    #[test]
    fn test_register_block_is_idempotent() {
        let registry = UnitRegistry::new();
        let parent = UnitId::new("A");
        registry.insert(parent.clone(), PathBuf::from("A.fasta"), None).unwrap();

        let first = registry.register_block(&parent, 1, PathBuf::from("A.b1.fas")).unwrap();
        let again = registry.register_block(&parent, 1, PathBuf::from("A.b1.fas")).unwrap();
        assert_eq!(first, again);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(&first).unwrap().parent, Some(parent));
    }

    #[test]
    fn test_status_transitions() {
        let registry = UnitRegistry::new();
        let id = UnitId::new("A");
        registry.insert(id.clone(), PathBuf::from("A.fasta"), None).unwrap();

        registry.mark_running(&id, "qc");
        assert_eq!(registry.get(&id).unwrap().status, UnitStatus::Running);

        registry.mark_finished(&id, UnitStatus::Failed, Some("exit 1".into()), &[]);
        let unit = registry.get(&id).unwrap();
        assert_eq!(unit.current_stage.as_deref(), Some("qc"));
        assert_eq!(unit.failure.as_deref(), Some("exit 1"));
        assert_eq!(registry.failed().len(), 1);
    }
}
