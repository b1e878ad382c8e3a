//! Content-addressed artifact store.
//!
//! Every artifact lives at `<root>/units/<unit>/<stage>/<file>`. A unit's
//! directory holds a `manifest.json` that records the SHA-256 digest of each
//! sealed artifact, so reruns can be compared byte-for-byte.

use super::{ArtifactKey, ArtifactKind, UnitId};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File name of the per-unit digest manifest.
pub const MANIFEST_FILE: &str = "manifest.json";

/// One sealed artifact in a unit manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Absolute or root-relative path of the artifact.
    pub path: PathBuf,
    /// Hex SHA-256 of the file content.
    pub sha256: String,
    /// File size in bytes.
    pub bytes: u64,
    /// When the artifact was sealed (ISO 8601).
    pub recorded_at: String,
}

/// Per-unit manifest keyed by `<stage>/<kind>`.
pub type Manifest = BTreeMap<String, ManifestEntry>;

/// Filesystem-backed artifact store.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    registered: DashMap<(UnitId, ArtifactKind), PathBuf>,
}

impl ArtifactStore {
    /// Creates a store rooted at `root`. Nothing is created on disk yet.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registered: DashMap::new(),
        }
    }

    /// Returns the store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory owned by a unit.
    #[must_use]
    pub fn unit_dir(&self, unit: &UnitId) -> PathBuf {
        self.root.join("units").join(unit.to_string())
    }

    /// Returns the isolated working directory of one stage for one unit.
    #[must_use]
    pub fn stage_dir(&self, unit: &UnitId, stage: &str) -> PathBuf {
        self.unit_dir(unit).join(stage)
    }

    /// Returns the canonical path of an artifact.
    #[must_use]
    pub fn path(&self, key: &ArtifactKey) -> PathBuf {
        self.stage_dir(&key.unit, &key.stage).join(key.kind.file_name())
    }

    /// Returns true if the artifact was sealed and its file still carries
    /// the digest recorded in the unit manifest.
    ///
    /// A file left behind by an attempt that never sealed, or one changed
    /// after sealing, does not count.
    #[must_use]
    pub fn is_sealed(&self, key: &ArtifactKey) -> bool {
        let path = self.path(key);
        if !path.is_file() {
            return false;
        }
        let Ok(manifest) = self.manifest(&key.unit) else {
            return false;
        };
        manifest
            .get(&manifest_key(&key.stage, &key.kind))
            .is_some_and(|entry| Self::digest(&path).is_ok_and(|digest| digest == entry.sha256))
    }

    /// Registers an externally provided artifact (a source file or a block file).
    pub fn register(&self, unit: &UnitId, kind: ArtifactKind, path: impl Into<PathBuf>) {
        self.registered.insert((unit.clone(), kind), path.into());
    }

    /// Resolves where an input of `kind` for `unit` lives.
    ///
    /// Registered artifacts win over produced ones. Returns `None` when the
    /// kind is neither registered nor produced by any stage.
    #[must_use]
    pub fn resolve(&self, unit: &UnitId, kind: &ArtifactKind, producer: Option<&str>) -> Option<PathBuf> {
        if let Some(path) = self.registered.get(&(unit.clone(), kind.clone())) {
            return Some(path.value().clone());
        }
        producer.map(|stage| self.path(&ArtifactKey::new(unit.clone(), stage, kind.clone())))
    }

    /// Computes the hex SHA-256 digest of a file.
    pub fn digest(path: &Path) -> io::Result<String> {
        let mut file = fs::File::open(path)?;
        let mut hasher = Sha256::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    }

    /// Reads a unit's manifest. A missing manifest is empty.
    pub fn manifest(&self, unit: &UnitId) -> io::Result<Manifest> {
        let path = self.unit_dir(unit).join(MANIFEST_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Manifest::new()),
            Err(e) => Err(e),
        }
    }

    /// Digests the given artifacts and records them in the unit manifest.
    ///
    /// Only the task running the unit writes its manifest, so no locking is needed.
    pub fn seal(&self, unit: &UnitId, stage: &str, kinds: &[ArtifactKind]) -> io::Result<Vec<PathBuf>> {
        let mut manifest = self.manifest(unit)?;
        let mut sealed = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let key = ArtifactKey::new(unit.clone(), stage, kind.clone());
            let path = self.path(&key);
            let entry = ManifestEntry {
                sha256: Self::digest(&path)?,
                bytes: fs::metadata(&path)?.len(),
                path: path.clone(),
                recorded_at: crate::utils::iso_timestamp(),
            };
            manifest.insert(manifest_key(stage, kind), entry);
            sealed.push(path);
        }
        let text = serde_json::to_string_pretty(&manifest).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::create_dir_all(self.unit_dir(unit))?;
        fs::write(self.unit_dir(unit).join(MANIFEST_FILE), text)?;
        Ok(sealed)
    }
}

fn manifest_key(stage: &str, kind: &ArtifactKind) -> String {
    format!("{stage}/{kind}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout() {
        let store = ArtifactStore::new("/work");
        let key = ArtifactKey::new(UnitId::new("ACE2").block(2), "tree", ArtifactKind::Tree);
        assert_eq!(store.path(&key), PathBuf::from("/work/units/ACE2.b2/tree/tree.treefile"));
    }

    #[test]
    fn test_registered_wins_over_producer() {
        let store = ArtifactStore::new("/work");
        let unit = UnitId::new("A");
        assert_eq!(store.resolve(&unit, &ArtifactKind::RawSequences, None), None);

        store.register(&unit, ArtifactKind::RawSequences, "/data/A.fasta");
        assert_eq!(
            store.resolve(&unit, &ArtifactKind::RawSequences, Some("qc")),
            Some(PathBuf::from("/data/A.fasta"))
        );
        assert_eq!(
            store.resolve(&unit, &ArtifactKind::QcSequences, Some("qc")),
            Some(PathBuf::from("/work/units/A/qc/qc.fasta"))
        );
    }

    #[test]
    fn test_seal_records_digest() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let unit = UnitId::new("A");
        let key = ArtifactKey::new(unit.clone(), "qc", ArtifactKind::QcSequences);
        fs::create_dir_all(store.stage_dir(&unit, "qc")).unwrap();
        fs::write(store.path(&key), b">s1\nATG\n").unwrap();

        store.seal(&unit, "qc", &[ArtifactKind::QcSequences]).unwrap();
        let manifest = store.manifest(&unit).unwrap();
        let entry = &manifest["qc/qc_sequences"];
        assert_eq!(entry.bytes, 8);
        assert_eq!(entry.sha256, ArtifactStore::digest(&store.path(&key)).unwrap());
        assert_eq!(entry.sha256.len(), 64);
    }

    #[test]
    fn test_sealed_requires_manifest_entry_and_matching_digest() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let unit = UnitId::new("A");
        let key = ArtifactKey::new(unit.clone(), "tree", ArtifactKind::Tree);
        assert!(!store.is_sealed(&key));

        fs::create_dir_all(store.stage_dir(&unit, "tree")).unwrap();
        fs::write(store.path(&key), "(a,b);").unwrap();
        assert!(!store.is_sealed(&key));

        store.seal(&unit, "tree", &[ArtifactKind::Tree]).unwrap();
        assert!(store.is_sealed(&key));

        fs::write(store.path(&key), "(a,(b").unwrap();
        assert!(!store.is_sealed(&key));

        fs::remove_file(store.path(&key)).unwrap();
        assert!(!store.is_sealed(&key));
    }

    #[test]
    fn test_missing_manifest_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(store.manifest(&UnitId::new("none")).unwrap().is_empty());
    }
}
