//! Unit identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Stable identity of one gene (or one recombination block of a gene).
///
/// Whole-gene units display as their name (`ACE2`). Block units carry the
/// 1-based block index and display as `ACE2.b3`. Names never contain a `.`,
/// so the display form parses back unambiguously.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct UnitId {
    name: String,
    block: Option<u32>,
}

impl UnitId {
    /// Creates a whole-gene unit id. The name is sanitized.
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: sanitize(name.as_ref()),
            block: None,
        }
    }

    /// Derives a unit id from a source file: the file name up to its first `.`.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let stem = file_name.split('.').next()?;
        if stem.is_empty() {
            return None;
        }
        Some(Self::new(stem))
    }

    /// Returns the id of block `index` of this unit.
    #[must_use]
    pub fn block(&self, index: u32) -> Self {
        Self {
            name: self.name.clone(),
            block: Some(index),
        }
    }

    /// Returns the gene name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the block index, if this is a block unit.
    #[must_use]
    pub const fn block_index(&self) -> Option<u32> {
        self.block
    }
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.block {
            Some(index) => write!(f, "{}.b{index}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for UnitId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            None if !s.is_empty() => Ok(Self::new(s)),
            Some((name, block)) if !name.is_empty() => {
                let index = block
                    .strip_prefix('b')
                    .and_then(|n| n.parse::<u32>().ok())
                    .ok_or_else(|| format!("invalid unit id '{s}'"))?;
                Ok(Self::new(name).block(index))
            }
            _ => Err(format!("invalid unit id '{s}'")),
        }
    }
}

impl From<UnitId> for String {
    fn from(id: UnitId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for UnitId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
