//! Artifact kinds and keys.

use super::UnitId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of file a stage consumes or produces.
///
/// Stage dependencies are derived from kinds: a stage that lists a kind as
/// input depends on the unique stage that lists it as output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ArtifactKind {
    /// The unit's source sequence file (registered, never produced).
    RawSequences,
    /// Sequences that passed quality control.
    QcSequences,
    /// Codon-aware multiple alignment.
    Alignment,
    /// Alignment with poorly aligned columns removed.
    TrimmedAlignment,
    /// Trimmed alignment with stop and ambiguous codons masked as gaps.
    MaskedAlignment,
    /// Recombination breakpoint report (JSON).
    BreakpointReport,
    /// Maximum-likelihood phylogeny.
    Tree,
    /// Likelihood tool report for one model variant.
    ModelReport(String),
}

impl ArtifactKind {
    /// Returns the canonical file name of this kind inside a stage directory.
    #[must_use]
    pub fn file_name(&self) -> String {
        match self {
            Self::RawSequences => "source.fasta".to_string(),
            Self::QcSequences => "qc.fasta".to_string(),
            Self::Alignment => "alignment.fas".to_string(),
            Self::TrimmedAlignment => "trimmed.fas".to_string(),
            Self::MaskedAlignment => "masked.fas".to_string(),
            Self::BreakpointReport => "breakpoints.json".to_string(),
            Self::Tree => "tree.treefile".to_string(),
            Self::ModelReport(variant) => format!("{variant}.out"),
        }
    }

    /// Returns true for alignment-like kinds that can feed a control file's `seqfile`.
    #[must_use]
    pub const fn is_sequence_data(&self) -> bool {
        matches!(
            self,
            Self::RawSequences
                | Self::QcSequences
                | Self::Alignment
                | Self::TrimmedAlignment
                | Self::MaskedAlignment
        )
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RawSequences => write!(f, "raw_sequences"),
            Self::QcSequences => write!(f, "qc_sequences"),
            Self::Alignment => write!(f, "alignment"),
            Self::TrimmedAlignment => write!(f, "trimmed_alignment"),
            Self::MaskedAlignment => write!(f, "masked_alignment"),
            Self::BreakpointReport => write!(f, "breakpoint_report"),
            Self::Tree => write!(f, "tree"),
            Self::ModelReport(variant) => write!(f, "model_report.{variant}"),
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw_sequences" => Ok(Self::RawSequences),
            "qc_sequences" => Ok(Self::QcSequences),
            "alignment" => Ok(Self::Alignment),
            "trimmed_alignment" => Ok(Self::TrimmedAlignment),
            "masked_alignment" => Ok(Self::MaskedAlignment),
            "breakpoint_report" => Ok(Self::BreakpointReport),
            "tree" => Ok(Self::Tree),
            other => match other.strip_prefix("model_report.") {
                Some(variant) if !variant.is_empty() => Ok(Self::ModelReport(variant.to_string())),
                _ => Err(format!("unknown artifact kind '{other}'")),
            },
        }
    }
}

impl From<ArtifactKind> for String {
    fn from(kind: ArtifactKind) -> Self {
        kind.to_string()
    }
}

impl TryFrom<String> for ArtifactKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Addresses one artifact: which unit, which producing stage, which kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    /// The owning unit.
    pub unit: UnitId,
    /// The producing stage.
    pub stage: String,
    /// The artifact kind.
    pub kind: ArtifactKind,
}

impl ArtifactKey {
    /// Creates a new artifact key.
    #[must_use]
    pub fn new(unit: UnitId, stage: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            unit,
            stage: stage.into(),
            kind,
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.unit, self.stage, self.kind)
    }
}
