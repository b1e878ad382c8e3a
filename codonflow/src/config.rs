//! Run configuration.
//!
//! Loaded from TOML; every field has a default so a config file only needs
//! the values that differ. Command-line flags override file values.

use crate::analysis::{default_pairings, CorrectionScope, ModelPairing};
use crate::errors::CodonflowError;
use crate::pipeline::default_concurrency;
use crate::stages::{CommandTemplate, DEFAULT_CONTROL_TEMPLATE};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration of a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Directory scanned for unit sequence files.
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,
    /// Directory holding the artifact store, ledger and report.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Regex matched against file names to select unit sources.
    #[serde(default = "default_unit_pattern")]
    pub unit_pattern: String,
    /// Units in flight at once. Defaults to the CPU count.
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Thread count handed to each tool through `{threads}`.
    #[serde(default = "default_threads_per_unit")]
    pub threads_per_unit: usize,
    /// Wall-clock limit per tool invocation, in seconds.
    #[serde(default)]
    pub unit_timeout_seconds: Option<f64>,
    /// Run breakpoint detection and split units into recombination blocks.
    #[serde(default)]
    pub recombination: bool,
    /// Control file template for the likelihood tool.
    #[serde(default)]
    pub control_template: Option<PathBuf>,
    /// External tool commands.
    #[serde(default)]
    pub tools: ToolsConfig,
    /// One likelihood stage per variant.
    #[serde(default = "default_models")]
    pub models: Vec<ModelVariantConfig>,
    /// Nested model pairs to test.
    #[serde(default = "default_pairings")]
    pub pairings: Vec<ModelPairing>,
    /// Benjamini-Hochberg family definition.
    #[serde(default)]
    pub correction: CorrectionScope,
    /// Base name of the batch report files.
    #[serde(default = "default_report_name")]
    pub report_name: String,
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("sequences")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("codonflow_work")
}

fn default_unit_pattern() -> String {
    r"(?i)\.(fasta|fas|fa)$".to_string()
}

fn default_threads_per_unit() -> usize {
    1
}

fn default_report_name() -> String {
    "batch_report".to_string()
}

fn default_models() -> Vec<ModelVariantConfig> {
    vec![ModelVariantConfig::new("site")
        .with_override("model", "0")
        .with_override("NSsites", "0 1 2 3 7 8")]
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            work_dir: default_work_dir(),
            unit_pattern: default_unit_pattern(),
            concurrency: None,
            threads_per_unit: default_threads_per_unit(),
            unit_timeout_seconds: None,
            recombination: false,
            control_template: None,
            tools: ToolsConfig::default(),
            models: default_models(),
            pairings: default_pairings(),
            correction: CorrectionScope::default(),
            report_name: default_report_name(),
        }
    }
}

/// Command templates of the external tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Sequence QC filter.
    #[serde(default = "default_qc")]
    pub qc: CommandTemplate,
    /// Codon-aware aligner.
    #[serde(default = "default_aligner")]
    pub aligner: CommandTemplate,
    /// Where the aligner leaves its alignment.
    #[serde(default = "default_aligner_output")]
    pub aligner_output: String,
    /// Alignment trimmer.
    #[serde(default = "default_trimmer")]
    pub trimmer: CommandTemplate,
    /// Stop-codon masker run on the trimmed alignment.
    #[serde(default = "default_masker")]
    pub masker: CommandTemplate,
    /// Recombination breakpoint detector.
    #[serde(default = "default_breakpoints")]
    pub breakpoints: CommandTemplate,
    /// Phylogenetic tree builder.
    #[serde(default = "default_tree_builder")]
    pub tree_builder: CommandTemplate,
    /// Where the tree builder leaves its tree.
    #[serde(default = "default_tree_output")]
    pub tree_output: String,
    /// Codon-model likelihood maximiser.
    #[serde(default = "default_likelihood")]
    pub likelihood: CommandTemplate,
}

fn default_qc() -> CommandTemplate {
    CommandTemplate::new("python3", ["seqQC.py", "{input:raw_sequences}", "{output:qc_sequences}"])
}

fn default_aligner() -> CommandTemplate {
    CommandTemplate::new("prank", ["-d={input:qc_sequences}", "-o={prefix}", "-codon"])
}

fn default_aligner_output() -> String {
    "{prefix}.best.fas".to_string()
}

fn default_trimmer() -> CommandTemplate {
    CommandTemplate::new(
        "clipkit",
        ["{input:alignment}", "-m", "smart-gap", "--codon", "-o", "{output:trimmed_alignment}"],
    )
}

fn default_masker() -> CommandTemplate {
    CommandTemplate::new(
        "python3",
        ["stopcodon_masker.py", "{input:trimmed_alignment}", "{output:masked_alignment}"],
    )
}

fn default_breakpoints() -> CommandTemplate {
    CommandTemplate::new(
        "hyphy",
        [
            "gard",
            "--alignment",
            "{input:masked_alignment}",
            "--type",
            "codon",
            "--output",
            "{output:breakpoint_report}",
        ],
    )
}

fn default_tree_builder() -> CommandTemplate {
    CommandTemplate::new(
        "iqtree2",
        [
            "-s",
            "{input:masked_alignment}",
            "-st",
            "CODON",
            "-B",
            "1000",
            "-alrt",
            "1000",
            "-bnni",
            "-T",
            "{threads}",
            "-pre",
            "{prefix}",
        ],
    )
}

fn default_tree_output() -> String {
    "{prefix}.treefile".to_string()
}

fn default_likelihood() -> CommandTemplate {
    CommandTemplate::new("codeml", ["{control}"])
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            qc: default_qc(),
            aligner: default_aligner(),
            aligner_output: default_aligner_output(),
            trimmer: default_trimmer(),
            masker: default_masker(),
            breakpoints: default_breakpoints(),
            tree_builder: default_tree_builder(),
            tree_output: default_tree_output(),
            likelihood: default_likelihood(),
        }
    }
}

/// One likelihood-maximiser configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVariantConfig {
    /// Variant name; the stage is `ml_<name>`.
    pub name: String,
    /// Label for reports describing a single unnumbered model.
    #[serde(default)]
    pub model_label: Option<String>,
    /// Run once per foreground lineage of the tree (branch and branch-site models).
    #[serde(default)]
    pub foreground: bool,
    /// Control file key overrides.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

impl ModelVariantConfig {
    /// Creates a variant without overrides.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_label: None,
            foreground: false,
            overrides: BTreeMap::new(),
        }
    }

    /// Sets the single-model label.
    #[must_use]
    pub fn with_model_label(mut self, label: impl Into<String>) -> Self {
        self.model_label = Some(label.into());
        self
    }

    /// Runs the variant once per foreground lineage.
    #[must_use]
    pub fn with_foreground(mut self) -> Self {
        self.foreground = true;
        self
    }

    /// Adds a control-file override.
    #[must_use]
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }
}

impl PipelineConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`CodonflowError::Config`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CodonflowError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| CodonflowError::Config(format!("Failed to read config file '{}': {e}", path.display())))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| CodonflowError::Config(format!("Failed to parse config file '{}': {e}", path.display())))?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Saves configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), CodonflowError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| CodonflowError::Config(format!("Failed to serialize config: {e}")))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Effective worker budget.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(default_concurrency).max(1)
    }

    /// Effective per-invocation timeout.
    ///
    /// Values that are not positive or do not fit a [`Duration`] give no
    /// timeout; [`PipelineConfig::validate`] rejects them up front.
    #[must_use]
    pub fn unit_timeout(&self) -> Option<Duration> {
        self.unit_timeout_seconds
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .filter(|d| !d.is_zero())
    }

    /// Compiles the unit file-name pattern.
    ///
    /// # Errors
    ///
    /// Returns [`CodonflowError::Config`] for an invalid regex.
    pub fn unit_regex(&self) -> Result<Regex, CodonflowError> {
        Regex::new(&self.unit_pattern)
            .map_err(|e| CodonflowError::Config(format!("Invalid unit_pattern '{}': {e}", self.unit_pattern)))
    }

    /// Reads the control template, falling back to the built-in one.
    ///
    /// # Errors
    ///
    /// Returns [`CodonflowError::Config`] if a configured template cannot be read.
    pub fn control_template_text(&self) -> Result<String, CodonflowError> {
        match &self.control_template {
            Some(path) => fs::read_to_string(path).map_err(|e| {
                CodonflowError::Config(format!("Cannot read control template '{}': {e}", path.display()))
            }),
            None => Ok(DEFAULT_CONTROL_TEMPLATE.to_string()),
        }
    }

    /// Checks values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`CodonflowError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<(), CodonflowError> {
        self.unit_regex()?;
        if self.concurrency == Some(0) {
            return Err(CodonflowError::Config("concurrency must be at least 1".into()));
        }
        if self.threads_per_unit == 0 {
            return Err(CodonflowError::Config("threads_per_unit must be at least 1".into()));
        }
        if let Some(seconds) = self.unit_timeout_seconds {
            match Duration::try_from_secs_f64(seconds) {
                Ok(timeout) if !timeout.is_zero() => {}
                Ok(_) => {
                    return Err(CodonflowError::Config(format!(
                        "unit_timeout_seconds must be positive, got {seconds}"
                    )));
                }
                Err(e) => {
                    return Err(CodonflowError::Config(format!(
                        "unit_timeout_seconds {seconds} is not a usable duration: {e}"
                    )));
                }
            }
        }
        if self.models.is_empty() {
            return Err(CodonflowError::Config("at least one model variant is required".into()));
        }
        let mut names = HashSet::new();
        for model in &self.models {
            let valid = !model.name.is_empty()
                && model.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(CodonflowError::Config(format!(
                    "Model variant name '{}' must be non-empty and use only letters, digits and '_'",
                    model.name
                )));
            }
            if !names.insert(model.name.as_str()) {
                return Err(CodonflowError::Config(format!("Duplicate model variant '{}'", model.name)));
            }
        }
        if self.report_name.trim().is_empty() || self.report_name.contains(['/', '\\']) {
            return Err(CodonflowError::Config(format!("Invalid report_name '{}'", self.report_name)));
        }
        Ok(())
    }

    /// A commented sample configuration.
    #[must_use]
    pub fn sample_toml() -> &'static str {
        SAMPLE_CONFIG
    }
}

const SAMPLE_CONFIG: &str = r#"# codonflow.toml
# Command-line flags override these settings.

# Directory scanned (recursively) for unit sequence files.
input_dir = "sequences"

# Artifact store, run ledger and batch report live here.
work_dir = "codonflow_work"

# File names matching this regex become units.
unit_pattern = '(?i)\.(fasta|fas|fa)$'

# Units processed at once (default: number of CPUs).
# concurrency = 8

# Passed to tools as {threads}.
threads_per_unit = 1

# Kill a tool invocation after this many seconds.
# unit_timeout_seconds = 86400

# Detect recombination breakpoints and analyse each block as its own unit.
recombination = false

# codeml control template; a built-in template is used when unset.
# control_template = "codeml.ctl"

# "batch" corrects all tests together, "per_pairing" per model pair.
correction = "batch"

report_name = "batch_report"

# External tools. Placeholders: {input:<kind>}, {output:<kind>}, {prefix},
# {workdir}, {unit}, {threads}, {control}.
[tools.qc]
program = "python3"
args = ["seqQC.py", "{input:raw_sequences}", "{output:qc_sequences}"]

[tools.aligner]
program = "prank"
args = ["-d={input:qc_sequences}", "-o={prefix}", "-codon"]

[tools.trimmer]
program = "clipkit"
args = ["{input:alignment}", "-m", "smart-gap", "--codon", "-o", "{output:trimmed_alignment}"]

# Masks stop and ambiguous codons so tree and likelihood tools accept the alignment.
[tools.masker]
program = "python3"
args = ["stopcodon_masker.py", "{input:trimmed_alignment}", "{output:masked_alignment}"]

[tools.tree_builder]
program = "iqtree2"
args = ["-s", "{input:masked_alignment}", "-st", "CODON", "-B", "1000", "-alrt", "1000", "-bnni", "-T", "{threads}", "-pre", "{prefix}"]

[tools.likelihood]
program = "codeml"
args = ["{control}"]

# One likelihood stage per variant. Reports with numbered models (site
# models) are labelled M0, M1, ...; single-model reports use model_label.
# A foreground variant runs once per tree label containing '|', with that
# lineage marked #1; its tests are reported per lineage.
[[models]]
name = "site"

[models.overrides]
model = "0"
NSsites = "0 1 2 3 7 8"

# [[models]]
# name = "branch"
# model_label = "B"
# foreground = true
# [models.overrides]
# model = "2"
# NSsites = "0"

# [[models]]
# name = "branch_site"
# model_label = "BS"
# foreground = true
# [models.overrides]
# model = "2"
# NSsites = "2"

# [[models]]
# name = "branch_site_null"
# model_label = "BS_NULL"
# foreground = true
# [models.overrides]
# model = "2"
# NSsites = "2"
# fix_omega = "1"
# omega = "1"

# Pairings default to M0/M1, M1/M2, M0/M3, M7/M8, M0/B and BS_NULL/BS.
# [[pairings]]
# label = "M7_vs_M8"
# null = "M7"
# alternative = "M8"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_sample_parses_to_defaults() {
        let parsed: PipelineConfig = toml::from_str(PipelineConfig::sample_toml()).unwrap();
        assert_eq!(parsed, PipelineConfig::default());
        parsed.validate().unwrap();
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let parsed: PipelineConfig = toml::from_str("").unwrap();
        assert_eq!(parsed.models[0].name, "site");
        assert_eq!(parsed.pairings.len(), 6);
        assert_eq!(parsed.correction, CorrectionScope::Batch);
        assert!(parsed.unit_timeout().is_none());
    }

    #[test]
    fn test_partial_override() {
        let parsed: PipelineConfig = toml::from_str(
            r#"
            concurrency = 3
            unit_timeout_seconds = 1.5
            correction = "per_pairing"

            [tools.likelihood]
            program = "/opt/paml/bin/codeml"
            args = ["{control}"]
            "#,
        )
        .unwrap();
        assert_eq!(parsed.concurrency(), 3);
        assert_eq!(parsed.unit_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(parsed.correction, CorrectionScope::PerPairing);
        assert_eq!(parsed.tools.likelihood.program, "/opt/paml/bin/codeml");
        assert_eq!(parsed.tools.aligner, default_aligner());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = PipelineConfig::default();
        config.unit_pattern = "(".into();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.models.push(ModelVariantConfig::new("site"));
        assert!(config.validate().unwrap_err().to_string().contains("Duplicate"));

        let mut config = PipelineConfig::default();
        config.unit_timeout_seconds = Some(0.0);
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.models = vec![ModelVariantConfig::new("bad name")];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_timeout_is_rejected_without_panicking() {
        let mut config = PipelineConfig::default();
        config.unit_timeout_seconds = Some(1e20);
        assert!(matches!(config.validate(), Err(CodonflowError::Config(_))));
        assert_eq!(config.unit_timeout(), None);

        for bad in [f64::NAN, f64::INFINITY, -3.0] {
            config.unit_timeout_seconds = Some(bad);
            assert!(config.validate().is_err());
            assert_eq!(config.unit_timeout(), None);
        }

        config.unit_timeout_seconds = Some(86_400.0);
        config.validate().unwrap();
        assert_eq!(config.unit_timeout(), Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn test_foreground_variant_parses() {
        let parsed: PipelineConfig = toml::from_str(
            r#"
            [[models]]
            name = "branch"
            model_label = "B"
            foreground = true

            [models.overrides]
            model = "2"
            "#,
        )
        .unwrap();
        assert_eq!(
            parsed.models,
            vec![ModelVariantConfig::new("branch")
                .with_model_label("B")
                .with_foreground()
                .with_override("model", "2")]
        );
        assert!(!PipelineConfig::default().models[0].foreground);
    }

    #[test]
    fn test_file_round_trip_and_control_template() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("codonflow.toml");
        let mut config = PipelineConfig::default();
        config.recombination = true;
        config.to_file(&path).unwrap();
        assert_eq!(PipelineConfig::from_file(&path).unwrap(), config);

        assert!(config.control_template_text().unwrap().contains("NSsites"));
        config.control_template = Some(dir.path().join("missing.ctl"));
        assert!(matches!(config.control_template_text(), Err(CodonflowError::Config(_))));
    }
}
