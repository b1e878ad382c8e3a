//! Benjamini-Hochberg correction and the batch report.

use super::HypothesisResult;
use crate::core::UnitId;
use crate::errors::CodonflowError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

/// Which results form one correction family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionScope {
    /// Every result of the batch is one family.
    #[default]
    Batch,
    /// Each pairing label is its own family.
    PerPairing,
}

/// One row of the batch report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    /// Unit id.
    pub unit: UnitId,
    /// Pairing label.
    pub pairing: String,
    /// Foreground lineage; empty for site-model tests.
    #[serde(default)]
    pub foreground: Option<String>,
    /// Null model label.
    pub null_model: String,
    /// Alternative model label.
    pub alt_model: String,
    /// Likelihood-ratio statistic.
    pub statistic: f64,
    /// Degrees of freedom.
    pub df: u32,
    /// Raw p-value.
    pub p_value: f64,
    /// BH-adjusted p-value.
    pub adjusted_p_value: f64,
    /// 1-based rank by raw p-value within the correction family.
    pub rank: usize,
    /// The alternative fit worse than the null.
    pub anomalous: bool,
}

/// All corrected results of one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Records sorted by adjusted p-value.
    pub records: Vec<ReportRecord>,
    /// The family definition used.
    pub scope: CorrectionScope,
}

impl BatchReport {
    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if the report has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records with an adjusted p-value at or below `alpha`.
    #[must_use]
    pub fn significant(&self, alpha: f64) -> Vec<&ReportRecord> {
        self.records.iter().filter(|r| r.adjusted_p_value <= alpha).collect()
    }

    /// Writes the report as a tab-separated table with a header row.
    ///
    /// # Errors
    ///
    /// Returns a report error if the file cannot be written.
    pub fn write_tsv(&self, path: &Path) -> Result<(), CodonflowError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_writer(BufWriter::new(File::create(path)?));
        if self.records.is_empty() {
            writer.write_record([
                "unit",
                "pairing",
                "foreground",
                "null_model",
                "alt_model",
                "statistic",
                "df",
                "p_value",
                "adjusted_p_value",
                "rank",
                "anomalous",
            ])?;
        }
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Writes the report as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn write_json(&self, path: &Path) -> Result<(), CodonflowError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Benjamini-Hochberg adjustment.
///
/// Returns `(input index, rank, adjusted p)` in rank order. Ranks follow the
/// raw p-values ascending; ties keep their input order. Adjusted values are
/// the running minimum of `p * n / rank` taken from the largest rank down,
/// capped at 1.
#[must_use]
pub fn benjamini_hochberg(p_values: &[f64]) -> Vec<(usize, usize, f64)> {
    let n = p_values.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| p_values[a].total_cmp(&p_values[b]));

    let mut adjusted = vec![0.0; n];
    let mut running = 1.0_f64;
    for (pos, &idx) in order.iter().enumerate().rev() {
        let scaled = p_values[idx] * n as f64 / (pos + 1) as f64;
        running = running.min(scaled);
        adjusted[pos] = running;
    }

    order
        .into_iter()
        .zip(adjusted)
        .enumerate()
        .map(|(pos, (idx, adj))| (idx, pos + 1, adj))
        .collect()
}

/// Corrects the whole batch as one family.
#[must_use]
pub fn correct(results: &[HypothesisResult]) -> BatchReport {
    correct_with_scope(results, CorrectionScope::Batch)
}

/// Corrects `results` with the given family definition.
///
/// The report is sorted by adjusted p-value ascending; equal values keep
/// family and rank order.
#[must_use]
pub fn correct_with_scope(results: &[HypothesisResult], scope: CorrectionScope) -> BatchReport {
    let families: Vec<Vec<&HypothesisResult>> = match scope {
        CorrectionScope::Batch => vec![results.iter().collect()],
        CorrectionScope::PerPairing => {
            let mut by_label: BTreeMap<&str, Vec<&HypothesisResult>> = BTreeMap::new();
            for result in results {
                by_label.entry(result.pairing.as_str()).or_default().push(result);
            }
            by_label.into_values().collect()
        }
    };

    let mut records = Vec::with_capacity(results.len());
    for family in families {
        let p_values: Vec<f64> = family.iter().map(|r| r.p_value).collect();
        for (idx, rank, adjusted) in benjamini_hochberg(&p_values) {
            let result = family[idx];
            records.push(ReportRecord {
                unit: result.unit.clone(),
                pairing: result.pairing.clone(),
                foreground: result.foreground.clone(),
                null_model: result.null_model.clone(),
                alt_model: result.alt_model.clone(),
                statistic: result.statistic,
                df: result.degrees_of_freedom,
                p_value: result.p_value,
                adjusted_p_value: adjusted,
                rank,
                anomalous: result.anomalous,
            });
        }
    }
    records.sort_by(|a, b| a.adjusted_p_value.total_cmp(&b.adjusted_p_value));

    tracing::info!(tests = records.len(), ?scope, "Applied Benjamini-Hochberg correction");
    BatchReport { records, scope }
}
