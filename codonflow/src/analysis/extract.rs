//! Recovery of log-likelihoods and parameter counts from model reports.
//!
//! Reports are free text. The only line that matters is the likelihood
//! declaration, `lnL(ntime: 15  np: 17):  -2345.678901  +0.000000`, and the
//! model header it belongs to. Two header layouts are recognised, each a
//! [`ReportLayout`]. A report joined from foreground lineage runs is split
//! at its section headers and each section parsed on its own.

use crate::core::UnitId;
use crate::errors::ExtractError;
use crate::foreground::split_sections;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static LNL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"lnL\(ntime:\s*\S+\s+np:\s*([^)\s]*)\s*\)\s*:\s*(\S+)").expect("static regex is valid")
});

static ENUMERATED_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:NSsites\s+)?Model\s+(\d+)\s*:").expect("static regex is valid"));

static SINGLE_HEADER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*Model:").expect("static regex is valid"));

/// One model fit for one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRun {
    /// The unit.
    pub unit: UnitId,
    /// Model label, e.g. `M7` or `BS_NULL`.
    pub label: String,
    /// Maximised log-likelihood.
    pub log_likelihood: f64,
    /// Number of free parameters.
    pub parameter_count: u32,
    /// The report the values came from.
    pub source: PathBuf,
    /// Lineage marked as foreground, for branch and branch-site fits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreground: Option<String>,
}

/// Input to a layout.
#[derive(Debug, Clone, Copy)]
pub struct ReportSource<'a> {
    /// The unit the report belongs to.
    pub unit: &'a UnitId,
    /// The report path, for error messages.
    pub path: &'a Path,
    /// The report text.
    pub text: &'a str,
    /// Label for reports that do not name their model.
    pub model_label: Option<&'a str>,
}

/// A known report layout.
pub trait ReportLayout: Send + Sync {
    /// Layout name for diagnostics.
    fn name(&self) -> &'static str;

    /// Parses `source`.
    ///
    /// Returns `None` if the layout's header line does not occur, so the
    /// next layout can be tried.
    fn parse(&self, source: &ReportSource<'_>) -> Option<Result<Vec<ModelRun>, ExtractError>>;
}

/// Reports with several numbered models (`Model 0:` ... `Model 8:`, optionally
/// prefixed by `NSsites`), as written by a multi-`NSsites` run.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnumeratedModelLayout;

impl ReportLayout for EnumeratedModelLayout {
    fn name(&self) -> &'static str {
        "enumerated"
    }

    fn parse(&self, source: &ReportSource<'_>) -> Option<Result<Vec<ModelRun>, ExtractError>> {
        let mut runs = Vec::new();
        let mut current: Option<String> = None;
        let mut seen_header = false;

        for line in source.text.lines() {
            if let Some(caps) = ENUMERATED_HEADER.captures(line) {
                if let Some(label) = current.take() {
                    return Some(Err(missing_lnl(source.path, &label)));
                }
                current = Some(format!("M{}", &caps[1]));
                seen_header = true;
                continue;
            }
            if let Some(label) = current.as_ref() {
                if LNL_LINE.is_match(line) {
                    match parse_lnl_line(source, label, line) {
                        Ok(run) => runs.push(run),
                        Err(e) => return Some(Err(e)),
                    }
                    current = None;
                }
            }
        }

        if !seen_header {
            return None;
        }
        if let Some(label) = current {
            return Some(Err(missing_lnl(source.path, &label)));
        }
        Some(Ok(runs))
    }
}

/// Reports of one model introduced by an unnumbered `Model:` line. The
/// label comes from the stage configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleModelLayout;

impl ReportLayout for SingleModelLayout {
    fn name(&self) -> &'static str {
        "single"
    }

    fn parse(&self, source: &ReportSource<'_>) -> Option<Result<Vec<ModelRun>, ExtractError>> {
        let mut lines = source.text.lines().skip_while(|line| !SINGLE_HEADER.is_match(line));
        lines.next()?;

        let label = source.model_label.map_or_else(
            || {
                source
                    .path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("model")
                    .to_string()
            },
            str::to_string,
        );
        let Some(line) = lines.find(|line| LNL_LINE.is_match(line)) else {
            return Some(Err(missing_lnl(source.path, &label)));
        };
        Some(parse_lnl_line(source, &label, line).map(|run| vec![run]))
    }
}

fn missing_lnl(path: &Path, label: &str) -> ExtractError {
    ExtractError::ParseFailure {
        path: path.to_path_buf(),
        field: "lnL",
        value: format!("no likelihood line after {label}"),
    }
}

fn parse_lnl_line(source: &ReportSource<'_>, label: &str, line: &str) -> Result<ModelRun, ExtractError> {
    let failure = |field: &'static str, value: &str| ExtractError::ParseFailure {
        path: source.path.to_path_buf(),
        field,
        value: value.to_string(),
    };
    let caps = LNL_LINE.captures(line).ok_or_else(|| failure("lnL", line.trim()))?;

    let np_text = &caps[1];
    let parameter_count = np_text.parse::<u32>().map_err(|_| failure("np", np_text))?;

    let lnl_text = &caps[2];
    let log_likelihood = lnl_text
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| failure("lnL", lnl_text))?;

    Ok(ModelRun {
        unit: source.unit.clone(),
        label: label.to_string(),
        log_likelihood,
        parameter_count,
        source: source.path.to_path_buf(),
        foreground: None,
    })
}

/// Tries each known layout in turn.
pub struct ResultExtractor {
    layouts: Vec<Box<dyn ReportLayout>>,
}

impl std::fmt::Debug for ResultExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.layouts.iter().map(|l| l.name()).collect();
        f.debug_struct("ResultExtractor").field("layouts", &names).finish()
    }
}

impl Default for ResultExtractor {
    fn default() -> Self {
        Self {
            layouts: vec![Box::new(EnumeratedModelLayout), Box::new(SingleModelLayout)],
        }
    }
}

impl ResultExtractor {
    /// Creates an extractor with the enumerated and single-model layouts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a layout, tried after the existing ones.
    #[must_use]
    pub fn with_layout(mut self, layout: impl ReportLayout + 'static) -> Self {
        self.layouts.push(Box::new(layout));
        self
    }

    /// Reads and parses the report at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::UnrecognizedFormat`] when no layout's header
    /// occurs, [`ExtractError::ParseFailure`] for a header without a usable
    /// likelihood line, and [`ExtractError::Io`] if the file cannot be read.
    pub fn extract(&self, unit: &UnitId, model_label: Option<&str>, path: &Path) -> Result<Vec<ModelRun>, ExtractError> {
        let bytes = fs::read(path).map_err(|e| ExtractError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let text = String::from_utf8_lossy(&bytes);
        self.extract_text(unit, model_label, path, &text)
    }

    /// Parses report text already in memory.
    ///
    /// # Errors
    ///
    /// As [`ResultExtractor::extract`], minus the IO case.
    pub fn extract_text(
        &self,
        unit: &UnitId,
        model_label: Option<&str>,
        path: &Path,
        text: &str,
    ) -> Result<Vec<ModelRun>, ExtractError> {
        let Some(sections) = split_sections(text) else {
            return self.parse(&ReportSource {
                unit,
                path,
                text,
                model_label,
            });
        };
        let mut runs = Vec::new();
        for (lineage, body) in sections {
            let found = self.parse(&ReportSource {
                unit,
                path,
                text: &body,
                model_label,
            })?;
            runs.extend(found.into_iter().map(|run| ModelRun {
                foreground: Some(lineage.clone()),
                ..run
            }));
        }
        Ok(runs)
    }

    fn parse(&self, source: &ReportSource<'_>) -> Result<Vec<ModelRun>, ExtractError> {
        for layout in &self.layouts {
            if let Some(parsed) = layout.parse(source) {
                tracing::debug!(unit = %source.unit, layout = layout.name(), "Parsed model report");
                return parsed;
            }
        }
        Err(ExtractError::UnrecognizedFormat {
            path: source.path.to_path_buf(),
        })
    }
}
