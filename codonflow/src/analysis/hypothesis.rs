//! Likelihood-ratio tests between nested model runs.

use super::ModelRun;
use crate::core::UnitId;
use crate::errors::HypothesisError;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// A named null/alternative model pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPairing {
    /// Label written to the report, e.g. `M7_vs_M8`.
    pub label: String,
    /// Model label of the constrained model.
    pub null: String,
    /// Model label of the general model.
    pub alternative: String,
}

impl ModelPairing {
    /// Creates a pairing labelled `<null>_vs_<alternative>`.
    #[must_use]
    pub fn new(null: impl Into<String>, alternative: impl Into<String>) -> Self {
        let null = null.into();
        let alternative = alternative.into();
        Self {
            label: format!("{null}_vs_{alternative}"),
            null,
            alternative,
        }
    }
}

/// The standard site, branch and branch-site pairings.
#[must_use]
pub fn default_pairings() -> Vec<ModelPairing> {
    vec![
        ModelPairing::new("M0", "M1"),
        ModelPairing::new("M1", "M2"),
        ModelPairing::new("M0", "M3"),
        ModelPairing::new("M7", "M8"),
        ModelPairing::new("M0", "B"),
        ModelPairing::new("BS_NULL", "BS"),
    ]
}

/// One likelihood-ratio test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisResult {
    /// The unit both runs belong to.
    pub unit: UnitId,
    /// Pairing label.
    pub pairing: String,
    /// Null model label.
    pub null_model: String,
    /// Alternative model label.
    pub alt_model: String,
    /// `2 * (alt.lnL - null.lnL)`.
    pub statistic: f64,
    /// Parameter count difference.
    pub degrees_of_freedom: u32,
    /// Upper-tail chi-squared probability.
    pub p_value: f64,
    /// The alternative fit worse than the null.
    pub anomalous: bool,
    /// Foreground lineage of a branch or branch-site test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreground: Option<String>,
}

/// Computes likelihood-ratio statistics and chi-squared p-values.
#[derive(Debug, Clone, Copy, Default)]
pub struct HypothesisTester;

impl HypothesisTester {
    /// Tests `alt` against the nested `null`, using the default pairing label.
    ///
    /// # Errors
    ///
    /// Returns [`HypothesisError::InvalidNesting`] if the alternative does not
    /// have more free parameters than the null.
    pub fn test(null: &ModelRun, alt: &ModelRun) -> Result<HypothesisResult, HypothesisError> {
        Self::test_pairing(&ModelPairing::new(&null.label, &alt.label), null, alt)
    }

    /// Tests one pairing.
    ///
    /// A negative statistic is reported with `p = 1.0` and flagged anomalous.
    /// A null without a foreground lineage may be compared with any
    /// alternative of the same unit.
    ///
    /// # Errors
    ///
    /// Returns [`HypothesisError::UnitMismatch`] if the runs belong to
    /// different units, [`HypothesisError::ForegroundMismatch`] if both mark a
    /// foreground lineage and the lineages differ, and
    /// [`HypothesisError::InvalidNesting`] if the alternative does not have
    /// more free parameters than the null.
    pub fn test_pairing(
        pairing: &ModelPairing,
        null: &ModelRun,
        alt: &ModelRun,
    ) -> Result<HypothesisResult, HypothesisError> {
        if null.unit != alt.unit {
            return Err(HypothesisError::UnitMismatch {
                null: null.label.clone(),
                alternative: alt.label.clone(),
                null_unit: null.unit.to_string(),
                alt_unit: alt.unit.to_string(),
            });
        }
        if let (Some(null_foreground), Some(alt_foreground)) = (&null.foreground, &alt.foreground) {
            if null_foreground != alt_foreground {
                return Err(HypothesisError::ForegroundMismatch {
                    unit: alt.unit.to_string(),
                    null_foreground: null_foreground.clone(),
                    alt_foreground: alt_foreground.clone(),
                });
            }
        }
        if alt.parameter_count <= null.parameter_count {
            return Err(HypothesisError::InvalidNesting {
                unit: alt.unit.to_string(),
                null: null.label.clone(),
                alternative: alt.label.clone(),
                null_params: null.parameter_count,
                alt_params: alt.parameter_count,
            });
        }
        let degrees_of_freedom = alt.parameter_count - null.parameter_count;
        let statistic = 2.0 * (alt.log_likelihood - null.log_likelihood);

        let anomalous = statistic < 0.0;
        let p_value = if anomalous {
            1.0
        } else {
            ChiSquared::new(f64::from(degrees_of_freedom)).map_or(1.0, |dist| dist.sf(statistic))
        };
        if anomalous {
            tracing::warn!(
                unit = %alt.unit,
                pairing = %pairing.label,
                statistic,
                "Alternative model fits worse than the null"
            );
        }

        Ok(HypothesisResult {
            unit: alt.unit.clone(),
            pairing: pairing.label.clone(),
            null_model: null.label.clone(),
            alt_model: alt.label.clone(),
            statistic,
            degrees_of_freedom,
            p_value,
            anomalous,
            foreground: alt.foreground.clone().or_else(|| null.foreground.clone()),
        })
    }

    /// Forms and tests every pairing whose two models exist for `unit`.
    ///
    /// Pairings with an absent model are not formed. An alternative fitted
    /// per foreground lineage is tested once per lineage, against the null of
    /// the same lineage or else a null without one. When a label occurs more
    /// than once for the same lineage, the first run wins.
    pub fn test_unit(
        pairings: &[ModelPairing],
        unit: &UnitId,
        runs: &[ModelRun],
    ) -> Vec<Result<HypothesisResult, HypothesisError>> {
        fn of_unit<'a>(runs: &'a [ModelRun], unit: &'a UnitId, label: &'a str) -> impl Iterator<Item = &'a ModelRun> {
            runs.iter().filter(move |r| r.unit == *unit && r.label == label)
        }

        let mut results = Vec::new();
        for pairing in pairings {
            let mut seen: Vec<Option<&str>> = Vec::new();
            for alt in of_unit(runs, unit, &pairing.alternative) {
                let foreground = alt.foreground.as_deref();
                if seen.contains(&foreground) {
                    continue;
                }
                seen.push(foreground);
                let null = of_unit(runs, unit, &pairing.null)
                    .find(|r| r.foreground.as_deref() == foreground)
                    .or_else(|| of_unit(runs, unit, &pairing.null).find(|r| r.foreground.is_none()));
                if let Some(null) = null {
                    results.push(Self::test_pairing(pairing, null, alt));
                }
            }
        }
        results
    }
}
