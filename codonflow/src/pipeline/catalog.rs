//! The standard codon-model selection pipeline.

use super::StageSpec;
use crate::config::PipelineConfig;
use crate::core::ArtifactKind;
use crate::errors::CodonflowError;
use crate::stages::ControlSpec;

/// Sequence quality control.
pub const QC_STAGE: &str = "qc";
/// Codon-aware multiple alignment.
pub const ALIGN_STAGE: &str = "align";
/// Alignment trimming.
pub const TRIM_STAGE: &str = "trim";
/// Stop and ambiguous codon masking.
pub const MASK_STAGE: &str = "mask";
/// Recombination breakpoint detection.
pub const BREAKPOINTS_STAGE: &str = "breakpoints";
/// Tree inference.
pub const TREE_STAGE: &str = "tree";

/// Name of the likelihood stage for a model variant.
#[must_use]
pub fn model_stage_name(variant: &str) -> String {
    format!("ml_{variant}")
}

/// Builds the stage list described by `config`, in declaration order.
///
/// # Errors
///
/// Returns [`CodonflowError::Config`] if the control template cannot be read.
pub fn standard_stages(config: &PipelineConfig) -> Result<Vec<StageSpec>, CodonflowError> {
    let tools = &config.tools;
    let mut stages = vec![
        StageSpec::new(QC_STAGE, tools.qc.clone())
            .with_input(ArtifactKind::RawSequences)
            .with_output(ArtifactKind::QcSequences),
        StageSpec::new(ALIGN_STAGE, tools.aligner.clone())
            .with_input(ArtifactKind::QcSequences)
            .with_produced_output(ArtifactKind::Alignment, tools.aligner_output.clone()),
        StageSpec::new(TRIM_STAGE, tools.trimmer.clone())
            .with_input(ArtifactKind::Alignment)
            .with_output(ArtifactKind::TrimmedAlignment),
        StageSpec::new(MASK_STAGE, tools.masker.clone())
            .with_input(ArtifactKind::TrimmedAlignment)
            .with_output(ArtifactKind::MaskedAlignment),
    ];

    if config.recombination {
        stages.push(
            StageSpec::new(BREAKPOINTS_STAGE, tools.breakpoints.clone())
                .with_input(ArtifactKind::MaskedAlignment)
                .with_output(ArtifactKind::BreakpointReport)
                .partitioning(),
        );
    }

    stages.push(
        StageSpec::new(TREE_STAGE, tools.tree_builder.clone())
            .with_input(ArtifactKind::MaskedAlignment)
            .with_produced_output(ArtifactKind::Tree, tools.tree_output.clone()),
    );

    let template = config.control_template_text()?;
    for model in &config.models {
        let control = model
            .overrides
            .iter()
            .fold(ControlSpec::new(template.clone()), |spec, (key, value)| {
                spec.with_override(key.clone(), value.clone())
            });
        let mut stage = StageSpec::new(model_stage_name(&model.name), tools.likelihood.clone())
            .with_input(ArtifactKind::MaskedAlignment)
            .with_input(ArtifactKind::Tree)
            .with_output(ArtifactKind::ModelReport(model.name.clone()))
            .with_control(control);
        if let Some(label) = &model.model_label {
            stage = stage.with_model_label(label.clone());
        }
        if model.foreground {
            stage = stage.per_foreground();
        }
        stages.push(stage);
    }

    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelVariantConfig;
    use crate::pipeline::StageGraph;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_catalog_order() {
        let graph = StageGraph::build(standard_stages(&PipelineConfig::default()).unwrap()).unwrap();
        assert_eq!(
            graph.execution_order(),
            vec!["qc", "align", "trim", "mask", "tree", "ml_site"]
        );
        assert_eq!(graph.stages()[3].inputs, vec![ArtifactKind::TrimmedAlignment]);
        assert_eq!(graph.stages()[4].inputs, vec![ArtifactKind::MaskedAlignment]);

        let ml = &graph.stages()[5];
        assert!(!ml.foreground);
        let control = ml.control.as_ref().unwrap();
        assert_eq!(control.overrides["NSsites"], "0 1 2 3 7 8");
        assert_eq!(ml.report_kind(), Some(&ArtifactKind::ModelReport("site".into())));
    }

    #[test]
    fn test_recombination_inserts_partitioning_stage() {
        let config = PipelineConfig {
            recombination: true,
            ..PipelineConfig::default()
        };
        let graph = StageGraph::build(standard_stages(&config).unwrap()).unwrap();
        assert_eq!(
            graph.execution_order(),
            vec!["qc", "align", "trim", "mask", "breakpoints", "tree", "ml_site"]
        );
        assert!(graph.stages()[4].partitions);
        assert_eq!(graph.stages()[4].inputs, vec![ArtifactKind::MaskedAlignment]);
    }

    #[test]
    fn test_model_variants_become_stages() {
        let mut config = PipelineConfig::default();
        config.models.push(
            ModelVariantConfig::new("branch_site_null")
                .with_model_label("BS_NULL")
                .with_foreground()
                .with_override("fix_omega", "1"),
        );
        let stages = standard_stages(&config).unwrap();
        let last = stages.last().unwrap();
        assert_eq!(last.name, "ml_branch_site_null");
        assert_eq!(last.model_label.as_deref(), Some("BS_NULL"));
        assert!(last.foreground);
        assert!(StageGraph::build(stages).is_ok());
    }
}
