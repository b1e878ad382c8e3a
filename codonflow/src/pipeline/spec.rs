//! Stage specifications.

use crate::core::ArtifactKind;
use crate::errors::{ContractErrorInfo, PipelineValidationError};
use crate::stages::{placeholders, CommandTemplate, ControlSpec, Placeholder};
use serde::{Deserialize, Serialize};

/// One declared output of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// The artifact kind.
    pub kind: ArtifactKind,
    /// Where the tool writes the file when it does not take an explicit
    /// output path, e.g. `{prefix}.best.fas`. The executor moves it to the
    /// canonical artifact path afterwards.
    pub produced_as: Option<String>,
}

/// Specification for a single stage in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// Required input kinds.
    pub inputs: Vec<ArtifactKind>,
    /// Produced outputs.
    pub outputs: Vec<OutputSpec>,
    /// Output whose presence marks the stage done for a unit. Defaults to the first output.
    pub marker: Option<ArtifactKind>,
    /// The external tool invocation.
    pub command: CommandTemplate,
    /// Control file rendered before the tool runs.
    pub control: Option<ControlSpec>,
    /// Split units into recombination blocks after this stage.
    pub partitions: bool,
    /// Run the tool once per foreground lineage of the input tree.
    pub foreground: bool,
    /// Model label for reports that describe a single model.
    pub model_label: Option<String>,
}

impl StageSpec {
    /// Creates a new stage specification.
    #[must_use]
    pub fn new(name: impl Into<String>, command: CommandTemplate) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            marker: None,
            command,
            control: None,
            partitions: false,
            foreground: false,
            model_label: None,
        }
    }

    /// Adds a required input kind.
    #[must_use]
    pub fn with_input(mut self, kind: ArtifactKind) -> Self {
        self.inputs.push(kind);
        self
    }

    /// Adds an output written at its canonical path.
    #[must_use]
    pub fn with_output(mut self, kind: ArtifactKind) -> Self {
        self.outputs.push(OutputSpec { kind, produced_as: None });
        self
    }

    /// Adds an output the tool writes under a name derived from a template.
    #[must_use]
    pub fn with_produced_output(mut self, kind: ArtifactKind, produced_as: impl Into<String>) -> Self {
        self.outputs.push(OutputSpec {
            kind,
            produced_as: Some(produced_as.into()),
        });
        self
    }

    /// Sets the completion marker.
    #[must_use]
    pub fn with_marker(mut self, kind: ArtifactKind) -> Self {
        self.marker = Some(kind);
        self
    }

    /// Sets the control file spec.
    #[must_use]
    pub fn with_control(mut self, control: ControlSpec) -> Self {
        self.control = Some(control);
        self
    }

    /// Marks the stage as the recombination partitioning point.
    #[must_use]
    pub fn partitioning(mut self) -> Self {
        self.partitions = true;
        self
    }

    /// Runs the tool once per foreground lineage and joins the reports.
    #[must_use]
    pub fn per_foreground(mut self) -> Self {
        self.foreground = true;
        self
    }

    /// Sets the single-model label used when extracting results.
    #[must_use]
    pub fn with_model_label(mut self, label: impl Into<String>) -> Self {
        self.model_label = Some(label.into());
        self
    }

    /// Returns the effective completion marker.
    #[must_use]
    pub fn marker(&self) -> Option<&ArtifactKind> {
        self.marker.as_ref().or_else(|| self.outputs.first().map(|o| &o.kind))
    }

    /// Returns the output kinds.
    #[must_use]
    pub fn output_kinds(&self) -> Vec<ArtifactKind> {
        self.outputs.iter().map(|o| o.kind.clone()).collect()
    }

    /// Returns the model report produced by this stage, if any.
    #[must_use]
    pub fn report_kind(&self) -> Option<&ArtifactKind> {
        self.outputs
            .iter()
            .map(|o| &o.kind)
            .find(|k| matches!(k, ArtifactKind::ModelReport(_)))
    }

    fn invalid(&self, message: String) -> PipelineValidationError {
        PipelineValidationError::new(message).with_stages(vec![self.name.clone()])
    }

    /// Validates the stage specification in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage has no outputs, consumes its own output,
    /// declares a marker it does not produce, or uses a placeholder that is
    /// unknown or not backed by a declared artifact.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() || self.name.contains(['/', '\\']) {
            return Err(self.invalid(format!("Invalid stage name '{}'", self.name)));
        }
        if self.outputs.is_empty() {
            return Err(self.invalid(format!("Stage '{}' declares no outputs", self.name)));
        }

        let outputs = self.output_kinds();
        if let Some(kind) = self.inputs.iter().find(|k| outputs.contains(k)) {
            return Err(self.invalid(format!("Stage '{}' cannot consume its own output '{kind}'", self.name)));
        }
        if let Some(marker) = &self.marker {
            if !outputs.contains(marker) {
                return Err(self.invalid(format!(
                    "Stage '{}' marker '{marker}' is not one of its outputs",
                    self.name
                )));
            }
        }

        let used = self.command.placeholders().map_err(|e| {
            self.invalid(format!("Stage '{}': {e}", self.name)).with_error_info(
                ContractErrorInfo::new("CONTRACT-003-PLACEHOLDER", e)
                    .with_fix_hint("Use {input:<kind>}, {output:<kind>}, {prefix}, {workdir}, {unit}, {threads} or {control}."),
            )
        })?;
        for placeholder in used {
            let ok = match &placeholder {
                Placeholder::Input(kind) => self.inputs.contains(kind),
                Placeholder::Output(kind) => outputs.contains(kind),
                Placeholder::Control => self.control.is_some(),
                _ => true,
            };
            if !ok {
                return Err(self.invalid(format!(
                    "Stage '{}' uses {placeholder:?} without declaring it",
                    self.name
                )));
            }
        }

        for output in &self.outputs {
            let Some(template) = &output.produced_as else { continue };
            let used = placeholders(template).map_err(|e| self.invalid(format!("Stage '{}': {e}", self.name)))?;
            if used
                .iter()
                .any(|p| !matches!(p, Placeholder::Prefix | Placeholder::Workdir | Placeholder::Unit))
            {
                return Err(self.invalid(format!(
                    "Stage '{}' output '{}' may only use {{prefix}}, {{workdir}} or {{unit}}",
                    self.name, output.kind
                )));
            }
        }

        if self.control.is_some() && !self.inputs.iter().any(ArtifactKind::is_sequence_data) {
            return Err(self.invalid(format!(
                "Stage '{}' renders a control file but has no alignment input",
                self.name
            )));
        }
        if self.partitions
            && (!outputs.contains(&ArtifactKind::BreakpointReport)
                || !self.inputs.iter().any(ArtifactKind::is_sequence_data))
        {
            return Err(self.invalid(format!(
                "Partitioning stage '{}' must read an alignment and produce a breakpoint report",
                self.name
            )));
        }
        if self.foreground {
            let single_report = self.outputs.len() == 1 && self.report_kind().is_some();
            if !single_report || !self.inputs.contains(&ArtifactKind::Tree) || self.control.is_none() || self.partitions {
                return Err(self.invalid(format!(
                    "Foreground stage '{}' must read a tree, render a control file and produce exactly one model report",
                    self.name
                )));
            }
        }
        Ok(())
    }
}
