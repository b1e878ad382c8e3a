//! End-to-end batch runs.
//!
//! [`BatchRunner`] scans the input tree, builds and validates the stage graph,
//! drives the controller and, when every stage completed, turns the model
//! reports of the surviving units into a corrected batch report.

use crate::analysis::{correct_with_scope, BatchReport, HypothesisTester, ModelRun, ResultExtractor};
use crate::config::PipelineConfig;
use crate::core::{ArtifactKey, ArtifactKind, ArtifactStore, UnitId};
use crate::errors::CodonflowError;
use crate::events::{EventSink, NoOpEventSink};
use crate::pipeline::{
    standard_stages, FanOutScheduler, LedgerSummary, PipelineController, RunLedger, RunOutcome, StageGraph,
    StageSpec, LEDGER_FILE,
};
use crate::registry::UnitRegistry;
use crate::stages::{ProcessToolRunner, StageExecutor, ToolRunner};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// What a run would do, without running anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPlan {
    /// Registered units.
    pub units: Vec<UnitId>,
    /// Stage names in execution order.
    pub stages: Vec<String>,
}

/// Everything a finished batch produced.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// The run id stamped on every ledger entry.
    pub run_id: Uuid,
    /// Controller outcome.
    pub run: RunOutcome,
    /// Corrected report; present only for a completed run.
    pub report: Option<BatchReport>,
    /// Where the report was written.
    pub report_paths: Vec<PathBuf>,
    /// The ledger file.
    pub ledger_path: PathBuf,
    /// Ledger counts.
    pub ledger: LedgerSummary,
}

/// Runs one batch as configured.
pub struct BatchRunner {
    config: PipelineConfig,
    runner: Arc<dyn ToolRunner>,
    sink: Arc<dyn EventSink>,
    stages: Option<Vec<StageSpec>>,
    extractor: ResultExtractor,
}

impl std::fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRunner")
            .field("config", &self.config)
            .field("custom_stages", &self.stages.is_some())
            .finish_non_exhaustive()
    }
}

impl BatchRunner {
    /// Creates a runner that spawns real tool processes.
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            runner: Arc::new(ProcessToolRunner),
            sink: Arc::new(NoOpEventSink),
            stages: None,
            extractor: ResultExtractor::new(),
        }
    }

    /// Replaces the tool runner.
    #[must_use]
    pub fn with_tool_runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Uses `stages` instead of the standard catalog.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<StageSpec>) -> Self {
        self.stages = Some(stages);
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn build_graph(&self) -> Result<StageGraph, CodonflowError> {
        let stages = match &self.stages {
            Some(stages) => stages.clone(),
            None => standard_stages(&self.config)?,
        };
        StageGraph::build(stages)
    }

    /// Validates the configuration, scans units and builds the stage graph.
    ///
    /// # Errors
    ///
    /// Returns the first configuration, discovery or graph error.
    pub fn plan(&self) -> Result<BatchPlan, CodonflowError> {
        self.config.validate()?;
        let registry = UnitRegistry::scan(&self.config.input_dir, &self.config.unit_regex()?)?;
        let graph = self.build_graph()?;
        Ok(BatchPlan {
            units: registry.ids(),
            stages: graph.execution_order().into_iter().map(String::from).collect(),
        })
    }

    /// Runs the batch.
    ///
    /// Unit-level failures are recorded in the ledger. The report is written
    /// only when the controller completed.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid configuration, no units, an invalid
    /// stage graph, or a failure to create the work directory or write the
    /// report. An aborted run is not an error here; see [`RunOutcome::error`].
    pub async fn run(&self) -> Result<BatchOutcome, CodonflowError> {
        self.config.validate()?;
        let input_dir = fs::canonicalize(&self.config.input_dir)?;
        fs::create_dir_all(&self.config.work_dir)?;
        let work_dir = fs::canonicalize(&self.config.work_dir)?;

        let registry = Arc::new(UnitRegistry::scan(&input_dir, &self.config.unit_regex()?)?);
        let graph = self.build_graph()?;

        let store = Arc::new(ArtifactStore::new(&work_dir));
        for unit in registry.units() {
            store.register(&unit.id, ArtifactKind::RawSequences, unit.source);
        }

        let run_id = Uuid::new_v4();
        let ledger_path = work_dir.join(LEDGER_FILE);
        let ledger = Arc::new(RunLedger::with_file(run_id, &ledger_path));

        let executor = StageExecutor::new(Arc::clone(&store), Arc::clone(&self.runner))
            .with_event_sink(Arc::clone(&self.sink))
            .with_producers(graph.producers().clone())
            .with_timeout(self.config.unit_timeout())
            .with_threads(self.config.threads_per_unit);
        let controller = PipelineController::new(
            graph,
            FanOutScheduler::new(Arc::new(executor)),
            Arc::clone(&registry),
            Arc::clone(&ledger),
        )
        .with_event_sink(Arc::clone(&self.sink))
        .with_concurrency(self.config.concurrency());

        let run = controller.run().await;

        let mut report = None;
        let mut report_paths = Vec::new();
        if run.is_completed() {
            let batch = self.analyze(controller.graph(), &store, &ledger, &run.units);
            report_paths = self.write_report(&batch, &work_dir)?;
            report = Some(batch);
        }

        Ok(BatchOutcome {
            run_id,
            run,
            report,
            report_paths,
            ledger_path,
            ledger: ledger.summary(),
        })
    }

    /// Extracts, tests and corrects the results of `units`.
    fn analyze(&self, graph: &StageGraph, store: &ArtifactStore, ledger: &RunLedger, units: &[UnitId]) -> BatchReport {
        let mut results = Vec::new();
        for unit in units {
            let runs = self.extract_unit(graph, store, ledger, unit);
            for tested in HypothesisTester::test_unit(&self.config.pairings, unit, &runs) {
                match tested {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        tracing::warn!(unit = %unit, error = %e, "Pairing excluded");
                        if let Err(io) = ledger.record_exclusion(unit, "test", e.kind(), e.to_string()) {
                            tracing::warn!(error = %io, "Failed to append ledger entry");
                        }
                    }
                }
            }
        }
        correct_with_scope(&results, self.config.correction)
    }

    fn extract_unit(&self, graph: &StageGraph, store: &ArtifactStore, ledger: &RunLedger, unit: &UnitId) -> Vec<ModelRun> {
        let mut runs = Vec::new();
        for stage in graph.stages() {
            let Some(kind) = stage.report_kind() else { continue };
            let path = store.path(&ArtifactKey::new(unit.clone(), &stage.name, kind.clone()));
            match self.extractor.extract(unit, stage.model_label.as_deref(), &path) {
                Ok(found) => runs.extend(found),
                Err(e) => {
                    tracing::warn!(unit = %unit, stage = %stage.name, error = %e, "Report excluded");
                    if let Err(io) = ledger.record_exclusion(unit, "extract", e.kind(), e.to_string()) {
                        tracing::warn!(error = %io, "Failed to append ledger entry");
                    }
                }
            }
        }
        runs
    }

    fn write_report(&self, report: &BatchReport, work_dir: &Path) -> Result<Vec<PathBuf>, CodonflowError> {
        let tsv = work_dir.join(format!("{}.tsv", self.config.report_name));
        let json = work_dir.join(format!("{}.json", self.config.report_name));
        report.write_tsv(&tsv)?;
        report.write_json(&json)?;
        tracing::info!(
            tests = report.len(),
            significant = report.significant(0.05).len(),
            path = %tsv.display(),
            "Batch report written"
        );
        Ok(vec![tsv, json])
    }
}
