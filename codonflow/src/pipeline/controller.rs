//! The pipeline controller.
//!
//! Stages run strictly one after another over the set of active units. A
//! unit that fails a stage drops out of every later stage but stays in the
//! registry for reporting. A stage in which no unit succeeds aborts the run.

use super::{FanOutScheduler, LedgerEntry, LedgerStatus, RunLedger, StageGraph, StageSpec};
use crate::core::{ArtifactKey, ArtifactKind, ArtifactStore, UnitId, UnitStatus};
use crate::errors::CodonflowError;
use crate::events::{names, EventSink, NoOpEventSink};
use crate::partition::{partition_unit, BlockFate};
use crate::registry::UnitRegistry;
use crate::utils::elapsed_ms;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Lifecycle of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    /// Nothing dispatched yet.
    NotStarted,
    /// The stage at this ordinal is in flight.
    StageRunning {
        /// Ordinal of the running stage.
        stage_index: usize,
    },
    /// Every stage finished with at least one surviving unit.
    Completed,
    /// A stage ended with no successful unit.
    Aborted {
        /// Ordinal of the stage that failed for every unit.
        stage_index: usize,
        /// Its name.
        stage: String,
        /// Why the run stopped.
        reason: String,
    },
}

impl RunState {
    /// True for `Completed` and `Aborted`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted { .. })
    }
}

/// What a finished run leaves behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Terminal state.
    pub state: RunState,
    /// Units that made it through every stage.
    pub units: Vec<UnitId>,
    /// Units that dropped out, sorted.
    pub failed: Vec<UnitId>,
    /// Wall time of the run in milliseconds.
    pub duration_ms: f64,
}

impl RunOutcome {
    /// True if the run completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }

    /// The fatal error for an aborted run.
    #[must_use]
    pub fn error(&self) -> Option<CodonflowError> {
        match &self.state {
            RunState::Aborted { stage_index, stage, .. } => Some(CodonflowError::StageAllFailed {
                stage_index: *stage_index,
                stage: stage.clone(),
            }),
            _ => None,
        }
    }
}

/// Sequences the stages of a validated graph over the registered units.
pub struct PipelineController {
    graph: StageGraph,
    scheduler: FanOutScheduler,
    registry: Arc<UnitRegistry>,
    ledger: Arc<RunLedger>,
    sink: Arc<dyn EventSink>,
    concurrency: usize,
    state: RwLock<RunState>,
}

impl std::fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineController")
            .field("stages", &self.graph.execution_order())
            .field("concurrency", &self.concurrency)
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl PipelineController {
    /// Creates a controller.
    #[must_use]
    pub fn new(
        graph: StageGraph,
        scheduler: FanOutScheduler,
        registry: Arc<UnitRegistry>,
        ledger: Arc<RunLedger>,
    ) -> Self {
        Self {
            graph,
            scheduler,
            registry,
            ledger,
            sink: Arc::new(NoOpEventSink),
            concurrency: super::default_concurrency(),
            state: RwLock::new(RunState::NotStarted),
        }
    }

    /// Sets the event sink for pipeline, stage and partition events.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the number of units allowed in flight at once.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.state.read().clone()
    }

    /// Returns the stage graph.
    #[must_use]
    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    fn store(&self) -> &Arc<ArtifactStore> {
        self.scheduler.executor().store()
    }

    fn set_state(&self, state: RunState) {
        *self.state.write() = state;
    }

    /// Runs every stage over the registered units.
    ///
    /// Unit failures are recorded in the ledger and never returned as errors.
    /// The outcome carries `Aborted` when a stage failed for every unit.
    pub async fn run(&self) -> RunOutcome {
        let start = Instant::now();
        let mut active = self.registry.ids();
        let mut failed = Vec::new();

        tracing::info!(
            run_id = %self.ledger.run_id(),
            units = active.len(),
            stages = ?self.graph.execution_order(),
            concurrency = self.concurrency,
            "Pipeline started"
        );
        self.sink.try_emit(
            names::PIPELINE_STARTED,
            Some(serde_json::json!({
                "run_id": self.ledger.run_id().to_string(),
                "units": active.len(),
                "stages": self.graph.execution_order(),
            })),
        );

        for (index, stage) in self.graph.stages().iter().enumerate() {
            self.set_state(RunState::StageRunning { stage_index: index });
            let stage_start = Instant::now();
            self.sink.try_emit(
                names::STAGE_STARTED,
                Some(serde_json::json!({
                    "stage": stage.name,
                    "stage_index": index,
                    "units": active.len(),
                })),
            );
            for unit in &active {
                self.registry.mark_running(unit, &stage.name);
            }

            let results = self
                .scheduler
                .run_stage(Arc::new(stage.clone()), &active, self.concurrency)
                .await;

            let mut survivors = Vec::with_capacity(results.len());
            for result in &results {
                if let Err(e) = self.ledger.record_stage_result(index, result) {
                    tracing::warn!(error = %e, unit = %result.unit, "Failed to append ledger entry");
                }
                self.registry.mark_finished(
                    &result.unit,
                    result.outcome.status(),
                    result.outcome.failure_message(),
                    result.artifacts(),
                );
                if result.outcome.is_success() {
                    survivors.push(result.unit.clone());
                } else {
                    failed.push(result.unit.clone());
                }
            }

            let stage_failed = results.len() - survivors.len();
            tracing::info!(
                stage = %stage.name,
                stage_index = index,
                succeeded = survivors.len(),
                failed = stage_failed,
                "Stage completed"
            );
            self.sink.try_emit(
                names::STAGE_COMPLETED,
                Some(serde_json::json!({
                    "stage": stage.name,
                    "stage_index": index,
                    "succeeded": survivors.len(),
                    "failed": stage_failed,
                    "duration_ms": elapsed_ms(stage_start),
                })),
            );

            if survivors.is_empty() {
                let reason = format!("all {} units failed", results.len());
                return self.abort(index, &stage.name, reason, failed, start);
            }

            if stage.partitions {
                survivors = self.partition(stage, survivors, &mut failed).await;
                if survivors.is_empty() {
                    let reason = "no recombination block survived partitioning".to_string();
                    return self.abort(index, &stage.name, reason, failed, start);
                }
            }
            active = survivors;
        }

        self.set_state(RunState::Completed);
        failed.sort();
        failed.dedup();
        tracing::info!(units = active.len(), failed = failed.len(), "Pipeline completed");
        self.sink.try_emit(
            names::PIPELINE_COMPLETED,
            Some(serde_json::json!({
                "units": active.len(),
                "failed": failed.len(),
                "duration_ms": elapsed_ms(start),
            })),
        );
        RunOutcome {
            state: RunState::Completed,
            units: active,
            failed,
            duration_ms: elapsed_ms(start),
        }
    }

    fn abort(&self, index: usize, stage: &str, reason: String, mut failed: Vec<UnitId>, start: Instant) -> RunOutcome {
        let error = CodonflowError::StageAllFailed {
            stage_index: index,
            stage: stage.to_string(),
        };
        tracing::error!(error = %error, reason = %reason, "Pipeline aborted");
        let data = serde_json::json!({
            "stage": stage,
            "stage_index": index,
            "reason": reason,
        });
        self.sink.try_emit(names::STAGE_ABORTED, Some(data.clone()));
        self.sink.try_emit(names::PIPELINE_ABORTED, Some(data));

        let state = RunState::Aborted {
            stage_index: index,
            stage: stage.to_string(),
            reason,
        };
        self.set_state(state.clone());
        failed.sort();
        failed.dedup();
        RunOutcome {
            state,
            units: Vec::new(),
            failed,
            duration_ms: elapsed_ms(start),
        }
    }

    /// Splits each unit into its recombination blocks.
    ///
    /// Returns the block units that replace their parents downstream.
    async fn partition(&self, stage: &StageSpec, units: Vec<UnitId>, failed: &mut Vec<UnitId>) -> Vec<UnitId> {
        let Some(sequence_kind) = stage.inputs.iter().find(|k| k.is_sequence_data()).cloned() else {
            return units;
        };
        let producer = self.graph.producers().get(&sequence_kind).cloned();

        let mut blocks = Vec::new();
        for unit in units {
            let report = self.store().path(&ArtifactKey::new(
                unit.clone(),
                &stage.name,
                ArtifactKind::BreakpointReport,
            ));
            let Some(alignment) = self.store().resolve(&unit, &sequence_kind, producer.as_deref()) else {
                self.partition_failed(&unit, "no alignment to partition".to_string(), failed);
                continue;
            };

            let store = Arc::clone(self.store());
            let parent = unit.clone();
            let split = tokio::task::spawn_blocking(move || partition_unit(&store, &parent, &alignment, &report)).await;
            let planned = match split {
                Ok(Ok(planned)) => planned,
                Ok(Err(e)) => {
                    self.partition_failed(&unit, e.to_string(), failed);
                    continue;
                }
                Err(e) => {
                    self.partition_failed(&unit, format!("partition task aborted: {e}"), failed);
                    continue;
                }
            };

            let mut kept = 0_usize;
            for block in planned {
                let block_id = unit.block(block.plan.index);
                match block.fate {
                    BlockFate::Kept { unit: id, path } => match self.registry.register_block(&unit, block.plan.index, path.clone()) {
                        Ok(_) => {
                            self.store().register(&id, sequence_kind.clone(), path);
                            blocks.push(id);
                            kept += 1;
                        }
                        Err(e) => self.record(
                            LedgerEntry::new(self.ledger.run_id(), &id, "partition", LedgerStatus::Failed)
                                .with_error("PartitionFailed", e.to_string()),
                        ),
                    },
                    BlockFate::Discarded { path, reason } => self.record(
                        LedgerEntry::new(self.ledger.run_id(), &block_id, "partition", LedgerStatus::Discarded)
                            .with_error("BlockDiscarded", format!("{reason} ({})", path.display())),
                    ),
                    BlockFate::TooShort => self.record(
                        LedgerEntry::new(self.ledger.run_id(), &block_id, "partition", LedgerStatus::Discarded)
                            .with_error("BlockTooShort", "shorter than one codon after trimming"),
                    ),
                }
            }

            if kept == 0 {
                tracing::warn!(unit = %unit, "No usable recombination block");
                self.record(
                    LedgerEntry::new(self.ledger.run_id(), &unit, "partition", LedgerStatus::Excluded)
                        .with_error("NoUsableBlocks", "every block was discarded"),
                );
            }
            tracing::debug!(unit = %unit, blocks = kept, "Partitioned");
            self.sink.try_emit(
                names::PARTITION_COMPLETED,
                Some(serde_json::json!({
                    "unit": unit.to_string(),
                    "blocks": kept,
                })),
            );
        }
        blocks.sort();
        blocks
    }

    fn partition_failed(&self, unit: &UnitId, message: String, failed: &mut Vec<UnitId>) {
        tracing::warn!(unit = %unit, error = %message, "Partitioning failed");
        self.registry
            .mark_finished(unit, UnitStatus::Failed, Some(message.clone()), &[]);
        self.record(
            LedgerEntry::new(self.ledger.run_id(), unit, "partition", LedgerStatus::Failed)
                .with_error("PartitionFailed", message),
        );
        failed.push(unit.clone());
    }

    fn record(&self, entry: LedgerEntry) {
        if let Err(e) = self.ledger.record(entry) {
            tracing::warn!(error = %e, "Failed to append ledger entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::stages::{CommandTemplate, StageExecutor};
    use crate::testing::{assert_ledger_has, ScriptedToolRunner};
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn stages() -> Vec<StageSpec> {
        vec![
            StageSpec::new("qc", CommandTemplate::new("qc", ["{input:raw_sequences}", "{output:qc_sequences}"]))
                .with_input(ArtifactKind::RawSequences)
                .with_output(ArtifactKind::QcSequences),
            StageSpec::new("align", CommandTemplate::new("align", ["{input:qc_sequences}", "{output:alignment}"]))
                .with_input(ArtifactKind::QcSequences)
                .with_output(ArtifactKind::Alignment),
        ]
    }

    struct Harness {
        controller: PipelineController,
        registry: Arc<UnitRegistry>,
        ledger: Arc<RunLedger>,
        sink: Arc<CollectingEventSink>,
    }

    fn harness(dir: &TempDir, units: &[(&str, bool)], tools: Arc<ScriptedToolRunner>) -> Harness {
        let store = Arc::new(ArtifactStore::new(dir.path()));
        let registry = Arc::new(UnitRegistry::new());
        for (name, with_source) in units {
            let source = dir.path().join(format!("{name}.fasta"));
            if *with_source {
                fs::write(&source, ">a\nATG\n").unwrap();
            }
            let id = UnitId::new(name);
            registry.insert(id.clone(), source.clone(), None).unwrap();
            store.register(&id, ArtifactKind::RawSequences, source);
        }
        let graph = StageGraph::build(stages()).unwrap();
        let executor = StageExecutor::new(store, tools).with_producers(graph.producers().clone());
        let ledger = Arc::new(RunLedger::new(Uuid::new_v4()));
        let sink = Arc::new(CollectingEventSink::new());
        let controller = PipelineController::new(
            graph,
            FanOutScheduler::new(Arc::new(executor)),
            Arc::clone(&registry),
            Arc::clone(&ledger),
        )
        .with_event_sink(sink.clone())
        .with_concurrency(2);
        Harness {
            controller,
            registry,
            ledger,
            sink,
        }
    }

    #[tokio::test]
    async fn test_run_completes_and_updates_registry() {
        let dir = TempDir::new().unwrap();
        let tools = Arc::new(ScriptedToolRunner::new());
        let h = harness(&dir, &[("A", true), ("B", true)], tools.clone());
        assert_eq!(h.controller.state(), RunState::NotStarted);

        let outcome = h.controller.run().await;

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(h.controller.state(), RunState::Completed);
        assert_eq!(outcome.units, vec![UnitId::new("A"), UnitId::new("B")]);
        assert!(outcome.error().is_none());
        let unit = h.registry.get(&UnitId::new("A")).unwrap();
        assert_eq!(unit.status, UnitStatus::Succeeded);
        assert_eq!(unit.current_stage.as_deref(), Some("align"));
        assert_eq!(unit.artifacts.len(), 2);
        assert_eq!(h.ledger.entries().len(), 4);
        assert_eq!(h.sink.count(names::STAGE_COMPLETED), 2);
        assert_eq!(h.sink.count(names::PIPELINE_STARTED), 1);
    }

    #[tokio::test]
    async fn test_failed_unit_is_carried_as_failed() {
        let dir = TempDir::new().unwrap();
        let tools = Arc::new(ScriptedToolRunner::new().fail_unit("qc", "B", 3));
        let h = harness(&dir, &[("A", true), ("B", true)], tools.clone());

        let outcome = h.controller.run().await;

        assert!(outcome.is_completed());
        assert_eq!(outcome.failed, vec![UnitId::new("B")]);
        assert!(!tools.was_invoked("align", "B"));
        assert_eq!(h.registry.get(&UnitId::new("B")).unwrap().status, UnitStatus::Failed);
        assert_eq!(h.registry.failed().len(), 1);
        assert_ledger_has(&h.ledger.entries(), "B", "qc", LedgerStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_inputs_everywhere_abort_first_stage() {
        let dir = TempDir::new().unwrap();
        let tools = Arc::new(ScriptedToolRunner::new());
        let h = harness(&dir, &[("A", false)], tools.clone());

        let outcome = h.controller.run().await;

        assert!(matches!(
            outcome.state,
            RunState::Aborted { stage_index: 0, ref stage, .. } if stage == "qc"
        ));
        assert!(matches!(
            outcome.error(),
            Some(CodonflowError::StageAllFailed { stage_index: 0, .. })
        ));
        assert!(tools.invocations().is_empty());
        assert_ledger_has(&h.ledger.entries(), "A", "qc", LedgerStatus::MissingDependency);
        assert_eq!(h.sink.count(names::STAGE_ABORTED), 1);
    }

    #[test]
    fn test_run_state_serializes_with_tag() {
        let state = RunState::Aborted {
            stage_index: 3,
            stage: "tree".to_string(),
            reason: "all 2 units failed".to_string(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "aborted");
        assert_eq!(json["stage_index"], 3);
        assert!(state.is_terminal());
        assert!(!RunState::StageRunning { stage_index: 1 }.is_terminal());
    }
}
