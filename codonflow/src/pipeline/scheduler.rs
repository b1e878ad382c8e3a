//! Fan-out of one stage over many units.

use super::StageSpec;
use crate::core::UnitId;
use crate::stages::{FailureReason, StageExecutor, StageOutcome, UnitStageResult};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Returns the default worker budget: the host's logical CPU count.
#[must_use]
pub fn default_concurrency() -> usize {
    num_cpus::get().max(1)
}

/// Runs a stage for every unit concurrently, bounded by a worker budget.
#[derive(Debug, Clone)]
pub struct FanOutScheduler {
    executor: Arc<StageExecutor>,
}

impl FanOutScheduler {
    /// Creates a scheduler dispatching through `executor`.
    #[must_use]
    pub fn new(executor: Arc<StageExecutor>) -> Self {
        Self { executor }
    }

    /// Returns the executor.
    #[must_use]
    pub fn executor(&self) -> &Arc<StageExecutor> {
        &self.executor
    }

    /// Runs `stage` for each unit with at most `concurrency` units in flight.
    ///
    /// Returns only once every dispatched unit has a terminal result. One
    /// unit failing, or even panicking, does not affect the others. Results
    /// are returned sorted by unit id.
    pub async fn run_stage(&self, stage: Arc<StageSpec>, units: &[UnitId], concurrency: usize) -> Vec<UnitStageResult> {
        let budget = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut in_flight = FuturesUnordered::new();

        for unit in units {
            let budget = Arc::clone(&budget);
            let executor = Arc::clone(&self.executor);
            let stage_for_task = Arc::clone(&stage);
            let unit_for_task = unit.clone();

            let handle = tokio::spawn(async move {
                // The semaphore is never closed, so acquire only fails if that changes.
                let Ok(_permit) = budget.acquire_owned().await else {
                    let log_path = executor.store().stage_dir(&unit_for_task, &stage_for_task.name);
                    return UnitStageResult::new(
                        unit_for_task,
                        &stage_for_task.name,
                        StageOutcome::Failed {
                            exit_code: None,
                            log_path,
                            reason: FailureReason::Setup("worker budget closed".to_string()),
                        },
                        0.0,
                    );
                };
                executor.execute(&stage_for_task, &unit_for_task).await
            });

            let unit = unit.clone();
            in_flight.push(async move { (unit, handle.await) });
        }

        let mut results = Vec::with_capacity(units.len());
        while let Some((unit, joined)) = in_flight.next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(stage = %stage.name, unit = %unit, error = %e, "Unit task aborted");
                    let log_path = self.executor.store().stage_dir(&unit, &stage.name).join(format!("{}.log", stage.name));
                    UnitStageResult::new(
                        unit,
                        &stage.name,
                        StageOutcome::Failed {
                            exit_code: None,
                            log_path,
                            reason: FailureReason::Panicked(e.to_string()),
                        },
                        0.0,
                    )
                }
            };
            results.push(result);
        }

        results.sort_by(|a, b| a.unit.cmp(&b.unit));
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ArtifactKind, ArtifactStore};
    use crate::stages::CommandTemplate;
    use crate::testing::ScriptedToolRunner;
    use std::time::Duration;
    use tempfile::TempDir;

    fn qc_stage() -> Arc<StageSpec> {
        Arc::new(
            StageSpec::new("qc", CommandTemplate::new("seqqc", ["{input:raw_sequences}", "{output:qc_sequences}"]))
                .with_input(ArtifactKind::RawSequences)
                .with_output(ArtifactKind::QcSequences),
        )
    }

    fn setup(n: usize, runner: Arc<ScriptedToolRunner>) -> (TempDir, FanOutScheduler, Vec<UnitId>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path().join("work")));
        let mut units = Vec::new();
        for i in 0..n {
            let unit = UnitId::new(format!("gene{i:02}"));
            let source = dir.path().join(format!("{unit}.fasta"));
            std::fs::write(&source, ">a\nATG\n").unwrap();
            store.register(&unit, ArtifactKind::RawSequences, source);
            units.push(unit);
        }
        let executor = Arc::new(StageExecutor::new(store, runner));
        (dir, FanOutScheduler::new(executor), units)
    }

    #[tokio::test]
    async fn test_concurrency_bound_is_respected() {
        let runner = Arc::new(ScriptedToolRunner::new().with_delay(Duration::from_millis(30)));
        let (_dir, scheduler, units) = setup(12, runner.clone());

        let results = scheduler.run_stage(qc_stage(), &units, 3).await;

        assert_eq!(results.len(), 12);
        assert!(results.iter().all(|r| r.outcome.is_success()));
        assert!(runner.max_concurrent() <= 3);
        assert!(runner.max_concurrent() >= 2);
    }

    #[tokio::test]
    async fn test_single_failure_does_not_halt_others() {
        let runner = Arc::new(ScriptedToolRunner::new().fail_unit("qc", "gene03", 1));
        let (_dir, scheduler, units) = setup(6, runner.clone());

        let results = scheduler.run_stage(qc_stage(), &units, 2).await;

        let failed: Vec<_> = results.iter().filter(|r| !r.outcome.is_success()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].unit.to_string(), "gene03");
        assert_eq!(runner.invocation_count("qc"), 6);
    }

    #[tokio::test]
    async fn test_results_are_terminal_and_sorted() {
        let runner = Arc::new(ScriptedToolRunner::new().with_delay(Duration::from_millis(5)));
        let (_dir, scheduler, units) = setup(5, runner);

        let results = scheduler.run_stage(qc_stage(), &units, 8).await;
        let ids: Vec<_> = results.iter().map(|r| r.unit.clone()).collect();
        assert_eq!(ids, units);
        assert!(results.iter().all(|r| r.outcome.status().is_terminal()));
    }

    #[tokio::test]
    async fn test_zero_concurrency_still_progresses() {
        let runner = Arc::new(ScriptedToolRunner::new());
        let (_dir, scheduler, units) = setup(2, runner);
        let results = scheduler.run_stage(qc_stage(), &units, 0).await;
        assert_eq!(results.len(), 2);
    }
}
