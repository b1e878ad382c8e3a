//! Runs one stage for one unit.
//!
//! The executor checks the completion marker first, then the inputs, then
//! prepares an isolated stage directory, invokes the tool and seals the
//! declared outputs into the artifact store. A marker counts only once it
//! is sealed, and a failed attempt leaves no outputs behind.

use super::{CommandContext, FailureReason, StageOutcome, ToolInvocation, ToolRunner, UnitStageResult};
use crate::core::{ArtifactKey, ArtifactKind, ArtifactStore, UnitId};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::foreground::{foreground_trees, section_header, ForegroundTree};
use crate::pipeline::StageSpec;
use crate::utils::elapsed_ms;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Executes stages against the artifact store through a [`ToolRunner`].
#[derive(Clone)]
pub struct StageExecutor {
    store: Arc<ArtifactStore>,
    runner: Arc<dyn ToolRunner>,
    sink: Arc<dyn EventSink>,
    producers: HashMap<ArtifactKind, String>,
    timeout: Option<Duration>,
    threads: usize,
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("root", &self.store.root())
            .field("timeout", &self.timeout)
            .field("threads", &self.threads)
            .finish_non_exhaustive()
    }
}

impl StageExecutor {
    /// Creates an executor over `store` using `runner` for tool calls.
    #[must_use]
    pub fn new(store: Arc<ArtifactStore>, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            store,
            runner,
            sink: Arc::new(NoOpEventSink),
            producers: HashMap::new(),
            timeout: None,
            threads: 1,
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets which stage produces each artifact kind.
    #[must_use]
    pub fn with_producers(mut self, producers: HashMap<ArtifactKind, String>) -> Self {
        self.producers = producers;
        self
    }

    /// Sets the per-unit tool timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the thread count passed to tools through `{threads}`.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Returns the artifact store.
    #[must_use]
    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Runs `stage` for `unit`. Never fails: every problem becomes an outcome.
    pub async fn execute(&self, stage: &StageSpec, unit: &UnitId) -> UnitStageResult {
        let start = Instant::now();
        let outcome = self.run(stage, unit).await;
        let data = serde_json::json!({
            "unit": unit.to_string(),
            "stage": stage.name,
            "outcome": outcome,
        });
        let event = match &outcome {
            StageOutcome::Succeeded { .. } => names::UNIT_SUCCEEDED,
            StageOutcome::Skipped => names::UNIT_SKIPPED,
            StageOutcome::MissingDependency { .. } => names::UNIT_MISSING_DEPENDENCY,
            StageOutcome::Failed { .. } => {
                tracing::warn!(
                    stage = %stage.name,
                    unit = %unit,
                    error = ?outcome.failure_message(),
                    "Unit failed"
                );
                names::UNIT_FAILED
            }
        };
        self.sink.try_emit(event, Some(data));
        UnitStageResult::new(unit.clone(), &stage.name, outcome, elapsed_ms(start))
    }

    async fn run(&self, stage: &StageSpec, unit: &UnitId) -> StageOutcome {
        if let Some(marker) = stage.marker() {
            let key = ArtifactKey::new(unit.clone(), &stage.name, marker.clone());
            if self.store.is_sealed(&key) {
                tracing::debug!(stage = %stage.name, unit = %unit, "Marker sealed, skipping");
                return StageOutcome::Skipped;
            }
        }

        let mut inputs = BTreeMap::new();
        let mut missing = Vec::new();
        for kind in &stage.inputs {
            let producer = self.producers.get(kind).map(String::as_str);
            match self.store.resolve(unit, kind, producer) {
                Some(path) if path.is_file() => {
                    inputs.insert(kind.clone(), path);
                }
                _ => missing.push(kind.clone()),
            }
        }
        if !missing.is_empty() {
            return StageOutcome::MissingDependency { missing };
        }

        let workdir = self.store.stage_dir(unit, &stage.name);
        let log_path = workdir.join(format!("{}.log", stage.name));

        let outputs: BTreeMap<ArtifactKind, PathBuf> = stage
            .outputs
            .iter()
            .map(|o| (o.kind.clone(), self.store.path(&ArtifactKey::new(unit.clone(), &stage.name, o.kind.clone()))))
            .collect();

        if let Err(e) = prepare_workdir(&workdir, outputs.values()).await {
            return setup_failed(&log_path, e.to_string());
        }

        let attempt = Attempt {
            unit,
            inputs: &inputs,
            outputs,
            workdir,
            foreground: None,
        };
        let ran = if stage.foreground {
            self.run_foreground(stage, &attempt).await
        } else {
            self.invoke(stage, &attempt).await
        };
        if let Err(failed) = ran {
            discard(attempt.outputs.values()).await;
            return failed;
        }

        match self.store.seal(unit, &stage.name, &stage.output_kinds()) {
            Ok(artifacts) => StageOutcome::Succeeded { artifacts },
            Err(e) => {
                discard(attempt.outputs.values()).await;
                setup_failed(&log_path, format!("sealing outputs: {e}"))
            }
        }
    }

    /// Runs the tool once per foreground lineage of the input tree and joins
    /// the lineage reports into the stage's report.
    async fn run_foreground(&self, stage: &StageSpec, attempt: &Attempt<'_>) -> Result<(), StageOutcome> {
        let log_path = attempt.log_path(stage);
        let (Some(tree_path), Some(report)) = (attempt.inputs.get(&ArtifactKind::Tree), stage.report_kind()) else {
            return Err(setup_failed(&log_path, "foreground stage needs a tree input and a model report".to_string()));
        };
        let newick = tokio::fs::read_to_string(tree_path)
            .await
            .map_err(|e| setup_failed(&log_path, format!("reading tree: {e}")))?;
        let trees = foreground_trees(&newick);
        if trees.is_empty() {
            return Err(setup_failed(
                &log_path,
                format!("tree {} has no '|'-labelled lineage to mark as foreground", tree_path.display()),
            ));
        }

        let mut joined = String::new();
        for tree in &trees {
            let workdir = attempt.workdir.join(tree.dir_name());
            let outputs: BTreeMap<ArtifactKind, PathBuf> = attempt
                .outputs
                .keys()
                .map(|kind| (kind.clone(), workdir.join(kind.file_name())))
                .collect();
            if let Err(e) = prepare_workdir(&workdir, outputs.values()).await {
                return Err(setup_failed(&log_path, e.to_string()));
            }
            let lineage = Attempt {
                unit: attempt.unit,
                inputs: attempt.inputs,
                outputs,
                workdir,
                foreground: Some(tree),
            };
            self.invoke(stage, &lineage).await?;

            let text = tokio::fs::read_to_string(&lineage.outputs[report])
                .await
                .map_err(|e| setup_failed(&lineage.log_path(stage), format!("reading report: {e}")))?;
            let _ = writeln!(joined, "{}", section_header(&tree.lineage));
            joined.push_str(&text);
            if !text.ends_with('\n') {
                joined.push('\n');
            }
        }

        tokio::fs::write(&attempt.outputs[report], joined)
            .await
            .map_err(|e| setup_failed(&log_path, format!("joining lineage reports: {e}")))?;
        tracing::debug!(stage = %stage.name, unit = %attempt.unit, lineages = trees.len(), "Foreground runs joined");
        Ok(())
    }

    /// Renders and runs one tool invocation and checks its outputs.
    ///
    /// Whatever the invocation wrote is removed again when it fails.
    async fn invoke(&self, stage: &StageSpec, attempt: &Attempt<'_>) -> Result<(), StageOutcome> {
        let log_path = attempt.log_path(stage);

        let control = match self.render_control(stage, attempt).await {
            Ok(path) => path,
            Err(e) => return Err(setup_failed(&log_path, format!("control file: {e}"))),
        };

        let ctx = CommandContext {
            inputs: attempt.inputs,
            outputs: &attempt.outputs,
            workdir: &attempt.workdir,
            unit: attempt.unit,
            threads: self.threads,
            control: control.as_deref(),
        };
        let (program, args) = stage.command.render(&ctx).map_err(|e| setup_failed(&log_path, e))?;

        let mut produced = Vec::with_capacity(stage.outputs.len());
        for output in &stage.outputs {
            let path = match &output.produced_as {
                Some(template) => attempt.workdir.join(ctx.render(template).map_err(|e| setup_failed(&log_path, e))?),
                None => attempt.outputs[&output.kind].clone(),
            };
            produced.push((output.kind.clone(), path));
        }

        let invocation = ToolInvocation {
            stage: stage.name.clone(),
            unit: attempt.unit.clone(),
            program,
            args,
            workdir: attempt.workdir.clone(),
            log_path: log_path.clone(),
            expected_outputs: produced.iter().map(|(_, p)| p.clone()).collect(),
            timeout: self.timeout,
        };

        self.sink.try_emit(
            names::UNIT_STARTED,
            Some(serde_json::json!({
                "unit": attempt.unit.to_string(),
                "stage": stage.name,
                "foreground": attempt.foreground.map(|t| t.lineage.as_str()),
                "command": invocation.command_line(),
            })),
        );

        let failed = match self.runner.run(&invocation).await {
            Err(e) => {
                // Best effort: leave the reason next to where the tool log would be.
                let _ = tokio::fs::write(&log_path, format!("failed to start '{}': {e}\n", invocation.program)).await;
                Some(StageOutcome::Failed {
                    exit_code: None,
                    log_path: log_path.clone(),
                    reason: FailureReason::Spawn(e.to_string()),
                })
            }
            Ok(exit) if exit.timed_out => Some(StageOutcome::Failed {
                exit_code: None,
                log_path: log_path.clone(),
                reason: FailureReason::TimedOut,
            }),
            Ok(exit) if !exit.success() => Some(StageOutcome::Failed {
                exit_code: exit.code,
                log_path: log_path.clone(),
                reason: FailureReason::NonZeroExit,
            }),
            Ok(exit) => collect(&produced, &attempt.outputs, exit.code, &log_path).await,
        };

        match failed {
            Some(outcome) => {
                let stale: Vec<&PathBuf> = produced.iter().map(|(_, p)| p).chain(attempt.outputs.values()).collect();
                discard(stale).await;
                Err(outcome)
            }
            None => Ok(()),
        }
    }

    /// Stages the alignment and tree next to the control file and writes it.
    ///
    /// A foreground attempt gets its marked tree instead of the input tree.
    async fn render_control(&self, stage: &StageSpec, attempt: &Attempt<'_>) -> io::Result<Option<PathBuf>> {
        let Some(control) = &stage.control else {
            return Ok(None);
        };

        let mut bindings = BTreeMap::new();
        if let Some((kind, path)) = attempt.inputs.iter().find(|(k, _)| k.is_sequence_data()) {
            let local = kind.file_name();
            tokio::fs::copy(path, attempt.workdir.join(&local)).await?;
            bindings.insert("seqfile".to_string(), local);
        }
        let local_tree = ArtifactKind::Tree.file_name();
        if let Some(tree) = attempt.foreground {
            tokio::fs::write(attempt.workdir.join(&local_tree), &tree.newick).await?;
            bindings.insert("treefile".to_string(), local_tree);
        } else if let Some(path) = attempt.inputs.get(&ArtifactKind::Tree) {
            tokio::fs::copy(path, attempt.workdir.join(&local_tree)).await?;
            bindings.insert("treefile".to_string(), local_tree);
        }
        if let Some(report) = stage.report_kind().or_else(|| stage.marker()) {
            bindings.insert("outfile".to_string(), report.file_name());
        }

        let path = attempt.workdir.join(format!("{}.ctl", stage.name));
        tokio::fs::write(&path, control.render(&bindings)).await?;
        Ok(Some(path))
    }
}

/// One tool invocation's paths: the stage directory, or a lineage
/// directory below it for foreground runs.
struct Attempt<'a> {
    unit: &'a UnitId,
    inputs: &'a BTreeMap<ArtifactKind, PathBuf>,
    outputs: BTreeMap<ArtifactKind, PathBuf>,
    workdir: PathBuf,
    foreground: Option<&'a ForegroundTree>,
}

impl Attempt<'_> {
    fn log_path(&self, stage: &StageSpec) -> PathBuf {
        self.workdir.join(format!("{}.log", stage.name))
    }
}

fn setup_failed(log_path: &Path, msg: String) -> StageOutcome {
    StageOutcome::Failed {
        exit_code: None,
        log_path: log_path.to_path_buf(),
        reason: FailureReason::Setup(msg),
    }
}

/// Creates the stage directory and removes stale outputs of an interrupted attempt.
async fn prepare_workdir<'a>(workdir: &Path, outputs: impl Iterator<Item = &'a PathBuf>) -> io::Result<()> {
    tokio::fs::create_dir_all(workdir).await?;
    for path in outputs {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Moves produced files to their canonical paths and checks every output exists.
async fn collect(
    produced: &[(ArtifactKind, PathBuf)],
    outputs: &BTreeMap<ArtifactKind, PathBuf>,
    exit_code: Option<i32>,
    log_path: &Path,
) -> Option<StageOutcome> {
    let mut absent = Vec::new();
    for (kind, from) in produced {
        let canonical = &outputs[kind];
        if from != canonical && from.is_file() {
            if let Err(e) = tokio::fs::rename(from, canonical).await {
                return Some(setup_failed(log_path, format!("relocating {}: {e}", from.display())));
            }
        }
        if !canonical.is_file() {
            absent.push(kind.clone());
        }
    }
    (!absent.is_empty()).then(|| StageOutcome::Failed {
        exit_code,
        log_path: log_path.to_path_buf(),
        reason: FailureReason::MissingOutput(absent),
    })
}

/// Removes what a failed attempt left behind so it cannot pass for a finished one.
async fn discard<'a>(paths: impl IntoIterator<Item = &'a PathBuf>) {
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed output of failed attempt"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove output of failed attempt"),
        }
    }
}
