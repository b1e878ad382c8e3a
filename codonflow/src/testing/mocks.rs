//! A scripted stand-in for external tools.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::UnitId;
use crate::stages::{ToolExit, ToolInvocation, ToolRunner};

type OutputBody = Arc<dyn Fn(&UnitId) -> String + Send + Sync>;

/// A deterministic fake tool.
///
/// Every invocation is recorded. Unless told to fail, it writes each expected
/// output file (by default `"<stage> <unit>\n"`) and exits 0. An optional
/// delay keeps invocations in flight long enough to observe concurrency.
pub struct ScriptedToolRunner {
    delay: Option<Duration>,
    partial_on_failure: bool,
    failures: HashMap<(String, Option<String>), i32>,
    bodies: HashMap<String, OutputBody>,
    invocations: Mutex<Vec<(String, UnitId)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl std::fmt::Debug for ScriptedToolRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedToolRunner")
            .field("delay", &self.delay)
            .field("failures", &self.failures)
            .field("invocations", &self.invocations.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for ScriptedToolRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedToolRunner {
    /// Creates a runner where every tool succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self {
            delay: None,
            partial_on_failure: false,
            failures: HashMap::new(),
            bodies: HashMap::new(),
            invocations: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Sleeps this long inside every invocation.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes scripted failures write truncated outputs before exiting, like a
    /// tool killed halfway through.
    #[must_use]
    pub fn with_partial_outputs_on_failure(mut self) -> Self {
        self.partial_on_failure = true;
        self
    }

    /// Makes `stage` exit with `code` for every unit.
    #[must_use]
    pub fn fail_stage(mut self, stage: impl Into<String>, code: i32) -> Self {
        self.failures.insert((stage.into(), None), code);
        self
    }

    /// Makes `stage` exit with `code` for one unit.
    #[must_use]
    pub fn fail_unit(mut self, stage: impl Into<String>, unit: impl Into<String>, code: i32) -> Self {
        self.failures.insert((stage.into(), Some(unit.into())), code);
        self
    }

    /// Writes `body(unit)` into every output of `stage`.
    #[must_use]
    pub fn with_output<F>(mut self, stage: impl Into<String>, body: F) -> Self
    where
        F: Fn(&UnitId) -> String + Send + Sync + 'static,
    {
        self.bodies.insert(stage.into(), Arc::new(body));
        self
    }

    /// All `(stage, unit)` invocations so far, in call order.
    #[must_use]
    pub fn invocations(&self) -> Vec<(String, UnitId)> {
        self.invocations.lock().clone()
    }

    /// Number of invocations of `stage`.
    #[must_use]
    pub fn invocation_count(&self, stage: &str) -> usize {
        self.invocations.lock().iter().filter(|(s, _)| s == stage).count()
    }

    /// Whether `stage` was invoked for `unit`.
    #[must_use]
    pub fn was_invoked(&self, stage: &str, unit: &str) -> bool {
        self.invocations
            .lock()
            .iter()
            .any(|(s, u)| s == stage && u.to_string() == unit)
    }

    /// Highest number of simultaneous invocations observed.
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn failure_for(&self, invocation: &ToolInvocation) -> Option<i32> {
        let unit = invocation.unit.to_string();
        self.failures
            .get(&(invocation.stage.clone(), Some(unit)))
            .or_else(|| self.failures.get(&(invocation.stage.clone(), None)))
            .copied()
    }

    fn finish(&self, invocation: &ToolInvocation) -> io::Result<ToolExit> {
        let mut log = format!("$ {}\n", invocation.command_line());
        if let Some(code) = self.failure_for(invocation) {
            log.push_str(&format!("scripted failure, exit {code}\n"));
            if self.partial_on_failure {
                for path in &invocation.expected_outputs {
                    fs::write(path, "partial")?;
                }
            }
            fs::write(&invocation.log_path, log)?;
            return Ok(ToolExit::exited(code));
        }
        for path in &invocation.expected_outputs {
            let body = match self.bodies.get(&invocation.stage) {
                Some(body) => body(&invocation.unit),
                None => format!("{} {}\n", invocation.stage, invocation.unit),
            };
            fs::write(path, body)?;
        }
        fs::write(&invocation.log_path, log)?;
        Ok(ToolExit::exited(0))
    }
}

#[async_trait]
impl ToolRunner for ScriptedToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> io::Result<ToolExit> {
        self.invocations
            .lock()
            .push((invocation.stage.clone(), invocation.unit.clone()));
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.finish(invocation);

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn invocation(dir: &TempDir, stage: &str, unit: &str) -> ToolInvocation {
        ToolInvocation {
            stage: stage.to_string(),
            unit: UnitId::new(unit),
            program: "tool".to_string(),
            args: vec!["-x".to_string()],
            workdir: dir.path().to_path_buf(),
            log_path: dir.path().join(format!("{stage}.log")),
            expected_outputs: vec![dir.path().join("out.txt")],
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_writes_outputs_and_records() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedToolRunner::new().with_output("ml", |unit| format!("report for {unit}"));

        let exit = runner.run(&invocation(&dir, "ml", "ACE2")).await.unwrap();
        assert!(exit.success());
        assert_eq!(fs::read_to_string(dir.path().join("out.txt")).unwrap(), "report for ACE2");
        assert!(runner.was_invoked("ml", "ACE2"));
        assert_eq!(runner.invocation_count("ml"), 1);
        assert!(fs::read_to_string(dir.path().join("ml.log")).unwrap().starts_with("$ tool -x"));
    }

    #[tokio::test]
    async fn test_unit_failure_overrides_stage_rule() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedToolRunner::new().fail_stage("qc", 1).fail_unit("qc", "B", 7);

        assert_eq!(runner.run(&invocation(&dir, "qc", "A")).await.unwrap().code, Some(1));
        assert_eq!(runner.run(&invocation(&dir, "qc", "B")).await.unwrap().code, Some(7));
        assert!(!dir.path().join("out.txt").exists());
    }

    #[tokio::test]
    async fn test_partial_outputs_on_failure() {
        let dir = TempDir::new().unwrap();
        let runner = ScriptedToolRunner::new().fail_stage("qc", 1).with_partial_outputs_on_failure();

        assert_eq!(runner.run(&invocation(&dir, "qc", "A")).await.unwrap().code, Some(1));
        assert_eq!(fs::read_to_string(dir.path().join("out.txt")).unwrap(), "partial");
    }
}
