//! External tool invocation.

use crate::core::UnitId;
use async_trait::async_trait;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// A fully rendered tool invocation for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Stage name.
    pub stage: String,
    /// The unit.
    pub unit: UnitId,
    /// Executable.
    pub program: String,
    /// Rendered arguments.
    pub args: Vec<String>,
    /// Working directory (the unit's stage directory).
    pub workdir: PathBuf,
    /// File receiving the tool's stdout and stderr.
    pub log_path: PathBuf,
    /// Files the tool is expected to write.
    pub expected_outputs: Vec<PathBuf>,
    /// Kill the tool after this long.
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    /// Renders the command line for logs.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a tool process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ToolExit {
    /// Exit code; absent when killed by a signal or by the timeout.
    pub code: Option<i32>,
    /// True when the timeout fired.
    pub timed_out: bool,
}

impl ToolExit {
    /// A process that exited with `code`.
    #[must_use]
    pub const fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            timed_out: false,
        }
    }

    /// A process killed after the timeout.
    #[must_use]
    pub const fn timed_out() -> Self {
        Self {
            code: None,
            timed_out: true,
        }
    }

    /// True for a clean zero exit.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.code, Some(0)) && !self.timed_out
    }
}

/// Runs one external tool invocation.
///
/// `Err` means the process could not be started or awaited; a started
/// process that fails is reported through [`ToolExit`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs the invocation to completion.
    async fn run(&self, invocation: &ToolInvocation) -> io::Result<ToolExit>;
}

/// Runs tools as child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessToolRunner;

#[async_trait]
impl ToolRunner for ProcessToolRunner {
    async fn run(&self, invocation: &ToolInvocation) -> io::Result<ToolExit> {
        let stdout = File::create(&invocation.log_path)?;
        let stderr = stdout.try_clone()?;

        tracing::debug!(
            stage = %invocation.stage,
            unit = %invocation.unit,
            command = %invocation.command_line(),
            "Spawning tool"
        );

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()?;

        let Some(limit) = invocation.timeout else {
            let status = child.wait().await?;
            return Ok(ToolExit {
                code: status.code(),
                timed_out: false,
            });
        };

        let waited = tokio::time::timeout(limit, child.wait()).await;
        match waited {
            Ok(status) => Ok(ToolExit {
                code: status?.code(),
                timed_out: false,
            }),
            Err(_) => {
                tracing::warn!(
                    stage = %invocation.stage,
                    unit = %invocation.unit,
                    timeout_secs = limit.as_secs_f64(),
                    "Tool timed out, killing"
                );
                child.kill().await?;
                Ok(ToolExit::timed_out())
            }
        }
    }
}
