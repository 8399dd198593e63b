//! Running a task inside its workspace

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

use switchyard_core::config::ExecutionConfig;
use switchyard_core::InfrastructureError;

use crate::reporter::{TaskEvent, TaskReporter};
use crate::task::{Task, TaskId};
use crate::workspace::Workspace;

/// What the task's own work amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    /// The work ran but did not succeed. Never retried.
    Failed { cause: String },
}

impl TaskOutcome {
    pub fn failed(cause: impl Into<String>) -> Self {
        Self::Failed {
            cause: cause.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Everything a runner gets to see for one attempt
pub struct RunContext<'a> {
    pub batch_id: &'a str,
    pub task: &'a Task,
    pub workspace: &'a Workspace,
    /// 1-based attempt number
    pub attempt: u32,
    pub reporter: &'a dyn TaskReporter,
}

/// Executes one attempt of a task.
///
/// `Err` means the attempt itself could not be carried out; the engine may
/// retry it. A task whose work failed returns `Ok(TaskOutcome::Failed)`.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, ctx: RunContext<'_>) -> Result<TaskOutcome, InfrastructureError>;
}

/// Runs the task's `command` through a shell in the workspace directory
#[derive(Debug, Clone)]
pub struct CommandRunner {
    shell: String,
    transient_exit_codes: Vec<i32>,
}

impl CommandRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            transient_exit_codes: Vec::new(),
        }
    }

    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            transient_exit_codes: config.transient_exit_codes.clone(),
        }
    }

    pub fn with_transient_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.transient_exit_codes = codes;
        self
    }
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::from_config(&ExecutionConfig::default())
    }
}

#[async_trait]
impl TaskRunner for CommandRunner {
    async fn run(&self, ctx: RunContext<'_>) -> Result<TaskOutcome, InfrastructureError> {
        let Some(command) = ctx.task.command.as_deref() else {
            debug!(task = %ctx.task.id, "no command, nothing to run");
            return Ok(TaskOutcome::Succeeded);
        };

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(ctx.workspace.path())
            .env("SWITCHYARD_TASK_ID", ctx.task.id.as_str())
            .env("SWITCHYARD_BATCH_ID", ctx.batch_id)
            .env("SWITCHYARD_TASK_SOURCE", &ctx.task.source)
            .env("SWITCHYARD_TASK_KIND", ctx.task.kind.as_str())
            .env("SWITCHYARD_WORKSPACE", ctx.workspace.path())
            .env("SWITCHYARD_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InfrastructureError::Spawn(e.to_string()))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // both pipes are drained together so neither can fill up and stall the child
        let (_, last_stderr) = tokio::join!(
            forward_lines(stdout, &ctx.task.id, false, ctx.reporter),
            forward_lines(stderr, &ctx.task.id, true, ctx.reporter),
        );

        let status = child
            .wait()
            .await
            .map_err(|e| InfrastructureError::Wait(e.to_string()))?;

        if status.success() {
            return Ok(TaskOutcome::Succeeded);
        }

        match status.code() {
            None => Err(InfrastructureError::Terminated),
            Some(code) if self.transient_exit_codes.contains(&code) => {
                Err(InfrastructureError::TransientExit(code))
            }
            Some(code) => Ok(TaskOutcome::failed(match last_stderr {
                Some(line) => format!("exit code {}: {}", code, line),
                None => format!("exit code {}", code),
            })),
        }
    }
}

/// Report every line as output; returns the last non-empty one
async fn forward_lines<R>(
    stream: Option<R>,
    id: &TaskId,
    is_stderr: bool,
    reporter: &dyn TaskReporter,
) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let mut last = None;
    let Some(stream) = stream else {
        return last;
    };

    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        reporter.report(&TaskEvent::Output {
            id: id.clone(),
            line: line.clone(),
            is_stderr,
        });
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }
    last
}
