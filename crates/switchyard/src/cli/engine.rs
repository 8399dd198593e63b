//! Shared setup for the commands that execute batches

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tracing::{info, warn};

use switchyard_core::config::{validate_config, WorkspaceBackendKind};
use switchyard_core::{load_config_or_default, Config};
use switchyard_git::GitWorktreeBackend;
use switchyard_tasks::{
    BatchReport, BatchSession, CheckpointStore, CheckpointWriter, CircuitBreaker, Clock,
    CommandRunner, DirectoryBackend, JsonLinesSink, Orchestrator, Provisioner, Resilience,
    RetryPolicy, SchedulerOptions, TaskReporterRegistry, TokioClock, TrackerReporter,
    WorkspaceBackend,
};

use crate::cli::output::{self, ConsoleReporter};
use crate::cli::Cli;
use crate::exit_codes;

/// Flags that override the loaded configuration
#[derive(Debug, Clone, Default, Args)]
pub struct EngineOverrides {
    /// Maximum concurrent tasks
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Attempts per task for infrastructure failures
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Workspace backend (git or directory)
    #[arg(long)]
    pub backend: Option<WorkspaceBackendKind>,
}

impl EngineOverrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(n) = self.concurrency {
            config.execution.concurrency = n;
        }
        if let Some(n) = self.max_attempts {
            config.retry.max_attempts = n;
        }
        if let Some(backend) = self.backend {
            config.workspace.backend = backend;
        }
    }
}

/// Configuration plus the directory relative paths are resolved against
pub struct Project {
    pub root: PathBuf,
    pub config: Config,
    pub config_path: Option<PathBuf>,
}

impl Project {
    /// Load configuration from the working directory and apply overrides
    pub fn load(overrides: &EngineOverrides) -> anyhow::Result<Self> {
        let root = std::env::current_dir()?;
        let (mut config, config_path) = load_config_or_default(&root)?;
        overrides.apply(&mut config);
        validate_config(&config)?;
        Ok(Self {
            root,
            config,
            config_path,
        })
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(self.resolve(&self.config.state.dir))
    }

    fn workspace_backend(&self) -> anyhow::Result<Arc<dyn WorkspaceBackend>> {
        let workspace = &self.config.workspace;
        Ok(match workspace.backend {
            WorkspaceBackendKind::Git => Arc::new(
                GitWorktreeBackend::discover(&self.root, workspace)
                    .context("failed to set up the git workspace backend")?,
            ),
            WorkspaceBackendKind::Directory => {
                Arc::new(DirectoryBackend::new(self.resolve(&workspace.root)))
            }
        })
    }

    /// Wire up the engine for one batch
    pub fn orchestrator(&self, cli: &Cli, batch_id: &str) -> anyhow::Result<Orchestrator> {
        let config = &self.config;
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        let policy = RetryPolicy::from_config(&config.retry);

        let provisioner = Provisioner::new(
            self.workspace_backend()?,
            Resilience::new(
                policy.clone(),
                Arc::new(CircuitBreaker::from_config(
                    "provisioner",
                    &config.breaker,
                    clock.clone(),
                )),
            ),
        );
        let runner_resilience = Resilience::new(
            policy,
            Arc::new(CircuitBreaker::from_config(
                "runner",
                &config.breaker,
                clock.clone(),
            )),
        );

        let mut reporters = TaskReporterRegistry::new();
        if cli.is_interactive_text() {
            reporters.register(ConsoleReporter::new(cli.verbose));
        }
        if config.tracker.enabled {
            let outbox = self.resolve(&config.tracker.outbox);
            info!(outbox = %outbox.display(), "tracker sink enabled");
            reporters.register(
                TrackerReporter::new(Arc::new(JsonLinesSink::new(outbox)), batch_id).with_breaker(
                    Arc::new(CircuitBreaker::from_config("tracker", &config.breaker, clock)),
                ),
            );
        }

        Ok(Orchestrator::new(
            SchedulerOptions::from_config(&config.execution),
            Arc::new(CommandRunner::from_config(&config.execution)),
            Arc::new(provisioner),
            runner_resilience,
            Arc::new(reporters),
        ))
    }
}

/// Run a session to the end, with Ctrl-C cancelling the batch
pub async fn execute_session(
    cli: &Cli,
    project: &Project,
    session: BatchSession,
    writer: CheckpointWriter,
) -> anyhow::Result<i32> {
    let orchestrator = project.orchestrator(cli, session.batch_id())?;

    let token = session.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling batch");
            token.cancel();
        }
    });

    let result = orchestrator.run(&session, &writer).await;
    interrupt.abort();
    let report = result.context("failed to record batch progress")?;

    output::print_report(cli, &report)?;
    Ok(exit_code(&report))
}

pub fn exit_code(report: &BatchReport) -> i32 {
    if report.is_cancelled() {
        exit_codes::CANCELLED
    } else if report.is_success() {
        exit_codes::SUCCESS
    } else {
        exit_codes::TASK_FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use switchyard_tasks::{BatchState, TaskId, TaskResult, TaskStatus};

    fn report(state: BatchState, statuses: &[TaskStatus]) -> BatchReport {
        BatchReport {
            batch_id: "b1".to_string(),
            state,
            results: statuses
                .iter()
                .enumerate()
                .map(|(i, status)| TaskResult {
                    id: TaskId::new(format!("T{}", i)),
                    layer: 0,
                    status: *status,
                    attempts: 1,
                    failure: None,
                    duration: Duration::ZERO,
                    namespace: None,
                    resumed: false,
                })
                .collect(),
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn test_exit_codes() {
        let ok = report(BatchState::Succeeded, &[TaskStatus::Succeeded]);
        assert_eq!(exit_code(&ok), 0);

        let failed = report(
            BatchState::Failed,
            &[TaskStatus::Succeeded, TaskStatus::Failed],
        );
        assert_eq!(exit_code(&failed), 1);

        let cancelled = report(BatchState::Cancelled, &[TaskStatus::Cancelled]);
        assert_eq!(exit_code(&cancelled), 130);
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = Config::default();
        EngineOverrides {
            concurrency: Some(9),
            max_attempts: Some(1),
            backend: Some(WorkspaceBackendKind::Directory),
        }
        .apply(&mut config);
        assert_eq!(config.execution.concurrency, 9);
        assert_eq!(config.retry.max_attempts, 1);
        assert_eq!(config.workspace.backend, WorkspaceBackendKind::Directory);

        let mut untouched = Config::default();
        EngineOverrides::default().apply(&mut untouched);
        assert_eq!(untouched.execution.concurrency, 4);
    }

    #[test]
    fn test_resolve_relative_paths() {
        let project = Project {
            root: PathBuf::from("/work"),
            config: Config::default(),
            config_path: None,
        };
        assert_eq!(
            project.resolve(Path::new(".switchyard/state")),
            PathBuf::from("/work/.switchyard/state")
        );
        assert_eq!(project.resolve(Path::new("/abs")), PathBuf::from("/abs"));
    }
}
