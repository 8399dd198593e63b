//! Resume command - continue a batch from its checkpoint

use anyhow::Context;
use clap::Args;
use tracing::info;

use switchyard_tasks::BatchSession;

use crate::cli::engine::{execute_session, EngineOverrides, Project};
use crate::cli::{output, Cli};

/// Continue an interrupted batch
#[derive(Debug, Args)]
pub struct ResumeCommand {
    /// Batch id to resume
    pub batch_id: String,

    #[command(flatten)]
    pub overrides: EngineOverrides,
}

impl ResumeCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        info!(batch = %self.batch_id, "executing resume command");
        let project = Project::load(&self.overrides)?;
        let store = project.checkpoint_store();

        let checkpoint = store
            .load_latest(&self.batch_id)
            .with_context(|| format!("cannot resume batch '{}'", self.batch_id))?;
        if !checkpoint.is_resumable() {
            anyhow::bail!(
                "batch '{}' already finished ({}); nothing to resume",
                self.batch_id,
                checkpoint.state
            );
        }

        let session = BatchSession::from_checkpoint(&checkpoint);
        if cli.is_interactive_text() {
            output::info(&format!(
                "Resuming from layer {} of {}",
                session.start_layer(),
                session.plan().layers().len()
            ));
        }

        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(async {
            let writer = store.open(checkpoint);
            execute_session(cli, &project, session, writer).await
        })
    }
}
