//! Run command - plan a batch file and execute it

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use console::style;
use tracing::info;

use switchyard_tasks::{Batch, BatchSession};

use crate::cli::commands::plan::print_plan;
use crate::cli::engine::{execute_session, EngineOverrides, Project};
use crate::cli::{output, Cli};
use crate::exit_codes;

/// Plan and run a batch
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Batch file (YAML or JSON)
    pub batch_file: PathBuf,

    #[command(flatten)]
    pub overrides: EngineOverrides,

    /// Show execution plan without running
    #[arg(long)]
    pub dry_run: bool,
}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        info!(
            batch_file = %self.batch_file.display(),
            dry_run = self.dry_run,
            "executing run command"
        );
        let project = Project::load(&self.overrides)?;
        let batch = Batch::load(&project.resolve(&self.batch_file))?;
        let session = BatchSession::new(batch)?;

        if self.dry_run {
            print_plan(cli, &session)?;
            if cli.is_interactive_text() {
                println!();
                println!(
                    "{}",
                    style("[DRY RUN - no tasks will be executed]").yellow().bold()
                );
            }
            return Ok(exit_codes::SUCCESS);
        }

        if cli.is_interactive_text() && cli.verbose {
            match &project.config_path {
                Some(path) => println!(
                    "{}",
                    output::key_value(
                        "Config",
                        &output::path_style().apply_to(path.display()).to_string()
                    )
                ),
                None => println!("{}", output::key_value("Config", "defaults")),
            }
            println!(
                "{}",
                output::key_value("Backend", &project.config.workspace.backend.to_string())
            );
            println!(
                "{}",
                output::key_value(
                    "Concurrency",
                    &project.config.execution.concurrency.to_string()
                )
            );
        }

        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(async {
            let store = project.checkpoint_store();
            let writer = store
                .create(session.batch_id(), session.tasks(), session.plan())
                .await
                .with_context(|| {
                    format!("could not start checkpoint for batch '{}'", session.batch_id())
                })?;
            execute_session(cli, &project, session, writer).await
        })
    }
}
