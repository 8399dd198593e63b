//! Plan command - analyze a batch without running it

use std::path::PathBuf;

use clap::Args;
use console::style;
use tracing::info;

use switchyard_tasks::{detect_all, Batch, BatchSession, EdgeOrdering};

use crate::cli::engine::{EngineOverrides, Project};
use crate::cli::{output, Cli, OutputFormat};
use crate::exit_codes;

/// Show the execution plan of a batch file
#[derive(Debug, Args)]
pub struct PlanCommand {
    /// Batch file (YAML or JSON)
    pub batch_file: PathBuf,
}

impl PlanCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        info!(batch_file = %self.batch_file.display(), "executing plan command");
        let project = Project::load(&EngineOverrides::default())?;
        let batch = Batch::load(&project.resolve(&self.batch_file))?;
        let session = BatchSession::new(batch)?;
        print_plan(cli, &session)?;
        Ok(exit_codes::SUCCESS)
    }
}

/// Print layers, and with `--verbose` the conflicts behind them
pub(crate) fn print_plan(cli: &Cli, session: &BatchSession) -> anyhow::Result<()> {
    let plan = session.plan();
    let conflicts = detect_all(session.tasks());

    match cli.format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "batch_id": session.batch_id(),
                "tasks": session.tasks().len(),
                "layers": plan.layers().iter().enumerate().map(|(i, layer)| {
                    serde_json::json!({
                        "layer": i,
                        "tasks": layer,
                    })
                }).collect::<Vec<_>>(),
                "conflicts": conflicts,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text if !cli.quiet => {
            output::info(&format!(
                "{} task{} in {} layer{} for batch {}",
                session.tasks().len(),
                if session.tasks().len() == 1 { "" } else { "s" },
                plan.layers().len(),
                if plan.layers().len() == 1 { "" } else { "s" },
                style(session.batch_id()).bold()
            ));
            println!();
            print!("{}", plan.describe(session.tasks()));

            if cli.verbose && !conflicts.is_empty() {
                println!();
                println!("{}", output::header("Conflicts"));
                for edge in &conflicts {
                    let kinds: Vec<String> = edge.kinds.iter().map(|k| k.to_string()).collect();
                    let order = match &edge.ordering {
                        EdgeOrdering::Before(first) => format!("{} first", first),
                        EdgeOrdering::MutuallyExclusive => "exclusive".to_string(),
                    };
                    println!(
                        "  {} <-> {} {} {}",
                        edge.first,
                        edge.second,
                        style(kinds.join(", ")).yellow(),
                        style(format!("({})", order)).dim()
                    );
                }
            }
        }
        OutputFormat::Text => {}
    }
    Ok(())
}
