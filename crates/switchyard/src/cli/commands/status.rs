//! Status command - inspect checkpointed batches

use clap::Args;
use console::style;
use tracing::info;

use switchyard_tasks::{BatchState, Checkpoint, TaskStatus};

use crate::cli::engine::{EngineOverrides, Project};
use crate::cli::{output, Cli, OutputFormat};
use crate::exit_codes;

/// Show batch status
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Batch to show; all batches are listed when omitted
    pub batch_id: Option<String>,
}

impl StatusCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        info!(batch = ?self.batch_id, "executing status command");
        let project = Project::load(&EngineOverrides::default())?;
        let store = project.checkpoint_store();

        match &self.batch_id {
            Some(id) => {
                let checkpoint = store.load_latest(id)?;
                show_batch(cli, &checkpoint)?;
            }
            None => {
                let checkpoints = store.list()?;
                if checkpoints.is_empty() && cli.format == OutputFormat::Text {
                    output::info(&format!(
                        "No batches recorded in {}",
                        output::path_style().apply_to(store.dir().display())
                    ));
                    return Ok(exit_codes::SUCCESS);
                }
                list_batches(cli, &checkpoints)?;
            }
        }
        Ok(exit_codes::SUCCESS)
    }
}

fn summary_json(checkpoint: &Checkpoint) -> serde_json::Value {
    serde_json::json!({
        "batch_id": checkpoint.batch_id,
        "state": checkpoint.state.as_str(),
        "created_at": checkpoint.created_at,
        "updated_at": checkpoint.updated_at,
        "tasks": checkpoint.tasks.len(),
        "layers": checkpoint.plan.layers().len(),
        "completed_layers": checkpoint.completed_layers,
        "succeeded": checkpoint.count(TaskStatus::Succeeded),
        "failed": checkpoint.count(TaskStatus::Failed),
        "skipped": checkpoint.count(TaskStatus::Skipped),
        "cancelled": checkpoint.count(TaskStatus::Cancelled),
        "resumable": checkpoint.is_resumable(),
    })
}

fn list_batches(cli: &Cli, checkpoints: &[Checkpoint]) -> anyhow::Result<()> {
    match cli.format {
        OutputFormat::Json => {
            let all: Vec<_> = checkpoints.iter().map(summary_json).collect();
            println!("{}", serde_json::to_string_pretty(&all)?);
        }
        OutputFormat::Text => {
            println!("{}", output::header("Batches"));
            for cp in checkpoints {
                println!(
                    "  {} {} {}/{} succeeded {}",
                    style(&cp.batch_id).bold(),
                    state_style(cp),
                    cp.count(TaskStatus::Succeeded),
                    cp.tasks.len(),
                    style(cp.updated_at.format("%Y-%m-%d %H:%M:%S")).dim()
                );
            }
        }
    }
    Ok(())
}

fn state_style(checkpoint: &Checkpoint) -> String {
    let state = checkpoint.state.as_str();
    if checkpoint.is_resumable() {
        style(format!("{} (resumable)", state)).yellow().to_string()
    } else if checkpoint.state == BatchState::Succeeded {
        style(state).green().to_string()
    } else {
        style(state).red().to_string()
    }
}

fn show_batch(cli: &Cli, checkpoint: &Checkpoint) -> anyhow::Result<()> {
    match cli.format {
        OutputFormat::Json => {
            let mut value = summary_json(checkpoint);
            value["records"] = serde_json::to_value(&checkpoint.records)?;
            value["last_error"] = serde_json::json!(checkpoint.last_error);
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Text => {
            println!("{}", output::header(&format!("Batch {}", checkpoint.batch_id)));
            println!("{}", output::key_value("State", &state_style(checkpoint)));
            println!(
                "{}",
                output::key_value(
                    "Layers",
                    &format!(
                        "{}/{} completed",
                        checkpoint.completed_layers,
                        checkpoint.plan.layers().len()
                    )
                )
            );
            println!(
                "{}",
                output::key_value("Started", &checkpoint.created_at.to_rfc3339())
            );
            println!(
                "{}",
                output::key_value("Updated", &checkpoint.updated_at.to_rfc3339())
            );
            if let Some(err) = &checkpoint.last_error {
                println!("{}", output::key_value("Last error", err));
            }

            for (i, layer) in checkpoint.plan.layers().iter().enumerate() {
                println!();
                println!("  {}", style(format!("Layer {}", i)).underlined());
                for id in layer {
                    let Some(record) = checkpoint.record(id) else {
                        continue;
                    };
                    let (marker, status_style) = output::status_marker(record.status);
                    let mut line = format!(
                        "    {} {} {}",
                        status_style.apply_to(marker),
                        id,
                        style(record.status).dim()
                    );
                    if record.attempts > 1 {
                        line.push_str(&format!(" ({} attempts)", record.attempts));
                    }
                    if let Some(failure) = &record.failure {
                        line.push_str(&format!(" {}", style(failure).red().dim()));
                    }
                    println!("{}", line);
                }
            }

            if checkpoint.is_resumable() {
                println!();
                output::warning(&format!(
                    "Batch is incomplete; continue it with `switchyard resume {}`",
                    checkpoint.batch_id
                ));
            } else if checkpoint.count(TaskStatus::Succeeded) == checkpoint.tasks.len() {
                println!();
                output::success("All tasks succeeded");
            }
        }
    }
    Ok(())
}
