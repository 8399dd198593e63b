//! Output formatting utilities

use console::{style, Style};

use switchyard_tasks::{BatchReport, TaskEvent, TaskReporter, TaskStatus};

use crate::cli::{Cli, OutputFormat};

/// Print a success message
pub fn success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

/// Print a warning message
pub fn warning(message: &str) {
    println!("{} {}", style("!").yellow().bold(), message);
}

/// Print an info message
pub fn info(message: &str) {
    println!("{} {}", style("→").blue(), message);
}

/// Create a styled header
pub fn header(text: &str) -> String {
    style(text).bold().to_string()
}

/// Create a styled key-value line
pub fn key_value(key: &str, value: &str) -> String {
    format!("  {}: {}", style(key).dim(), value)
}

/// Style for paths
pub fn path_style() -> Style {
    Style::new().cyan()
}

/// Marker and style for a task status
pub fn status_marker(status: TaskStatus) -> (&'static str, Style) {
    match status {
        TaskStatus::Succeeded => ("✓", Style::new().green()),
        TaskStatus::Failed => ("✗", Style::new().red()),
        TaskStatus::Skipped => ("○", Style::new().yellow()),
        TaskStatus::Cancelled => ("⊘", Style::new().magenta()),
        TaskStatus::Running => ("▸", Style::new().blue()),
        _ => ("·", Style::new().dim()),
    }
}

fn secs(duration: std::time::Duration) -> String {
    format!("{:.1}s", duration.as_secs_f64())
}

/// Final per-task summary of a batch
pub fn print_report(cli: &Cli, report: &BatchReport) -> anyhow::Result<()> {
    match cli.format {
        OutputFormat::Json => {
            let summary = serde_json::json!({
                "batch_id": report.batch_id,
                "state": report.state.as_str(),
                "total": report.results.len(),
                "succeeded": report.count(TaskStatus::Succeeded),
                "failed": report.count(TaskStatus::Failed),
                "skipped": report.count(TaskStatus::Skipped),
                "cancelled": report.count(TaskStatus::Cancelled),
                "duration_ms": report.duration.as_millis() as u64,
                "tasks": report.results.iter().map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "layer": r.layer,
                        "status": r.status,
                        "attempts": r.attempts,
                        "failure_kind": r.failure.as_ref().map(|f| f.kind.as_str()),
                        "cause": r.failure.as_ref().map(|f| f.cause.as_str()),
                        "duration_ms": r.duration.as_millis() as u64,
                        "resumed": r.resumed,
                    })
                }).collect::<Vec<_>>(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        OutputFormat::Text if !cli.quiet => {
            println!();
            println!("{}", header(&format!("Batch {}", report.batch_id)));
            for r in &report.results {
                let (marker, status_style) = status_marker(r.status);
                let mut line = format!(
                    "  {} {} {}",
                    status_style.apply_to(marker),
                    status_style.apply_to(&r.id),
                    style(r.status).dim()
                );
                if r.attempts > 1 {
                    line.push_str(&format!(" {}", style(format!("{} attempts", r.attempts)).dim()));
                }
                if r.resumed {
                    line.push_str(&format!(" {}", style("(from checkpoint)").cyan()));
                }
                if let Some(failure) = &r.failure {
                    line.push_str(&format!(" {}", style(failure).red().dim()));
                }
                println!("{}", line);
            }
        }
        OutputFormat::Text => {}
    }
    Ok(())
}

/// Console reporter with live progress lines
pub struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl TaskReporter for ConsoleReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::BatchStarted {
                batch_id,
                tasks,
                layers,
                resumed,
            } => {
                println!(
                    "{} {} batch {} ({} task{} in {} layer{})",
                    style("→").blue(),
                    if *resumed { "Resuming" } else { "Running" },
                    style(batch_id).bold(),
                    tasks,
                    if *tasks == 1 { "" } else { "s" },
                    layers,
                    if *layers == 1 { "" } else { "s" },
                );
            }
            TaskEvent::LayerStarted { layer, task_count } => {
                if self.verbose {
                    println!(
                        "  {} Layer {} ({} tasks)",
                        style("─").dim(),
                        layer,
                        task_count
                    );
                }
            }
            TaskEvent::Started {
                id,
                command,
                namespace,
            } => {
                let detail = if self.verbose {
                    style(format!(
                        "({} in {})",
                        command.as_deref().unwrap_or("<no command>"),
                        namespace
                    ))
                    .dim()
                    .to_string()
                } else {
                    String::new()
                };
                println!("  {} {} {}", style("▸").dim(), style(id).bold(), detail);
            }
            TaskEvent::Output { id, line, is_stderr } => {
                if self.verbose {
                    if *is_stderr {
                        println!("    {} {}", style(format!("[{}]", id)).red().dim(), line);
                    } else {
                        println!("    {} {}", style(format!("[{}]", id)).dim(), line);
                    }
                }
            }
            TaskEvent::Retrying {
                id,
                attempt,
                delay,
                error,
            } => {
                println!(
                    "  {} {} attempt {} failed, retrying in {} {}",
                    style("↻").yellow(),
                    style(id).yellow(),
                    attempt,
                    secs(*delay),
                    style(error).dim()
                );
            }
            TaskEvent::Completed {
                id,
                duration,
                attempts,
            } => {
                let retries = if *attempts > 1 {
                    format!(" {}", style(format!("({} attempts)", attempts)).yellow())
                } else {
                    String::new()
                };
                println!(
                    "  {} {}{} {}",
                    style("✓").green(),
                    style(id).green(),
                    retries,
                    style(secs(*duration)).dim()
                );
            }
            TaskEvent::Failed {
                id,
                duration,
                failure,
            } => {
                println!(
                    "  {} {} {} {}",
                    style("✗").red(),
                    style(id).red(),
                    style(secs(*duration)).dim(),
                    style(failure).red().dim()
                );
            }
            TaskEvent::Skipped { id, reason } => {
                println!(
                    "  {} {} {}",
                    style("○").yellow(),
                    style(id).yellow(),
                    style(format!("({})", reason)).dim()
                );
            }
            TaskEvent::Cancelled { id } => {
                println!("  {} {} {}", style("⊘").magenta(), id, style("cancelled").dim());
            }
            TaskEvent::LayerCompleted { .. } => {}
            TaskEvent::BatchCompleted {
                total,
                succeeded,
                failed,
                skipped,
                cancelled,
                duration,
                ..
            } => {
                println!();
                println!(
                    "  {} {}/{} succeeded, {} failed, {} skipped, {} cancelled ({})",
                    if *failed == 0 && *cancelled == 0 {
                        style("✓").green().bold()
                    } else {
                        style("✗").red().bold()
                    },
                    succeeded,
                    total,
                    failed,
                    skipped,
                    cancelled,
                    secs(*duration)
                );
            }
        }
    }
}
