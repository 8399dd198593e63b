//! CLI definition and command handling

pub mod commands;
pub mod engine;
pub mod output;

use clap::{Parser, Subcommand};

use commands::{PlanCommand, ResumeCommand, RunCommand, StatusCommand};

/// Switchyard - run batches of tasks in parallel, each in its own workspace
#[derive(Debug, Parser)]
#[command(name = "switchyard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Plan and run a batch file
    Run(RunCommand),

    /// Continue an interrupted batch from its checkpoint
    Resume(ResumeCommand),

    /// Show the checkpointed state of one batch, or list all batches
    Status(StatusCommand),

    /// Show the execution plan of a batch file without running it
    Plan(PlanCommand),
}

impl Cli {
    /// Execute the CLI command, returning the process exit code
    pub fn execute(&self) -> anyhow::Result<i32> {
        // Change to specified directory if provided
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)?;
        }

        match &self.command {
            Commands::Run(cmd) => cmd.execute(self),
            Commands::Resume(cmd) => cmd.execute(self),
            Commands::Status(cmd) => cmd.execute(self),
            Commands::Plan(cmd) => cmd.execute(self),
        }
    }

    /// Whether human-readable progress should be printed
    pub fn is_interactive_text(&self) -> bool {
        !self.quiet && self.format == OutputFormat::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_overrides() {
        let cli = Cli::try_parse_from([
            "switchyard",
            "--format",
            "json",
            "run",
            "batch.yaml",
            "--concurrency",
            "8",
            "--max-attempts",
            "2",
            "--backend",
            "directory",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        let Commands::Run(run) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(run.overrides.concurrency, Some(8));
        assert_eq!(run.overrides.max_attempts, Some(2));
        assert_eq!(
            run.overrides.backend,
            Some(switchyard_core::config::WorkspaceBackendKind::Directory)
        );
        assert!(run.dry_run);
    }

    #[test]
    fn test_status_batch_is_optional() {
        let cli = Cli::try_parse_from(["switchyard", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status(ref s) if s.batch_id.is_none()));
    }

    #[test]
    fn test_resume_requires_batch() {
        assert!(Cli::try_parse_from(["switchyard", "resume"]).is_err());
    }
}
