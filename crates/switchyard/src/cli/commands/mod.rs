//! CLI commands

mod plan;
mod resume;
mod run;
mod status;

pub use plan::PlanCommand;
pub use resume::ResumeCommand;
pub use run::RunCommand;
pub use status::StatusCommand;
