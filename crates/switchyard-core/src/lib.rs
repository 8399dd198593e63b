//! Switchyard Core - shared foundations for the orchestrator
//!
//! This crate provides the error taxonomy and the configuration system used by
//! the task engine, the git workspace backend and the CLI.

pub mod config;
pub mod error;

pub use config::{load_config_or_default, Config};
pub use error::{
    AnalysisError, ConfigError, GitError, InfrastructureError, ProvisioningError, Result,
    StateError, SwitchyardError,
};
