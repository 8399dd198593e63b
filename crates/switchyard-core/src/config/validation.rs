//! Configuration validation

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::Config;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_execution(config)?;
    validate_retry(config)?;
    validate_breaker(config)?;
    validate_workspace(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> crate::error::SwitchyardError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.into(),
    }
    .into()
}

fn validate_execution(config: &Config) -> Result<()> {
    if config.execution.concurrency == 0 {
        return Err(invalid("execution.concurrency", "must be at least 1"));
    }

    if config.execution.shell.trim().is_empty() {
        return Err(invalid("execution.shell", "shell cannot be empty"));
    }

    if config.execution.task_timeout_secs == Some(0) {
        return Err(invalid(
            "execution.task_timeout_secs",
            "must be greater than 0 when set",
        ));
    }

    if config.execution.transient_exit_codes.contains(&0) {
        return Err(invalid(
            "execution.transient_exit_codes",
            "exit code 0 means success and cannot be transient",
        ));
    }

    Ok(())
}

fn validate_retry(config: &Config) -> Result<()> {
    if config.retry.max_attempts == 0 {
        return Err(invalid("retry.max_attempts", "must be at least 1"));
    }

    if config.retry.backoff_max_ms < config.retry.backoff_base_ms {
        return Err(invalid(
            "retry.backoff_max_ms",
            "must not be smaller than retry.backoff_base_ms",
        ));
    }

    Ok(())
}

fn validate_breaker(config: &Config) -> Result<()> {
    if config.breaker.failure_threshold == 0 {
        return Err(invalid("breaker.failure_threshold", "must be at least 1"));
    }
    Ok(())
}

fn validate_workspace(config: &Config) -> Result<()> {
    if config.workspace.root.as_os_str().is_empty() {
        return Err(invalid("workspace.root", "root cannot be empty"));
    }

    let prefix = &config.workspace.branch_prefix;
    if prefix.is_empty() || prefix.contains(char::is_whitespace) || prefix.contains("..") {
        return Err(invalid(
            "workspace.branch_prefix",
            "must be a non-empty branch name component",
        ));
    }

    if config.workspace.base_ref.trim().is_empty() {
        return Err(invalid("workspace.base_ref", "base_ref cannot be empty"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.execution.concurrency = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("execution.concurrency"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_backoff_bounds() {
        let mut config = Config::default();
        config.retry.backoff_base_ms = 1_000;
        config.retry.backoff_max_ms = 10;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_zero_exit_code_not_transient() {
        let mut config = Config::default();
        config.execution.transient_exit_codes = vec![0, 75];
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_branch_prefix_with_spaces_rejected() {
        let mut config = Config::default();
        config.workspace.branch_prefix = "my tasks".to_string();
        assert!(validate_config(&config).is_err());
    }
}
