//! Default configuration values

use super::types::Config;

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "switchyard.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "switchyard.yaml";

/// Alternative configuration file name
pub const ALT_CONFIG_FILE: &str = ".switchyard.toml";

/// Get list of config file names to search for
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ALT_CONFIG_FILE,
        ".switchyard.yaml",
    ]
}

/// Generate default configuration TOML
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| DEFAULT_CONFIG_TEMPLATE.to_string())
}

/// Default configuration template
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Switchyard Configuration

[execution]
concurrency = 4
shell = "sh"
transient_exit_codes = [75]
skip_dependents_of_failed = true

[retry]
max_attempts = 3
backoff_base_ms = 500
backoff_max_ms = 30000

[breaker]
failure_threshold = 5
cooldown_secs = 30

[workspace]
backend = "git"
root = ".switchyard/workspaces"
branch_prefix = "switchyard"
base_ref = "HEAD"
keep_branches = true

[state]
dir = ".switchyard/state"

[tracker]
enabled = false
outbox = ".switchyard/tracker.jsonl"
"#;
