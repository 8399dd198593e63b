//! Configuration loading

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ConfigError, Result};

use super::defaults::config_file_names;
use super::types::Config;
use super::validation::validate_config;

/// Load configuration from a file
pub fn load_config(path: &Path) -> Result<Config> {
    let is_yaml = path
        .extension()
        .is_some_and(|e| e == "yaml" || e == "yml");
    let format = if is_yaml { "YAML" } else { "TOML" };
    info!(path = %path.display(), format, "loading config");

    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

    let config: Config = if is_yaml {
        serde_yaml::from_str(&content).map_err(ConfigError::YamlError)?
    } else {
        toml::from_str(&content).map_err(ConfigError::TomlError)?
    };

    validate_config(&config)?;
    debug!(path = %path.display(), "config loaded and validated");
    Ok(config)
}

/// Find configuration file in directory or parent directories.
///
/// At each directory level the search checks:
///   1. `<dir>/<name>`          (e.g. `switchyard.toml`)
///   2. `<dir>/.github/<name>`  (e.g. `.github/switchyard.toml`)
///
/// The first match wins. Parents are walked until the filesystem root.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    debug!(start_dir = %start_dir.display(), "searching for config file");
    let mut current = start_dir.to_path_buf();

    loop {
        for name in config_file_names() {
            let config_path = current.join(name);
            if config_path.exists() {
                info!(path = %config_path.display(), "found config file");
                return Some(config_path);
            }

            let github_path = current.join(".github").join(name);
            if github_path.exists() {
                info!(path = %github_path.display(), "found config file in .github/");
                return Some(github_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    debug!("no config file found");
    None
}

/// Load configuration from directory (searching parent directories)
pub fn load_config_from_dir(dir: &Path) -> Result<(Config, PathBuf)> {
    let config_path = find_config(dir).ok_or_else(|| ConfigError::NotFound(dir.to_path_buf()))?;

    let config = load_config(&config_path)?;
    Ok((config, config_path))
}

/// Load configuration or use defaults.
///
/// A missing file falls back to defaults; a file that exists but fails to
/// parse or validate is reported as an error.
pub fn load_config_or_default(dir: &Path) -> Result<(Config, Option<PathBuf>)> {
    match find_config(dir) {
        Some(path) => {
            let config = load_config(&path)?;
            Ok((config, Some(path)))
        }
        None => {
            warn!(dir = %dir.display(), "no config found, using defaults");
            Ok((Config::default(), None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("switchyard.toml");
        std::fs::write(&config_path, "[execution]\nconcurrency = 2").unwrap();

        let found = find_config(temp.path());
        assert_eq!(found, Some(config_path));
    }

    #[test]
    fn test_find_config_prefers_toml_over_yaml() {
        let temp = TempDir::new().unwrap();
        let toml_path = temp.path().join("switchyard.toml");
        let yaml_path = temp.path().join("switchyard.yaml");
        std::fs::write(&toml_path, "[execution]\nconcurrency = 2").unwrap();
        std::fs::write(&yaml_path, "execution:\n  concurrency: 3").unwrap();

        let found = find_config(temp.path()).unwrap();
        assert_eq!(found, toml_path);
    }

    #[test]
    fn test_find_config_in_parent_dir() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("switchyard.toml");
        std::fs::write(&config_path, "[execution]\nconcurrency = 2").unwrap();
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config(&nested), Some(config_path));
    }

    #[test]
    fn test_find_config_in_github_dir() {
        let temp = TempDir::new().unwrap();
        let github_dir = temp.path().join(".github");
        std::fs::create_dir_all(&github_dir).unwrap();
        let config_path = github_dir.join("switchyard.toml");
        std::fs::write(&config_path, "[execution]\nconcurrency = 2").unwrap();

        assert_eq!(find_config(temp.path()), Some(config_path));
    }

    #[test]
    fn test_load_config_toml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("switchyard.toml");
        std::fs::write(
            &config_path,
            "[execution]\nconcurrency = 8\n\n[retry]\nmax_attempts = 5\n",
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.execution.concurrency, 8);
        assert_eq!(config.retry.max_attempts, 5);
        // untouched sections keep their defaults
        assert_eq!(config.breaker.failure_threshold, 5);
    }

    #[test]
    fn test_load_config_yaml() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("switchyard.yaml");
        std::fs::write(
            &config_path,
            "workspace:\n  backend: directory\n  root: /tmp/ws\n",
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(
            config.workspace.backend,
            crate::config::WorkspaceBackendKind::Directory
        );
        assert_eq!(config.workspace.root, PathBuf::from("/tmp/ws"));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let temp = TempDir::new().unwrap();
        let config_path = temp.path().join("switchyard.toml");
        std::fs::write(
            &config_path,
            "[execution]\nconcurrency = 2\nfuture_knob = true\n\n[telemetry]\nendpoint = \"x\"\n",
        )
        .unwrap();

        let config = load_config(&config_path).unwrap();
        assert_eq!(config.execution.concurrency, 2);
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("switchyard.toml"),
            "[execution]\nconcurrency = 0\n",
        )
        .unwrap();

        assert!(load_config_or_default(temp.path()).is_err());
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let (config, path) = load_config_or_default(temp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.execution.concurrency, 4);
    }
}
