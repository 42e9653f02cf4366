//! Configuration management for devdash.
//!
//! This module defines the structure of the `devdash.toml` configuration file
//! and provides functionality to load and parse it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration structure corresponding to `devdash.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Directory whose immediate subdirectories are listed as projects.
    pub workspace_root: Option<PathBuf>,
    /// Maximum number of log lines kept per project.
    pub max_lines: Option<usize>,
    /// Process name the external scanner looks for (default: "node").
    pub runtime: Option<String>,
    /// Command used for projects without their own (default: "yarn dev").
    pub default_command: Option<String>,
    /// How long `stop` waits for a managed process to exit, in milliseconds.
    pub stop_timeout_ms: Option<u64>,
    /// Delay between liveness checks when stopping an external process.
    pub external_poll_interval_ms: Option<u64>,
    /// Number of liveness checks before giving up on an external process.
    pub external_poll_attempts: Option<u32>,
    /// Whether to strip ANSI escape codes from captured output (default: true).
    pub strip_ansi: Option<bool>,
    /// Directory names under the workspace root that are never listed.
    pub skip: Option<Vec<String>>,
    /// Per-project overrides.
    #[serde(rename = "project", default)]
    pub projects: Vec<ProjectConfig>,
}

/// Configuration for a single project.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Project directory; relative paths are resolved against the workspace root.
    pub path: PathBuf,
    /// Display name (default: the directory name).
    pub name: Option<String>,
    /// Command that starts the dev server.
    pub command: Option<String>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optional_fields() {
        let raw = r#"
workspace_root = "/Users/dev/work"
max_lines = 1500
runtime = "node"
default_command = "pnpm dev"
stop_timeout_ms = 3000
external_poll_interval_ms = 250
external_poll_attempts = 10
strip_ansi = false
skip = ["dashboard", "archive"]

[[project]]
path = "web"
command = "yarn dev --port 3001"

[[project]]
path = "/opt/site"
name = "marketing"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.workspace_root, Some(PathBuf::from("/Users/dev/work")));
        assert_eq!(config.max_lines, Some(1500));
        assert_eq!(config.runtime.as_deref(), Some("node"));
        assert_eq!(config.default_command.as_deref(), Some("pnpm dev"));
        assert_eq!(config.stop_timeout_ms, Some(3000));
        assert_eq!(config.external_poll_interval_ms, Some(250));
        assert_eq!(config.external_poll_attempts, Some(10));
        assert_eq!(config.strip_ansi, Some(false));
        assert_eq!(
            config.skip,
            Some(vec!["dashboard".to_string(), "archive".to_string()])
        );
        assert_eq!(config.projects.len(), 2);
        assert_eq!(
            config.projects[0].command.as_deref(),
            Some("yarn dev --port 3001")
        );
        assert_eq!(config.projects[1].name.as_deref(), Some("marketing"));
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.workspace_root.is_none());
        assert!(config.projects.is_empty());
    }

    #[test]
    fn load_config_reports_path_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devdash.toml");
        std::fs::write(&path, "max_lines = \"many\"").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("devdash.toml"));
    }
}
