//! Project discovery under the workspace root.
//!
//! A project is a directory directly below the root that contains a `package.json`.
//! Hidden directories and configured skip names are ignored. Projects listed in the
//! config are included even when they live outside the root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::ProjectConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub name: String,
    pub path: PathBuf,
    pub command: String,
}

pub fn discover_projects(
    root: &Path,
    skip: &[String],
    overrides: &[ProjectConfig],
    default_command: &str,
) -> Result<Vec<Project>> {
    let mut found: BTreeMap<PathBuf, Project> = BTreeMap::new();

    let entries = std::fs::read_dir(root)
        .with_context(|| format!("failed to read workspace {}", root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read workspace {}", root.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || skip.iter().any(|s| s == &name) {
            continue;
        }
        let path = entry.path();
        if !path.is_dir() || !path.join("package.json").is_file() {
            continue;
        }
        let path = canonical(path);
        found.insert(
            path.clone(),
            Project {
                name,
                path,
                command: default_command.to_string(),
            },
        );
    }

    for project in overrides {
        let path = root.join(&project.path);
        if !path.is_dir() {
            continue;
        }
        let path = canonical(path);
        let name = project
            .name
            .clone()
            .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| path.display().to_string());
        let command = project
            .command
            .clone()
            .unwrap_or_else(|| default_command.to_string());
        found.insert(path.clone(), Project { name, path, command });
    }

    let mut projects: Vec<Project> = found.into_values().collect();
    projects.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.path.cmp(&b.path)));
    Ok(projects)
}

// Scanned working directories are canonical, so project keys must be too.
fn canonical(path: PathBuf) -> PathBuf {
    std::fs::canonicalize(&path).unwrap_or(path)
}
