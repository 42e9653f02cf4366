//! devdash: start, stop and tail local dev servers.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, builds the process supervisor, and runs one command against it.

mod config;
mod error;
mod events;
mod output;
mod process;
mod projects;
mod runner;
mod scanner;
mod supervisor;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::{Config, ProjectConfig};
use crate::events::SupervisorEvent;
use crate::output::DEFAULT_MAX_LINES;
use crate::process::{ProjectId, ProjectStatus};
use crate::scanner::LsofProbe;
use crate::supervisor::{ProcessSupervisor, SupervisorSettings};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devdash",
    version,
    about = "Start, stop and tail local dev servers",
    styles = help_styles()
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to devdash.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any devdash.toml in the current directory.
    #[arg(long, global = true)]
    no_config: bool,
    /// Max log lines kept per project.
    #[arg(long, global = true)]
    max_lines: Option<usize>,
    /// Process name to look for when scanning for external dev servers.
    #[arg(long, global = true)]
    runtime: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List workspace projects and whether they are running.
    List {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Start a project's dev server and stream its output until it exits or Ctrl-C.
    Run {
        /// Project directory.
        path: PathBuf,
        /// Command to run instead of the configured one.
        #[arg(long)]
        command: Option<String>,
    },
    /// Stop a project's dev server, including ones started elsewhere.
    Stop {
        /// Project directory.
        path: PathBuf,
    },
    /// Show externally started dev servers by project.
    Scan,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let (config, settings) = load_settings(&cli)?;
    let supervisor = Arc::new(ProcessSupervisor::new(
        Box::new(LsofProbe::new(settings.runtime.clone())),
        settings.supervisor,
    ));

    match &cli.command {
        Commands::List { json } => list_projects(&supervisor, &config, &settings, *json).await,
        Commands::Run { path, command } => {
            let id = project_id(path)?;
            let command = command
                .clone()
                .unwrap_or_else(|| command_for(&id, &config, &settings));
            run_project(&supervisor, id, &command).await
        }
        Commands::Stop { path } => {
            let id = project_id(path)?;
            supervisor.scan_running_processes().await;
            supervisor.stop(&id).await;
            println!("{}  {}", id, supervisor.status(&id));
            Ok(())
        }
        Commands::Scan => {
            supervisor.scan_running_processes().await;
            let mut snapshot: Vec<_> = supervisor.external_snapshot().into_iter().collect();
            snapshot.sort();
            for (id, pids) in snapshot {
                let pids: Vec<String> = pids.iter().map(u32::to_string).collect();
                println!("{}  {}", id, pids.join(","));
            }
            Ok(())
        }
    }
}

fn init_logging() {
    let filter = std::env::var("DEVDASH_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Debug, Serialize)]
struct ProjectListing {
    name: String,
    path: PathBuf,
    command: String,
    status: ProjectStatus,
}

async fn list_projects(
    supervisor: &ProcessSupervisor,
    config: &Config,
    settings: &RunSettings,
    json: bool,
) -> Result<()> {
    let projects = projects::discover_projects(
        &settings.workspace_root,
        &settings.skip,
        &config.projects,
        &settings.default_command,
    )?;
    supervisor.scan_running_processes().await;

    let listings: Vec<ProjectListing> = projects
        .into_iter()
        .map(|project| {
            let status = supervisor.status(&ProjectId::from(project.path.as_path()));
            ProjectListing {
                name: project.name,
                path: project.path,
                command: project.command,
                status,
            }
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(());
    }
    let width = listings.iter().map(|l| l.name.len()).max().unwrap_or(0);
    for listing in &listings {
        println!(
            "{:<width$}  {:<7}  {}",
            listing.name,
            listing.status.to_string(),
            listing.path.display(),
        );
    }
    Ok(())
}

async fn run_project(supervisor: &ProcessSupervisor, id: ProjectId, command: &str) -> Result<()> {
    let mut events = supervisor.subscribe();
    supervisor.start(id.clone(), command, id.path())?;
    let entry = supervisor.managed_entry(&id);
    if let Some(entry) = &entry {
        info!(project = %id, pid = ?entry.pid, command = %entry.command_line, "running");
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SupervisorEvent::Output { id: source, line }) if source == id => {
                    println!("{line}");
                }
                Ok(SupervisorEvent::Exited { id: source, .. }) if source == id => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "output fell behind"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                info!(project = %id, "interrupted, stopping");
                supervisor.stop(&id).await;
                break;
            }
        }
    }

    if let Some(entry) = &entry {
        if let Some(outcome) = entry.exit_outcome() {
            println!("{}", outcome.log_line());
        }
        info!(project = %id, uptime_secs = entry.started_at.elapsed().as_secs(), "finished");
    }
    println!("{}  {}", id, supervisor.status(&id));
    Ok(())
}

fn project_id(path: &Path) -> Result<ProjectId> {
    let path = std::fs::canonicalize(path)
        .with_context(|| format!("failed to resolve project {}", path.display()))?;
    Ok(ProjectId::from(path))
}

// Configured command for a project, falling back to the default.
fn command_for(id: &ProjectId, config: &Config, settings: &RunSettings) -> String {
    config
        .projects
        .iter()
        .find(|project| override_matches(project, id, &settings.workspace_root))
        .and_then(|project| project.command.clone())
        .unwrap_or_else(|| settings.default_command.clone())
}

fn override_matches(project: &ProjectConfig, id: &ProjectId, root: &Path) -> bool {
    let path = root.join(&project.path);
    let path = std::fs::canonicalize(&path).unwrap_or(path);
    path == id.path()
}

fn load_settings(cli: &Cli) -> Result<(Config, RunSettings)> {
    let mut config = Config::default();
    if !cli.no_config {
        let config_path = cli.config.clone().or_else(default_config_path);
        if let Some(path) = config_path {
            config = config::load_config(&path)?;
        }
    }
    let settings = RunSettings::from_cli(cli, &config)?;
    Ok((config, settings))
}

fn default_config_path() -> Option<PathBuf> {
    let path = Path::new("devdash.toml");
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
}

/// Runtime configuration derived from CLI arguments and the config file.
#[derive(Debug, Clone)]
struct RunSettings {
    workspace_root: PathBuf,
    runtime: String,
    default_command: String,
    skip: Vec<String>,
    supervisor: SupervisorSettings,
}

impl RunSettings {
    fn from_cli(cli: &Cli, config: &Config) -> Result<Self> {
        const DEFAULT_RUNTIME: &str = "node";
        const DEFAULT_COMMAND: &str = "yarn dev";
        const DEFAULT_STOP_TIMEOUT_MS: u64 = 2_000;
        const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
        const DEFAULT_POLL_ATTEMPTS: u32 = 40;

        let root = match &config.workspace_root {
            Some(root) => root.clone(),
            None => std::env::current_dir().context("failed to read current directory")?,
        };
        let workspace_root = std::fs::canonicalize(&root).unwrap_or(root);
        let runtime = cli
            .runtime
            .clone()
            .or_else(|| config.runtime.clone())
            .unwrap_or_else(|| DEFAULT_RUNTIME.to_string());
        let default_command = config
            .default_command
            .clone()
            .unwrap_or_else(|| DEFAULT_COMMAND.to_string());
        let skip = config
            .skip
            .clone()
            .unwrap_or_else(|| vec!["dashboard".to_string()]);

        let supervisor = SupervisorSettings {
            max_lines: cli
                .max_lines
                .or(config.max_lines)
                .unwrap_or(DEFAULT_MAX_LINES)
                .max(1),
            strip_ansi: config.strip_ansi.unwrap_or(true),
            stop_timeout: Duration::from_millis(
                config.stop_timeout_ms.unwrap_or(DEFAULT_STOP_TIMEOUT_MS),
            ),
            external_poll_interval: Duration::from_millis(
                config
                    .external_poll_interval_ms
                    .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            external_poll_attempts: config
                .external_poll_attempts
                .unwrap_or(DEFAULT_POLL_ATTEMPTS),
        };

        Ok(Self {
            workspace_root,
            runtime,
            default_command,
            skip,
            supervisor,
        })
    }
}
