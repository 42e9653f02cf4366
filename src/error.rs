//! Error types returned by the process supervisor.

use std::path::PathBuf;

use thiserror::Error;

use crate::process::ProjectId;

/// Errors surfaced to callers of the supervisor.
///
/// Scan failures and signal-delivery failures never appear here; they are logged and
/// tolerated.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("process for {0} is already running")]
    AlreadyRunning(ProjectId),

    #[error("failed to spawn `{command}` in {}: {source}", .cwd.display())]
    SpawnFailed {
        command: String,
        cwd: PathBuf,
        #[source]
        source: SpawnError,
    },
}

/// Why a command line could not be turned into a running child.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("empty command line")]
    Empty,

    #[error("invalid command line: {0}")]
    Parse(#[from] shell_words::ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
