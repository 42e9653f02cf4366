//! Data structures for tracking process state.
//!
//! This module defines the project identity (`ProjectId`), the lifecycle status reported
//! to callers (`ProjectStatus`), how a managed child ended (`ExitOutcome`), and the
//! per-project record the supervisor keeps for every process it spawned
//! (`ManagedProcessEntry`).

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::output::LogBuffer;

/// Absolute filesystem path of a project; the identity key in every table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ProjectId(PathBuf);

impl ProjectId {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<PathBuf> for ProjectId {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

impl From<&Path> for ProjectId {
    fn from(path: &Path) -> Self {
        Self(path.to_path_buf())
    }
}

impl From<&str> for ProjectId {
    fn from(path: &str) -> Self {
        Self(PathBuf::from(path))
    }
}

/// The lifecycle status of a project as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    /// A process for the project is alive.
    Running,
    /// Nothing is running, or the last run exited cleanly.
    Stopped,
    /// The last run exited with a nonzero code or was killed by a signal.
    Error,
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProjectStatus::Running => "running",
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// How a managed child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    /// Exit code, `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    /// Terminating signal, if any.
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    /// Code 0 is a clean stop; anything else, including a signal, is an error.
    pub fn status(&self) -> ProjectStatus {
        if self.code == Some(0) {
            ProjectStatus::Stopped
        } else {
            ProjectStatus::Error
        }
    }

    /// The synthetic line appended to the log buffer when the process exits.
    pub fn log_line(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("Process exited with code {code}"),
            (None, Some(signal)) => format!("Process exited with code null (signal {signal})"),
            (None, None) => "Process exited with code null".to_string(),
        }
    }
}

/// Mutable part of a managed entry, guarded by the entry's lock.
#[derive(Debug)]
struct EntryState {
    status: ProjectStatus,
    logs: LogBuffer,
}

/// A process the supervisor spawned itself.
///
/// The `tokio::process::Child` is owned by the entry's reaper task, which is the only
/// thing that waits on it. The entry keeps the pid for signal delivery and a watch
/// receiver that flips to `Some` once the reaper has recorded the exit.
#[derive(Debug)]
pub struct ManagedProcessEntry {
    pub id: ProjectId,
    pub command_line: String,
    pub pid: Option<u32>,
    pub started_at: Instant,
    state: Mutex<EntryState>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
}

impl ManagedProcessEntry {
    pub fn new(
        id: ProjectId,
        command_line: String,
        pid: Option<u32>,
        max_lines: usize,
        exit_rx: watch::Receiver<Option<ExitOutcome>>,
    ) -> Self {
        Self {
            id,
            command_line,
            pid,
            started_at: Instant::now(),
            state: Mutex::new(EntryState {
                status: ProjectStatus::Running,
                logs: LogBuffer::new(max_lines),
            }),
            exit_rx,
        }
    }

    /// Status as recorded, with `Running` only reported until the exit is known.
    pub fn status(&self) -> ProjectStatus {
        let recorded = self.state.lock().status;
        match (*self.exit_rx.borrow(), recorded) {
            (Some(outcome), ProjectStatus::Running) => outcome.status(),
            _ => recorded,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status() == ProjectStatus::Running
    }

    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        *self.exit_rx.borrow()
    }

    /// A fresh receiver for waiting on the exit notification.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitOutcome>> {
        self.exit_rx.clone()
    }

    pub fn append_line(&self, line: String) {
        self.state.lock().logs.append(line);
    }

    /// Records the exit: sets the terminal status and appends the synthetic exit line
    /// under one lock so readers never see one without the other.
    pub fn record_exit(&self, outcome: &ExitOutcome) {
        let mut state = self.state.lock();
        state.status = outcome.status();
        state.logs.append(outcome.log_line());
    }

    pub fn logs(&self) -> Vec<String> {
        self.state.lock().logs.snapshot()
    }
}
