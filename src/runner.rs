//! Process execution and management.
//!
//! This module contains the `ManagedProcessTable`, which spawns project commands,
//! captures their output into per-project log buffers, reaps them, and stops them
//! by signalling their process group. `Terminator` holds the signal delivery steps.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SpawnError, SupervisorError};
use crate::events::SupervisorEvent;
use crate::output::decode_chunk;
use crate::process::{ExitOutcome, ManagedProcessEntry, ProjectId, ProjectStatus};

/// How long the reaper waits for stdout/stderr to reach EOF once the child has exited.
/// Descendants that inherited the pipes can keep them open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// One way of delivering a termination signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillStep {
    /// Signal every process in the group led by the pid.
    Group,
    /// Signal the pid alone.
    Direct,
}

/// Ordered signal delivery strategy: each step is tried until one is delivered.
#[derive(Debug, Clone, Copy)]
pub struct Terminator {
    steps: &'static [KillStep],
}

impl Terminator {
    /// Used for processes spawned into their own group.
    pub const GROUP_THEN_DIRECT: Terminator = Terminator {
        steps: &[KillStep::Group, KillStep::Direct],
    };

    /// Used for processes we did not spawn; their group may include unrelated processes.
    pub const DIRECT: Terminator = Terminator {
        steps: &[KillStep::Direct],
    };

    /// Sends SIGTERM using the first step that succeeds. Returns that step, or `None`
    /// when every step failed.
    pub fn terminate(&self, pid: u32) -> Option<KillStep> {
        for step in self.steps {
            match deliver_term(*step, pid) {
                Ok(()) => {
                    debug!(pid, ?step, "sent SIGTERM");
                    return Some(*step);
                }
                Err(err) => debug!(pid, ?step, error = %err, "signal delivery failed"),
            }
        }
        warn!(pid, "could not deliver SIGTERM");
        None
    }
}

#[cfg(unix)]
fn deliver_term(step: KillStep, pid: u32) -> io::Result<()> {
    let pid = checked_pid(pid)?;
    let target = match step {
        KillStep::Group => -pid,
        KillStep::Direct => pid,
    };
    let rc = unsafe { libc::kill(target, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn deliver_term(_step: KillStep, _pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signals are not supported on this platform",
    ))
}

/// Whether a process with this pid still exists.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = checked_pid(pid) else {
        return false;
    };
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

// Pid 0 and values that wrap negative would address our own group or every process.
#[cfg(unix)]
fn checked_pid(pid: u32) -> io::Result<i32> {
    match i32::try_from(pid) {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        )),
    }
}

/// Registry of processes spawned by the supervisor, keyed by project.
pub struct ManagedProcessTable {
    entries: Mutex<HashMap<ProjectId, Arc<ManagedProcessEntry>>>,
    events: broadcast::Sender<SupervisorEvent>,
    max_lines: usize,
    strip_ansi: bool,
    stop_timeout: Duration,
}

impl ManagedProcessTable {
    pub fn new(
        events: broadcast::Sender<SupervisorEvent>,
        max_lines: usize,
        strip_ansi: bool,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
            max_lines,
            strip_ansi,
            stop_timeout,
        }
    }

    /// Spawns `command_line` in `working_dir` as the managed process for `id`.
    ///
    /// The running check, the spawn and the insertion happen under the table lock, so
    /// two concurrent starts for one project cannot both succeed. Must be called from
    /// within a tokio runtime.
    pub fn start(
        &self,
        id: ProjectId,
        command_line: &str,
        working_dir: &Path,
    ) -> Result<(), SupervisorError> {
        let mut entries = self.entries.lock();
        if entries.get(&id).is_some_and(|entry| entry.is_running()) {
            return Err(SupervisorError::AlreadyRunning(id));
        }

        let child = spawn_command(command_line, working_dir).map_err(|source| {
            SupervisorError::SpawnFailed {
                command: command_line.to_string(),
                cwd: working_dir.to_path_buf(),
                source,
            }
        })?;

        let pid = child.id();
        info!(project = %id, ?pid, command = command_line, "started process");

        let (exit_tx, exit_rx) = watch::channel(None);
        let entry = Arc::new(ManagedProcessEntry::new(
            id.clone(),
            command_line.to_string(),
            pid,
            self.max_lines,
            exit_rx,
        ));
        self.supervise(entry.clone(), child, exit_tx);
        entries.insert(id, entry);
        Ok(())
    }

    // Wire the output readers and the reaper for a freshly spawned child.
    fn supervise(
        &self,
        entry: Arc<ManagedProcessEntry>,
        mut child: Child,
        exit_tx: watch::Sender<Option<ExitOutcome>>,
    ) {
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(capture_output(
                entry.clone(),
                stdout,
                self.strip_ansi,
                self.events.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(capture_output(
                entry.clone(),
                stderr,
                self.strip_ansi,
                self.events.clone(),
            )));
        }
        tokio::spawn(reap(entry, child, readers, exit_tx, self.events.clone()));
    }

    /// Signals the managed process for `id` and waits, bounded, for it to exit.
    ///
    /// Returns `false` when there was no running managed process to stop. A process
    /// that outlives the wait is left alone; stop does not escalate.
    pub async fn stop(&self, id: &ProjectId) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        if !entry.is_running() {
            return false;
        }
        let Some(pid) = entry.pid else {
            return false;
        };

        let mut exit = entry.exit_watch();
        Terminator::GROUP_THEN_DIRECT.terminate(pid);
        let exited = matches!(
            tokio::time::timeout(self.stop_timeout, exit.wait_for(|outcome| outcome.is_some()))
                .await,
            Ok(Ok(_))
        );
        if exited {
            debug!(project = %id, pid, "process exited after stop");
        } else {
            warn!(
                project = %id,
                pid,
                timeout_ms = self.stop_timeout.as_millis() as u64,
                "process still running after stop timeout"
            );
        }
        true
    }

    /// Recorded status, `Stopped` for untracked projects.
    pub fn status(&self, id: &ProjectId) -> ProjectStatus {
        self.entry(id)
            .map(|entry| entry.status())
            .unwrap_or(ProjectStatus::Stopped)
    }

    /// Log snapshot, or `None` when the project has never been started here.
    pub fn get_logs(&self, id: &ProjectId) -> Option<Vec<String>> {
        self.entry(id).map(|entry| entry.logs())
    }

    pub fn entry(&self, id: &ProjectId) -> Option<Arc<ManagedProcessEntry>> {
        self.entries.lock().get(id).cloned()
    }
}

fn spawn_command(command_line: &str, working_dir: &Path) -> Result<Child, SpawnError> {
    let mut parts = shell_words::split(command_line)?;
    if parts.is_empty() {
        return Err(SpawnError::Empty);
    }
    let program = parts.remove(0);

    let mut command = Command::new(program);
    command
        .args(parts)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    Ok(command.spawn()?)
}

async fn capture_output<R>(
    entry: Arc<ManagedProcessEntry>,
    reader: R,
    strip_ansi: bool,
    events: broadcast::Sender<SupervisorEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut chunk = Vec::new();
    loop {
        chunk.clear();
        match reader.read_until(b'\n', &mut chunk).await {
            Ok(0) => break,
            Ok(_) => {
                let line = decode_chunk(&chunk, strip_ansi);
                entry.append_line(line.clone());
                let _ = events.send(SupervisorEvent::Output {
                    id: entry.id.clone(),
                    line,
                });
            }
            Err(err) => {
                debug!(project = %entry.id, error = %err, "output stream closed");
                break;
            }
        }
    }
}

// Sole owner of the child: waits for it, lets the readers drain, then records the exit.
async fn reap(
    entry: Arc<ManagedProcessEntry>,
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
    events: broadcast::Sender<SupervisorEvent>,
) {
    let outcome = match child.wait().await {
        Ok(status) => ExitOutcome::from_status(status),
        Err(err) => {
            warn!(project = %entry.id, error = %err, "failed to wait on process");
            ExitOutcome {
                code: None,
                signal: None,
            }
        }
    };

    let drain = async {
        for reader in readers {
            let _ = reader.await;
        }
    };
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
        debug!(project = %entry.id, "output still open after exit");
    }

    entry.record_exit(&outcome);
    exit_tx.send_replace(Some(outcome));
    info!(project = %entry.id, code = ?outcome.code, signal = ?outcome.signal, "process exited");
    let _ = events.send(SupervisorEvent::Exited {
        id: entry.id.clone(),
        code: outcome.code,
        status: outcome.status(),
    });
}
