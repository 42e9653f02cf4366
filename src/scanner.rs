//! Discovery of dev servers started outside devdash.
//!
//! The scanner asks the OS which processes of the configured runtime are alive and
//! where their working directory is, and groups their pids by that directory. Matching
//! is by working directory only, so a project can map to several candidate pids.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::process::ProjectId;

/// Project → pids of externally started processes running in it.
pub type ScanSnapshot = HashMap<ProjectId, BTreeSet<u32>>;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// OS process enumeration: pids and working directories of processes matching a runtime.
#[async_trait]
pub trait ProcessProbe: Send + Sync {
    async fn list(&self) -> Result<Vec<(u32, PathBuf)>, ScanError>;
}

/// Probe backed by `lsof -a -c <runtime> -d cwd -F pn`.
#[derive(Debug, Clone)]
pub struct LsofProbe {
    runtime: String,
}

impl LsofProbe {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }
}

#[async_trait]
impl ProcessProbe for LsofProbe {
    async fn list(&self) -> Result<Vec<(u32, PathBuf)>, ScanError> {
        let output = Command::new("lsof")
            .args(["-w", "-a", "-c", self.runtime.as_str(), "-d", "cwd", "-F", "pn"])
            .output()
            .await
            .map_err(|source| ScanError::Spawn {
                program: "lsof",
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        // lsof exits 1 both when nothing matches and on real failures; only stderr tells them apart.
        if !output.status.success() && stdout.trim().is_empty() && !stderr.trim().is_empty() {
            return Err(ScanError::Failed {
                program: "lsof",
                status: output.status,
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(parse_lsof_fields(&stdout))
    }
}

/// Parses `lsof -F pn` output: a `p<pid>` line opens a process record, and the
/// following `n<path>` line carries the name of its (cwd) file descriptor.
pub fn parse_lsof_fields(output: &str) -> Vec<(u32, PathBuf)> {
    let mut processes = Vec::new();
    let mut current: Option<u32> = None;
    for line in output.lines() {
        let mut chars = line.chars();
        match chars.next() {
            Some('p') => current = chars.as_str().trim().parse().ok(),
            Some('n') => {
                if let Some(pid) = current {
                    let path = chars.as_str();
                    if !path.is_empty() {
                        processes.push((pid, PathBuf::from(path)));
                    }
                }
            }
            _ => {}
        }
    }
    processes
}

/// Holds the most recent scan snapshot; every successful scan replaces it wholesale.
pub struct ExternalProcessScanner {
    probe: Box<dyn ProcessProbe>,
    snapshot: RwLock<ScanSnapshot>,
}

impl ExternalProcessScanner {
    pub fn new(probe: Box<dyn ProcessProbe>) -> Self {
        Self {
            probe,
            snapshot: RwLock::new(ScanSnapshot::new()),
        }
    }

    /// Rebuilds the snapshot. On probe failure the previous snapshot is kept and
    /// `false` is returned.
    pub async fn scan(&self) -> bool {
        let processes = match self.probe.list().await {
            Ok(processes) => processes,
            Err(err) => {
                warn!(error = %err, "process scan failed, keeping previous snapshot");
                return false;
            }
        };

        let own_pid = std::process::id();
        let mut snapshot = ScanSnapshot::new();
        for (pid, cwd) in processes {
            if pid == own_pid {
                continue;
            }
            snapshot.entry(ProjectId::from(cwd)).or_default().insert(pid);
        }
        debug!(projects = snapshot.len(), "process scan complete");
        *self.snapshot.write() = snapshot;
        true
    }

    /// Candidate pids for `id` from the last scan.
    pub fn pids(&self, id: &ProjectId) -> Vec<u32> {
        self.snapshot
            .read()
            .get(id)
            .map(|pids| pids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_running(&self, id: &ProjectId) -> bool {
        self.snapshot
            .read()
            .get(id)
            .is_some_and(|pids| !pids.is_empty())
    }

    pub fn snapshot(&self) -> ScanSnapshot {
        self.snapshot.read().clone()
    }
}

#[cfg(test)]
type ProbeResult = Result<Vec<(u32, PathBuf)>, ScanError>;

/// Probe that replays queued results, for tests.
#[cfg(test)]
pub(crate) struct ScriptedProbe {
    results: parking_lot::Mutex<std::collections::VecDeque<ProbeResult>>,
}

#[cfg(test)]
impl ScriptedProbe {
    pub(crate) fn new(results: Vec<ProbeResult>) -> Self {
        Self {
            results: parking_lot::Mutex::new(results.into()),
        }
    }

    pub(crate) fn failure() -> ScanError {
        ScanError::Spawn {
            program: "lsof",
            source: io::Error::new(io::ErrorKind::NotFound, "lsof not installed"),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl ProcessProbe for ScriptedProbe {
    async fn list(&self) -> ProbeResult {
        self.results.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pid_and_cwd_records() {
        let output = "p4242\nfcwd\nn/Users/dev/work/web\np5150\nfcwd\nn/Users/dev/work/api\np77\nfcwd\nn/Users/dev/work/web\n";
        let parsed = parse_lsof_fields(output);
        assert_eq!(
            parsed,
            vec![
                (4242, PathBuf::from("/Users/dev/work/web")),
                (5150, PathBuf::from("/Users/dev/work/api")),
                (77, PathBuf::from("/Users/dev/work/web")),
            ]
        );
    }

    #[test]
    fn ignores_malformed_records() {
        let output = "pnot-a-pid\nn/orphan\n\nfcwd\np12\nn\np13\nn/with space/dir\n";
        assert_eq!(
            parse_lsof_fields(output),
            vec![(13, PathBuf::from("/with space/dir"))]
        );
        assert!(parse_lsof_fields("").is_empty());
    }

    #[tokio::test]
    async fn scan_groups_pids_by_project() {
        let probe = ScriptedProbe::new(vec![Ok(vec![
            (10, PathBuf::from("/work/web")),
            (11, PathBuf::from("/work/web")),
            (20, PathBuf::from("/work/api")),
        ])]);
        let scanner = ExternalProcessScanner::new(Box::new(probe));
        assert!(scanner.scan().await);

        assert_eq!(scanner.pids(&"/work/web".into()), vec![10, 11]);
        assert!(scanner.is_running(&"/work/api".into()));
        assert!(!scanner.is_running(&"/work/docs".into()));
    }

    #[tokio::test]
    async fn scan_replaces_snapshot_wholesale() {
        let probe = ScriptedProbe::new(vec![
            Ok(vec![(10, PathBuf::from("/work/web"))]),
            Ok(vec![(20, PathBuf::from("/work/api"))]),
        ]);
        let scanner = ExternalProcessScanner::new(Box::new(probe));
        scanner.scan().await;
        scanner.scan().await;

        let snapshot = scanner.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(!scanner.is_running(&"/work/web".into()));
        assert_eq!(scanner.pids(&"/work/api".into()), vec![20]);
    }

    #[tokio::test]
    async fn failed_scan_keeps_stale_snapshot() {
        let probe = ScriptedProbe::new(vec![
            Ok(vec![(10, PathBuf::from("/work/web"))]),
            Err(ScriptedProbe::failure()),
        ]);
        let scanner = ExternalProcessScanner::new(Box::new(probe));
        assert!(scanner.scan().await);
        assert!(!scanner.scan().await);
        assert_eq!(scanner.pids(&"/work/web".into()), vec![10]);
    }

    #[tokio::test]
    async fn own_pid_is_never_reported() {
        let probe = ScriptedProbe::new(vec![Ok(vec![(
            std::process::id(),
            PathBuf::from("/work/devdash"),
        )])]);
        let scanner = ExternalProcessScanner::new(Box::new(probe));
        scanner.scan().await;
        assert!(scanner.snapshot().is_empty());
    }
}
