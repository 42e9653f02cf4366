//! The supervisor façade.
//!
//! `ProcessSupervisor` is the one object the rest of devdash talks to. It combines the
//! table of processes it spawned with the last external scan, and reconciles the two
//! when answering status, log and stop requests. Construct it once per host process and
//! share it (typically behind an `Arc`); its state lives exactly as long as it does.

use std::path::Path;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::events::{SupervisorEvent, EVENT_CAPACITY};
use crate::output::DEFAULT_MAX_LINES;
use crate::process::{ManagedProcessEntry, ProjectId, ProjectStatus};
use crate::runner::{pid_alive, ManagedProcessTable, Terminator};
use crate::scanner::{ExternalProcessScanner, ProcessProbe, ScanSnapshot};

/// Returned by `get_logs` for projects that are only known from scanning.
pub const EXTERNAL_LOGS_PLACEHOLDER: &[&str] = &[
    "This process was started outside devdash; its output is not captured.",
    "Stop it and start it from devdash to see logs here.",
];

/// Tunables for the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// Log buffer capacity per managed project.
    pub max_lines: usize,
    /// Strip ANSI escapes from captured output.
    pub strip_ansi: bool,
    /// Bounded wait for a managed process to exit after SIGTERM.
    pub stop_timeout: Duration,
    /// Delay between liveness checks when stopping external processes.
    pub external_poll_interval: Duration,
    /// Maximum number of liveness checks when stopping external processes.
    pub external_poll_attempts: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_lines: DEFAULT_MAX_LINES,
            strip_ansi: true,
            stop_timeout: Duration::from_secs(2),
            external_poll_interval: Duration::from_millis(500),
            external_poll_attempts: 40,
        }
    }
}

pub struct ProcessSupervisor {
    managed: ManagedProcessTable,
    scanner: ExternalProcessScanner,
    events: broadcast::Sender<SupervisorEvent>,
    settings: SupervisorSettings,
}

impl ProcessSupervisor {
    pub fn new(probe: Box<dyn ProcessProbe>, settings: SupervisorSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let managed = ManagedProcessTable::new(
            events.clone(),
            settings.max_lines,
            settings.strip_ansi,
            settings.stop_timeout,
        );
        Self {
            managed,
            scanner: ExternalProcessScanner::new(probe),
            events,
            settings,
        }
    }

    /// Starts a managed process. Never consults the scan snapshot.
    pub fn start(
        &self,
        id: ProjectId,
        command_line: &str,
        working_dir: &Path,
    ) -> Result<(), SupervisorError> {
        self.managed.start(id, command_line, working_dir)
    }

    /// Stops the project's process, best effort. Never fails.
    ///
    /// A running managed process is signalled through its process group with a bounded
    /// wait. Otherwise every pid the last scan attributed to the project is signalled
    /// directly and polled until it disappears or the retry budget runs out.
    pub async fn stop(&self, id: &ProjectId) {
        if self.managed.stop(id).await {
            // The last scan may have picked up our own child by its working directory.
            if self.scanner.is_running(id) {
                self.scanner.scan().await;
            }
            return;
        }

        let pids = self.scanner.pids(id);
        if pids.is_empty() {
            debug!(project = %id, "nothing to stop");
            return;
        }

        let mut remaining: Vec<u32> = pids
            .into_iter()
            .filter(|pid| Terminator::DIRECT.terminate(*pid).is_some())
            .collect();
        info!(project = %id, pids = ?remaining, "stopping external processes");

        for _ in 0..self.settings.external_poll_attempts {
            remaining.retain(|pid| pid_alive(*pid));
            if remaining.is_empty() {
                break;
            }
            tokio::time::sleep(self.settings.external_poll_interval).await;
        }
        remaining.retain(|pid| pid_alive(*pid));
        if !remaining.is_empty() {
            warn!(project = %id, pids = ?remaining, "external processes still alive after stop");
        }

        self.scanner.scan().await;
    }

    /// `Running` if either source says so, else the managed terminal status, else `Stopped`.
    pub fn status(&self, id: &ProjectId) -> ProjectStatus {
        let managed = self.managed.status(id);
        if managed == ProjectStatus::Running || self.scanner.is_running(id) {
            ProjectStatus::Running
        } else {
            managed
        }
    }

    pub fn get_logs(&self, id: &ProjectId) -> Vec<String> {
        if let Some(logs) = self.managed.get_logs(id) {
            return logs;
        }
        if self.scanner.is_running(id) {
            return EXTERNAL_LOGS_PLACEHOLDER
                .iter()
                .map(|line| line.to_string())
                .collect();
        }
        Vec::new()
    }

    /// Refreshes the external snapshot. Call before listing projects in bulk.
    pub async fn scan_running_processes(&self) {
        self.scanner.scan().await;
    }

    pub fn external_snapshot(&self) -> ScanSnapshot {
        self.scanner.snapshot()
    }

    pub fn managed_entry(&self, id: &ProjectId) -> Option<std::sync::Arc<ManagedProcessEntry>> {
        self.managed.entry(id)
    }

    /// Live output and exit events from managed processes.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::scanner::ScriptedProbe;

    fn supervisor(probe: ScriptedProbe) -> ProcessSupervisor {
        let settings = SupervisorSettings {
            external_poll_interval: Duration::from_millis(50),
            external_poll_attempts: 100,
            ..SupervisorSettings::default()
        };
        ProcessSupervisor::new(Box::new(probe), settings)
    }

    #[tokio::test]
    async fn untracked_project_is_stopped_with_no_logs() {
        let supervisor = supervisor(ScriptedProbe::new(vec![]));
        let id = ProjectId::from("/work/none");
        supervisor.stop(&id).await;
        assert_eq!(supervisor.status(&id), ProjectStatus::Stopped);
        assert!(supervisor.get_logs(&id).is_empty());
    }

    #[tokio::test]
    async fn externally_running_project_reports_running_with_placeholder_logs() {
        let probe = ScriptedProbe::new(vec![Ok(vec![(999_999, PathBuf::from("/work/web"))])]);
        let supervisor = supervisor(probe);
        supervisor.scan_running_processes().await;

        let id = ProjectId::from("/work/web");
        assert_eq!(supervisor.status(&id), ProjectStatus::Running);
        let logs = supervisor.get_logs(&id);
        assert!(!logs.is_empty());
        assert_eq!(logs, EXTERNAL_LOGS_PLACEHOLDER);
    }

    #[tokio::test]
    async fn failed_rescan_keeps_external_status() {
        let probe = ScriptedProbe::new(vec![
            Ok(vec![(999_999, PathBuf::from("/work/web"))]),
            Err(ScriptedProbe::failure()),
        ]);
        let supervisor = supervisor(probe);
        supervisor.scan_running_processes().await;
        supervisor.scan_running_processes().await;
        assert_eq!(
            supervisor.status(&ProjectId::from("/work/web")),
            ProjectStatus::Running
        );
    }

    #[cfg(unix)]
    mod processes {
        use super::*;

        async fn wait_until_exited(supervisor: &ProcessSupervisor, id: &ProjectId) {
            let entry = supervisor.managed_entry(id).unwrap();
            let mut exit = entry.exit_watch();
            tokio::time::timeout(Duration::from_secs(10), exit.wait_for(|o| o.is_some()))
                .await
                .expect("process did not exit in time")
                .unwrap();
        }

        #[tokio::test]
        async fn start_status_stop_round_trip() {
            let supervisor = supervisor(ScriptedProbe::new(vec![]));
            let id = ProjectId::from("/tmp");
            supervisor
                .start(
                    id.clone(),
                    r#"sh -c 'trap "exit 0" TERM; echo ready; while true; do sleep 0.1; done'"#,
                    Path::new("/tmp"),
                )
                .unwrap();
            assert_eq!(supervisor.status(&id), ProjectStatus::Running);

            let err = supervisor.start(id.clone(), "true", Path::new("/tmp")).unwrap_err();
            assert!(matches!(err, SupervisorError::AlreadyRunning(_)));

            let mut ready = false;
            for _ in 0..200 {
                if supervisor.get_logs(&id).iter().any(|line| line == "ready") {
                    ready = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            assert!(ready);

            supervisor.stop(&id).await;
            assert_eq!(supervisor.status(&id), ProjectStatus::Stopped);
        }

        #[tokio::test]
        async fn failing_command_keeps_output_and_reports_error() {
            let supervisor = supervisor(ScriptedProbe::new(vec![]));
            let id = ProjectId::from("/work/failing");
            supervisor
                .start(
                    id.clone(),
                    "sh -c 'echo one; echo two; echo three; exit 4'",
                    Path::new("/tmp"),
                )
                .unwrap();
            wait_until_exited(&supervisor, &id).await;

            assert_eq!(supervisor.status(&id), ProjectStatus::Error);
            assert_eq!(
                supervisor.get_logs(&id),
                vec!["one", "two", "three", "Process exited with code 4"]
            );
        }

        #[tokio::test]
        async fn managed_logs_win_over_external_placeholder() {
            let probe = ScriptedProbe::new(vec![Ok(vec![(999_999, PathBuf::from("/work/both"))])]);
            let supervisor = supervisor(probe);
            let id = ProjectId::from("/work/both");
            supervisor
                .start(id.clone(), "sh -c 'echo mine'", Path::new("/tmp"))
                .unwrap();
            wait_until_exited(&supervisor, &id).await;
            supervisor.scan_running_processes().await;

            assert_eq!(supervisor.status(&id), ProjectStatus::Running);
            assert_eq!(
                supervisor.get_logs(&id),
                vec!["mine", "Process exited with code 0"]
            );
        }

        #[tokio::test]
        async fn managed_stop_refreshes_stale_scan() {
            let id = ProjectId::from("/work/scanned");
            let stale = vec![Ok(vec![(999_999, PathBuf::from("/work/scanned"))])];
            let supervisor = supervisor(ScriptedProbe::new(stale));
            supervisor
                .start(
                    id.clone(),
                    r#"sh -c 'trap "exit 0" TERM; echo ready; while true; do sleep 0.1; done'"#,
                    Path::new("/tmp"),
                )
                .unwrap();
            supervisor.scan_running_processes().await;
            assert!(supervisor.external_snapshot().contains_key(&id));

            let mut ready = false;
            for _ in 0..200 {
                if supervisor.get_logs(&id).iter().any(|line| line == "ready") {
                    ready = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            assert!(ready);

            supervisor.stop(&id).await;
            assert_eq!(
                supervisor.get_logs(&id).last().map(String::as_str),
                Some("Process exited with code 0")
            );
            // The follow-up scan saw nothing left in the project directory.
            assert!(supervisor.external_snapshot().is_empty());
            assert_eq!(supervisor.status(&id), ProjectStatus::Stopped);
        }

        #[tokio::test]
        async fn stop_falls_back_to_polling_external_pids() {
            let mut external = tokio::process::Command::new("sleep")
                .arg("30")
                .spawn()
                .unwrap();
            let pid = external.id().unwrap();
            // Reap it so the pid disappears once it dies.
            let reaper = tokio::spawn(async move { external.wait().await });

            let probe = ScriptedProbe::new(vec![Ok(vec![(pid, PathBuf::from("/work/ext"))])]);
            let supervisor = supervisor(probe);
            supervisor.scan_running_processes().await;
            let id = ProjectId::from("/work/ext");
            assert_eq!(supervisor.status(&id), ProjectStatus::Running);

            supervisor.stop(&id).await;

            assert!(!pid_alive(pid));
            let status = reaper.await.unwrap().unwrap();
            assert!(!status.success());
            // The post-stop rescan found nothing.
            assert_eq!(supervisor.status(&id), ProjectStatus::Stopped);
            assert!(supervisor.get_logs(&id).is_empty());
        }
    }
}
