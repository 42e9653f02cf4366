//! Event definitions published by the supervisor.
//!
//! Subscribers (the `run` command's live tail, for one) receive these over a tokio
//! broadcast channel. Each event is sent after the matching log buffer mutation, so a
//! subscriber that falls behind can always recover with `get_logs`.

use crate::process::{ProjectId, ProjectStatus};

/// Capacity of the broadcast channel; slower receivers lag rather than block.
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// A line of output (stdout or stderr) was captured from a managed process.
    Output { id: ProjectId, line: String },
    /// A managed process exited; `code` is `None` for signal termination.
    Exited {
        id: ProjectId,
        code: Option<i32>,
        status: ProjectStatus,
    },
}
