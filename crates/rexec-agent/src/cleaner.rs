use rexec_protocol::{ProcessState, ScriptTicket};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::AgentError;
use crate::workspace::{WorkspaceFactory, WorkspaceState, now_ms};

/// Sweeps workspaces whose client never sent Complete.
#[derive(Debug, Clone)]
pub struct WorkspaceCleaner {
    factory: WorkspaceFactory,
    retention: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanReport {
    pub deleted: usize,
    pub running: usize,
    pub retained: usize,
}

impl WorkspaceCleaner {
    pub fn new(factory: WorkspaceFactory, retention: Duration) -> Self {
        Self { factory, retention }
    }

    /// One sweep. `is_running` reports scripts this agent is still executing;
    /// those are never touched. Everything else is deleted once it has been
    /// idle for the retention period, measured from script completion (or
    /// from creation when the agent lost track of the script).
    pub fn clean(&self, is_running: impl Fn(&ScriptTicket) -> bool) -> Result<CleanReport, AgentError> {
        let now = now_ms();
        let retention_ms = self.retention.as_millis() as u64;
        let mut report = CleanReport::default();

        for (workspace, state) in self.factory.list()? {
            if is_running(&workspace.ticket) {
                report.running += 1;
                continue;
            }
            if now.saturating_sub(idle_since(&state)) < retention_ms {
                report.retained += 1;
                continue;
            }
            match self.factory.delete(&workspace.ticket) {
                Ok(true) => report.deleted += 1,
                Ok(false) => {}
                Err(err) => warn!(ticket = %workspace.ticket, "failed to delete workspace: {err}"),
            }
        }

        if report.deleted > 0 {
            info!(
                deleted = report.deleted,
                retained = report.retained,
                running = report.running,
                "swept orphaned workspaces"
            );
        }
        Ok(report)
    }
}

fn idle_since(state: &WorkspaceState) -> u64 {
    match (state.state, state.completed_at_ms) {
        (ProcessState::Complete, Some(at)) => at,
        _ => state.created_at_ms,
    }
}
