//! Agent — one OS subprocess executing an agent step (§3, §4.4).
//!
//! An `Agent` is a live process record owned by the State Store, one
//! field per fact about the process — not a static adapter config.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::ids::{StepTaskId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Killed,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Killed
        )
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Starting => "starting",
            AgentStatus::Running => "running",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Killed => "killed",
        };
        write!(f, "{}", s)
    }
}

/// Identity of a spawned OS process, recorded at spawn time so a daemon
/// restart can verify a `running` agent still corresponds to a live
/// process (§4.4 "Identity").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    /// Process start time, truncated to the second — the granularity a
    /// restart-time identity check can reliably compare.
    pub started_at: DateTime<Utc>,
    pub command: String,
}

/// One live (or once-live) agent process, exactly one record per process
/// (§3 invariant: a `running` agent must correspond to a live OS process
/// whose start time matches; no two live agents share a `step_task_id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub task_id: TaskId,
    pub step_task_id: StepTaskId,
    pub identity: Option<ProcessIdentity>,
    pub status: AgentStatus,
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl Agent {
    pub fn new(
        task_id: TaskId,
        step_task_id: StepTaskId,
        worktree_path: PathBuf,
        branch_name: String,
    ) -> Self {
        Self {
            task_id,
            step_task_id,
            identity: None,
            status: AgentStatus::Starting,
            worktree_path,
            branch_name,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self, identity: ProcessIdentity) {
        self.identity = Some(identity);
        self.status = AgentStatus::Running;
    }

    pub fn mark_completed(&mut self, exit_code: i32) {
        self.status = if exit_code == 0 {
            AgentStatus::Completed
        } else {
            AgentStatus::Failed
        };
        self.exit_code = Some(exit_code);
        self.ended_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = AgentStatus::Failed;
        self.error = Some(error.into());
        self.ended_at = Some(Utc::now());
    }

    pub fn mark_killed(&mut self, error: impl Into<String>) {
        self.status = AgentStatus::Killed;
        self.error = Some(error.into());
        self.ended_at = Some(Utc::now());
    }
}
