//! Workflow — a live execution of a grimoire against one task (§3, §4.7).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::ids::WorkflowId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Blocked,
    MergePending,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Counts toward the scheduler's concurrency cap (§4.8: "blocked" and
    /// "merge_pending" still own a worktree and may resume).
    pub fn is_non_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Running | WorkflowStatus::Blocked | WorkflowStatus::MergePending
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_non_terminal()
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Blocked => "blocked",
            WorkflowStatus::MergePending => "merge_pending",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One entry in a workflow's ordered step list. `name` is unique within
/// its container (the whole workflow for top-level steps, or the loop body
/// for nested steps).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StepRecord {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// A record of a merge/rebase conflict blocking a workflow (§7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub conflict_files: Vec<String>,
    pub worktree_path: std::path::PathBuf,
    pub source_branch: String,
    pub target_branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Equal to the task id for the primary workflow of a task.
    pub id: WorkflowId,
    pub task_id: super::ids::TaskId,
    pub grimoire_name: String,
    pub status: WorkflowStatus,
    pub steps: Vec<StepRecord>,
    /// Index of the step currently executing (or about to execute).
    pub current_step: usize,
    /// String -> JSON value, holding step outputs and loop counters.
    pub variables: HashMap<String, serde_json::Value>,
    pub conflict: Option<ConflictRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(
        id: WorkflowId,
        task_id: super::ids::TaskId,
        grimoire_name: impl Into<String>,
        step_names: impl IntoIterator<Item = String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            task_id,
            grimoire_name: grimoire_name.into(),
            status: WorkflowStatus::Running,
            steps: step_names.into_iter().map(StepRecord::pending).collect(),
            current_step: 0,
            variables: HashMap::new(),
            conflict: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn current_step_name(&self) -> Option<&str> {
        self.steps.get(self.current_step).map(|s| s.name.as_str())
    }
}
