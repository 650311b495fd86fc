//! Task — the unit of work supplied by the external issue store (§3, §4.2).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::ids::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    PendingMerge,
    Blocked,
    Closed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::PendingMerge => "pending_merge",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// A task as supplied by the issue store and cached in the State Store.
/// The daemon only ever mutates `status`; every other field is owned by
/// the external collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub body: Option<String>,
    pub status: TaskStatus,
    /// Smaller integer = higher priority.
    pub priority: i64,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub labels: HashSet<String>,
    #[serde(default)]
    pub depends_on: HashSet<TaskId>,
    #[serde(default)]
    pub blocks: HashSet<TaskId>,
}

impl Task {
    /// The grimoire name requested via a `grimoire:<name>` label, if any.
    pub fn grimoire_label(&self) -> Option<&str> {
        self.labels
            .iter()
            .find_map(|l| l.strip_prefix("grimoire:"))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.status, TaskStatus::Open | TaskStatus::InProgress)
    }
}
