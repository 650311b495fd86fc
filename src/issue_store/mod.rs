//! Issue-Store Adapter (§4.2): the opaque external collaborator
//! supplying the task backlog. Only two operations are in the daemon's
//! contract; everything about how tasks are stored or queried on the
//! other side is none of this module's business.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::{Task, TaskId, TaskStatus};

/// Calls are bounded by this timeout (§4.2, §5 "Timeouts"). A timed-out
/// or erroring call is logged and retried on the next scheduler tick —
/// it must never fail the workflow that depends on it.
pub const ISSUE_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait IssueStore: Send + Sync {
    /// All tasks whose dependencies are satisfied and whose status is
    /// `open` or `in_progress`, in deterministic priority order.
    async fn list_ready_tasks(&self) -> anyhow::Result<Vec<Task>>;

    /// Either the external store reflects the new status, or this
    /// returns an error the caller should treat as retryable.
    async fn update_task_status(&self, id: &TaskId, status: TaskStatus) -> anyhow::Result<()>;
}

/// Call `list_ready_tasks`/`update_task_status` under the fixed 5 s
/// ceiling §4.2 mandates, regardless of which `IssueStore` is wired in.
pub async fn list_ready_tasks_with_timeout(
    store: &dyn IssueStore,
) -> anyhow::Result<Vec<Task>> {
    match tokio::time::timeout(ISSUE_STORE_TIMEOUT, store.list_ready_tasks()).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!("issue store list_ready_tasks timed out after {ISSUE_STORE_TIMEOUT:?}"),
    }
}

pub async fn update_task_status_with_timeout(
    store: &dyn IssueStore,
    id: &TaskId,
    status: TaskStatus,
) -> anyhow::Result<()> {
    match tokio::time::timeout(ISSUE_STORE_TIMEOUT, store.update_task_status(id, status)).await {
        Ok(result) => result,
        Err(_) => anyhow::bail!(
            "issue store update_task_status timed out after {ISSUE_STORE_TIMEOUT:?}"
        ),
    }
}

/// No-op adapter used when no external issue store is configured: the
/// backlog is always empty. A real deployment replaces this with an
/// adapter over whatever tracker the workspace uses.
pub struct NullIssueStore;

#[async_trait]
impl IssueStore for NullIssueStore {
    async fn list_ready_tasks(&self) -> anyhow::Result<Vec<Task>> {
        Ok(Vec::new())
    }

    async fn update_task_status(&self, _id: &TaskId, _status: TaskStatus) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_store_returns_empty_backlog() {
        let store = NullIssueStore;
        let tasks = list_ready_tasks_with_timeout(&store).await.unwrap();
        assert!(tasks.is_empty());
    }

    struct SlowStore;

    #[async_trait]
    impl IssueStore for SlowStore {
        async fn list_ready_tasks(&self) -> anyhow::Result<Vec<Task>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }

        async fn update_task_status(
            &self,
            _id: &TaskId,
            _status: TaskStatus,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_call_times_out() {
        let store = SlowStore;
        let result = list_ready_tasks_with_timeout(&store).await;
        assert!(result.is_err());
    }
}
