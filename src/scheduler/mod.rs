//! Scheduler (§4.8): the periodic reconciliation loop that turns the
//! issue store's backlog into running workflows, bounded by the
//! workspace's concurrency cap. Runs for the life of the daemon as one
//! background task; each tick is a no-op while the session is inactive.

use std::collections::HashSet;
use std::sync::Arc;

use crate::domain::{SessionStatus, TaskId, TaskStatus, WorkflowId};
use crate::engine;
use crate::issue_store;
use crate::process::KillMode;
use crate::runtime::Runtime;

/// Spawn the scheduler tick loop on `runtime.config.poll_interval`.
pub fn spawn(runtime: Arc<Runtime>) -> tokio::task::JoinHandle<()> {
    let period = runtime.config.poll_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            tick(&runtime).await;
        }
    })
}

/// One reconciliation pass (§4.8, steps 1-5):
/// 1. Do nothing unless the session is active.
/// 2. Poll the issue store for ready tasks and cache them.
/// 3. Count currently non-terminal workflows against the cap.
/// 4. Launch a workflow per ready task (priority order) that doesn't
///    already own one, until the cap is reached.
/// 5. Write the new status back to the issue store for each launched task.
async fn tick(runtime: &Arc<Runtime>) {
    if runtime.store.session().await.status != SessionStatus::Active {
        return;
    }

    let tasks = match issue_store::list_ready_tasks_with_timeout(runtime.issue_store.as_ref()).await {
        Ok(tasks) => tasks,
        Err(e) => {
            tracing::warn!("issue store poll failed, retrying next tick: {e:#}");
            return;
        }
    };
    runtime.store.set_tasks(tasks.clone()).await;

    let mut running = runtime.store.non_terminal_workflow_count().await;
    let cap = runtime.config.max_concurrent_agents as usize;
    if running >= cap {
        return;
    }

    let mut ready: Vec<_> = tasks.into_iter().filter(|t| t.is_ready()).collect();
    ready.sort_by_key(|t| t.priority);

    for task in ready {
        if running >= cap {
            break;
        }

        let workflow_id = WorkflowId::new(task.id.as_str());
        if runtime.store.get_workflow(&workflow_id).await.is_some() {
            continue;
        }

        let grimoire_name = task
            .grimoire_label()
            .map(str::to_string)
            .unwrap_or_else(|| runtime.config.grimoire_for_label(&task.task_type).to_string());

        match engine::spawn_workflow(runtime.clone(), task.clone(), grimoire_name).await {
            Ok(_) => {
                running += 1;
                runtime.store.update_task_status(&task.id, TaskStatus::InProgress).await;
                if let Err(e) = issue_store::update_task_status_with_timeout(
                    runtime.issue_store.as_ref(),
                    &task.id,
                    TaskStatus::InProgress,
                )
                .await
                {
                    tracing::warn!("failed to write back status for task {}: {e:#}", task.id);
                }
            }
            Err(e) => {
                tracing::error!("failed to start workflow for task {}: {e:#}", task.id);
            }
        }
    }
}

/// Remove worktrees that outlived the workflow that created them — run
/// once at startup, before the scheduler's first tick (§4.3
/// `DetectOrphans`).
pub async fn remove_orphan_worktrees(runtime: &Runtime) {
    let active: HashSet<TaskId> = runtime
        .store
        .workflows()
        .await
        .into_iter()
        .filter(|w| w.status.is_non_terminal())
        .map(|w| w.task_id)
        .collect();

    let orphans = match runtime.git.detect_orphans(&active) {
        Ok(orphans) => orphans,
        Err(e) => {
            tracing::warn!("failed to detect orphan worktrees: {e:#}");
            return;
        }
    };

    for (path, branch) in orphans {
        tracing::info!("removing orphaned worktree {} ({})", path.display(), branch);
        if let Err(e) = runtime.git.remove_worktree_by_path_and_branch(&path, &branch) {
            tracing::warn!("failed to remove orphan worktree {}: {e:#}", path.display());
        }
    }
}

/// `DELETE /workflows/{id}`: cooperative cancellation. The engine task
/// kills its running agent gracefully and marks the workflow
/// `cancelled`. Idempotent — signalling an already-cancelled workflow is
/// a no-op (§8).
pub async fn cancel_workflow(runtime: &Runtime, id: &WorkflowId) -> bool {
    runtime.signal_cancel(id).await
}

/// As `cancel_workflow`, but also SIGKILLs every agent currently running
/// for this workflow's task rather than waiting on the engine's
/// graceful-kill path.
pub async fn force_cancel_workflow(runtime: &Runtime, id: &WorkflowId) -> bool {
    let signalled = runtime.signal_cancel(id).await;
    if let Some(workflow) = runtime.store.get_workflow(id).await {
        for agent in runtime.store.agents().await {
            if agent.task_id == workflow.task_id && !agent.status.is_terminal() {
                let _ = runtime.process.kill(&agent.step_task_id, KillMode::Force).await;
            }
        }
    }
    signalled
}
