//! Daemon startup and shutdown (§6 "Lifecycle files", §4.3 orphan
//! detection, §4.7 crash recovery): wires every component against one
//! workspace root, claims the PID file, re-adopts workflows left
//! `running`/`blocked`/`merge_pending` by a prior crash, then serves the
//! API until told to stop.

use std::sync::Arc;

use anyhow::{Context, Result, bail};

use crate::config::Config;
use crate::domain::WorkflowStatus;
use crate::event::EventBroker;
use crate::git::GitManager;
use crate::issue_store::{IssueStore, NullIssueStore};
use crate::paths::WorkspacePaths;
use crate::process::ProcessManager;
use crate::runtime::Runtime;
use crate::store::StateStore;
use crate::{engine, scheduler};

/// Claim `covend.pid` for this process, removing a stale one left by a
/// process that's no longer alive (§6: "if present and the referenced
/// process is alive and responds to signal 0, the new daemon exits with
/// an error; otherwise stale files are removed").
fn claim_pid_file(paths: &WorkspacePaths) -> Result<()> {
    let pid_path = paths.pid_path();
    if let Ok(existing) = std::fs::read_to_string(&pid_path) {
        if let Ok(pid) = existing.trim().parse::<u32>() {
            if crate::process::is_alive(pid) {
                bail!("covend already running with pid {pid} (remove {} if this is wrong)", pid_path.display());
            }
        }
        std::fs::remove_file(&pid_path).ok();
        std::fs::remove_file(paths.socket_path()).ok();
    }
    std::fs::write(&pid_path, format!("{}\n", std::process::id()))
        .with_context(|| format!("writing {}", pid_path.display()))
}

fn release_pid_file(paths: &WorkspacePaths) {
    std::fs::remove_file(paths.pid_path()).ok();
    std::fs::remove_file(paths.socket_path()).ok();
}

/// Build the shared [`Runtime`] for `workspace_root`, claiming the PID
/// file and creating every `.coven/` subdirectory. The issue store is a
/// [`NullIssueStore`] placeholder — an opaque, contract-only collaborator
/// (§4.2) a real deployment wires to whatever tracker the workspace uses.
pub async fn build_runtime(workspace_root: impl Into<std::path::PathBuf>) -> Result<Arc<Runtime>> {
    let paths = WorkspacePaths::new(workspace_root.into());
    paths.ensure_dirs().context("creating .coven directories")?;
    claim_pid_file(&paths)?;

    let config = Config::load(&paths.config_path())?;
    let events = Arc::new(EventBroker::new());
    let store = StateStore::load(paths.state_path(), events.clone());
    let process = Arc::new(ProcessManager::new(paths.clone()));
    let git = GitManager::new(paths.workspace_root())?;
    let issue_store: Arc<dyn IssueStore> = Arc::new(NullIssueStore);

    Ok(Runtime::new(config, paths, store, events, process, git, issue_store))
}

/// Run the daemon to completion: orphan cleanup, crash-recovery
/// re-adoption, scheduler, API server, then release the PID file on
/// exit (graceful or not).
pub async fn run(runtime: Arc<Runtime>) -> Result<()> {
    scheduler::remove_orphan_worktrees(&runtime).await;

    let resumable: Vec<_> = runtime
        .store
        .workflows()
        .await
        .into_iter()
        .filter(|w| {
            matches!(w.status, WorkflowStatus::Running | WorkflowStatus::Blocked | WorkflowStatus::MergePending)
        })
        .map(|w| w.id)
        .collect();
    for workflow_id in resumable {
        tracing::info!("resuming workflow {}", workflow_id.as_str());
        engine::resume_workflow(runtime.clone(), workflow_id).await;
    }

    let _scheduler_handle = scheduler::spawn(runtime.clone());

    let paths = runtime.paths.clone();
    let result = crate::api::serve(runtime).await;
    release_pid_file(&paths);
    result
}
