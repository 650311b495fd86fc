//! Shared handles every component is constructed against (§9 "Global
//! mutable state" — the State Store is the only admitted singleton; every
//! other component, including this bundle, is passed in rather than
//! reached for as a module-level static).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, oneshot, watch};

use crate::config::Config;
use crate::domain::WorkflowId;
use crate::engine::MergeDecision;
use crate::event::EventBroker;
use crate::git::GitManager;
use crate::issue_store::IssueStore;
use crate::paths::WorkspacePaths;
use crate::process::ProcessManager;
use crate::store::StateStore;

/// A running workflow's cancellation switch. `false` -> `true` is the
/// only transition; the engine polls it between and during step
/// execution (§5 "Cancellation semantics": cooperative, idempotent).
pub struct WorkflowHandle {
    pub cancel_tx: watch::Sender<bool>,
    pub join: tokio::task::JoinHandle<()>,
}

pub struct Runtime {
    pub config: Config,
    pub paths: WorkspacePaths,
    pub store: StateStore,
    pub events: Arc<EventBroker>,
    pub process: Arc<ProcessManager>,
    pub git: GitManager,
    pub issue_store: Arc<dyn IssueStore>,
    pub workflows: Mutex<HashMap<WorkflowId, WorkflowHandle>>,
    /// Open merge-review gates: a merge step awaiting `/approve-merge` or
    /// `/reject-merge` parks here until the API resolves it (§4.7 "Merge
    /// step", §4.10).
    pub merge_gates: Mutex<HashMap<WorkflowId, oneshot::Sender<MergeDecision>>>,
    /// Serializes `session::start`/`stop`/`force_stop` transitions so two
    /// concurrent API calls can't race the same session (§4.11).
    pub session_lock: Mutex<()>,
    /// Tripped by `POST /shutdown` (§4.10); `main` selects on this
    /// alongside the server future to drive graceful exit.
    pub shutdown: Notify,
}

impl Runtime {
    pub fn new(
        config: Config,
        paths: WorkspacePaths,
        store: StateStore,
        events: Arc<EventBroker>,
        process: Arc<ProcessManager>,
        git: GitManager,
        issue_store: Arc<dyn IssueStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            paths,
            store,
            events,
            process,
            git,
            issue_store,
            workflows: Mutex::new(HashMap::new()),
            merge_gates: Mutex::new(HashMap::new()),
            session_lock: Mutex::new(()),
            shutdown: Notify::new(),
        })
    }

    /// Register a freshly spawned (or re-adopted) workflow task so
    /// `/workflows/{id}` cancel and session force-stop can reach it.
    pub async fn register_workflow(&self, id: WorkflowId, handle: WorkflowHandle) {
        self.workflows.lock().await.insert(id, handle);
    }

    pub async fn forget_workflow(&self, id: &WorkflowId) {
        self.workflows.lock().await.remove(id);
    }

    /// Signal cancellation; idempotent (§8 "Cancel of an already-cancelled
    /// workflow is a no-op") since sending `true` twice is harmless.
    pub async fn signal_cancel(&self, id: &WorkflowId) -> bool {
        let workflows = self.workflows.lock().await;
        if let Some(handle) = workflows.get(id) {
            let _ = handle.cancel_tx.send(true);
            true
        } else {
            false
        }
    }

    pub async fn running_workflow_ids(&self) -> Vec<WorkflowId> {
        self.workflows.lock().await.keys().cloned().collect()
    }
}
