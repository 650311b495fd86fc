//! State Store (§4.1): single-writer, multi-reader in-memory snapshot of
//! agents, tasks, workflows and questions, flushed to `state.json` on
//! every mutation.
//!
//! Atomic-write pattern throughout (lock file + temp-file-then-rename):
//! every mutator here takes the write lock, applies the change in
//! memory, and schedules a flush of the *whole* snapshot onto a
//! dedicated flush task fed by an `mpsc` channel, so no mutator ever
//! blocks on disk I/O and readers never see a torn write.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};

use crate::domain::{
    Agent, Question, QuestionId, Session, SessionStatus, StepTaskId, Task, TaskId, Workflow,
    WorkflowId,
};
use crate::event::{EventBroker, EventType};

/// The on-disk (and in-memory) shape of the full snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub tasks: HashMap<TaskId, Task>,
    pub agents: HashMap<StepTaskId, Agent>,
    pub workflows: HashMap<WorkflowId, Workflow>,
    pub questions: HashMap<QuestionId, Question>,
    #[serde(default)]
    pub session: Session,
    /// When `set_tasks` last replaced the task cache (§6 `/tasks`,
    /// "cached list plus the time it was last refreshed from the issue
    /// store"). `None` until the first successful poll.
    #[serde(default)]
    pub tasks_synced_at: Option<chrono::DateTime<chrono::Utc>>,
}

struct Inner {
    snapshot: RwLock<Snapshot>,
    flush_tx: mpsc::UnboundedSender<()>,
    events: Arc<EventBroker>,
}

/// Cloneable handle; every mutator persists and emits events under the
/// hood, so callers never have to remember to do either.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

impl StateStore {
    /// Load `state.json` if present (starting empty on missing/malformed
    /// file, per §4.1), then spin up the dedicated flush task.
    pub fn load(state_path: PathBuf, events: Arc<EventBroker>) -> Self {
        let snapshot = std::fs::read_to_string(&state_path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();

        let (flush_tx, mut flush_rx) = mpsc::unbounded_channel::<()>();

        let inner = Arc::new(Inner {
            snapshot: RwLock::new(snapshot),
            flush_tx,
            events,
        });

        let flush_inner = inner.clone();
        let flush_path = state_path;
        tokio::spawn(async move {
            while flush_rx.recv().await.is_some() {
                let snapshot = flush_inner.snapshot.read().await.clone();
                if let Err(e) = write_snapshot_atomic(&flush_path, &snapshot) {
                    tracing::warn!("failed to flush state store to {:?}: {e:#}", flush_path);
                }
            }
        });

        Self { inner }
    }

    fn request_flush(&self) {
        // An unbounded channel of unit signals: if the flush task is
        // behind, duplicate signals just collapse into one extra loop
        // iteration that re-reads the (now latest) snapshot.
        let _ = self.inner.flush_tx.send(());
    }

    fn emit(&self, event_type: EventType, data: serde_json::Value) {
        self.inner.events.publish(event_type, data);
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.inner.snapshot.read().await.clone()
    }

    // -- Tasks ---------------------------------------------------------

    pub async fn tasks(&self) -> Vec<Task> {
        self.inner.snapshot.read().await.tasks.values().cloned().collect()
    }

    pub async fn get_task(&self, id: &TaskId) -> Option<Task> {
        self.inner.snapshot.read().await.tasks.get(id).cloned()
    }

    /// Replace the whole task cache (the Scheduler calls this once per
    /// tick after polling the issue store) and emit `tasks.updated` only
    /// when the set actually differs.
    pub async fn set_tasks(&self, tasks: Vec<Task>) {
        let mut snapshot = self.inner.snapshot.write().await;
        let incoming: HashMap<TaskId, Task> =
            tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
        let changed = incoming.len() != snapshot.tasks.len()
            || !incoming
                .iter()
                .all(|(id, t)| snapshot.tasks.get(id).map(|e| e.status) == Some(t.status));
        snapshot.tasks = incoming;
        snapshot.tasks_synced_at = Some(chrono::Utc::now());
        drop(snapshot);
        self.request_flush();
        if changed {
            self.emit(EventType::TasksUpdated, serde_json::json!({}));
        }
    }

    pub async fn tasks_synced_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.inner.snapshot.read().await.tasks_synced_at
    }

    pub async fn update_task_status(&self, id: &TaskId, status: crate::domain::TaskStatus) {
        let mut snapshot = self.inner.snapshot.write().await;
        if let Some(task) = snapshot.tasks.get_mut(id) {
            task.status = status;
        }
        drop(snapshot);
        self.request_flush();
    }

    // -- Agents ----------------------------------------------------------

    pub async fn agents(&self) -> Vec<Agent> {
        self.inner.snapshot.read().await.agents.values().cloned().collect()
    }

    pub async fn get_agent(&self, step_task_id: &StepTaskId) -> Option<Agent> {
        self.inner.snapshot.read().await.agents.get(step_task_id).cloned()
    }

    pub async fn add_agent(&self, agent: Agent) {
        let key = agent.step_task_id.clone();
        let mut snapshot = self.inner.snapshot.write().await;
        snapshot.agents.insert(key, agent.clone());
        drop(snapshot);
        self.request_flush();
        self.emit(
            EventType::AgentStarted,
            serde_json::json!({"step_task_id": agent.step_task_id, "task_id": agent.task_id}),
        );
    }

    pub async fn update_agent<F: FnOnce(&mut Agent)>(&self, step_task_id: &StepTaskId, f: F) {
        let mut snapshot = self.inner.snapshot.write().await;
        if let Some(agent) = snapshot.agents.get_mut(step_task_id) {
            f(agent);
        }
        drop(snapshot);
        self.request_flush();
    }

    pub async fn remove_agent(&self, step_task_id: &StepTaskId) {
        let mut snapshot = self.inner.snapshot.write().await;
        snapshot.agents.remove(step_task_id);
        drop(snapshot);
        self.request_flush();
    }

    // -- Workflows -------------------------------------------------------

    pub async fn workflows(&self) -> Vec<Workflow> {
        self.inner.snapshot.read().await.workflows.values().cloned().collect()
    }

    pub async fn get_workflow(&self, id: &WorkflowId) -> Option<Workflow> {
        self.inner.snapshot.read().await.workflows.get(id).cloned()
    }

    pub async fn upsert_workflow(&self, workflow: Workflow) {
        let mut snapshot = self.inner.snapshot.write().await;
        snapshot.workflows.insert(workflow.id.clone(), workflow);
        drop(snapshot);
        self.request_flush();
    }

    pub async fn update_workflow<F: FnOnce(&mut Workflow)>(&self, id: &WorkflowId, f: F) {
        let mut snapshot = self.inner.snapshot.write().await;
        if let Some(workflow) = snapshot.workflows.get_mut(id) {
            f(workflow);
        }
        drop(snapshot);
        self.request_flush();
    }

    pub async fn remove_workflow(&self, id: &WorkflowId) {
        let mut snapshot = self.inner.snapshot.write().await;
        snapshot.workflows.remove(id);
        drop(snapshot);
        self.request_flush();
    }

    /// Count workflows whose status still occupies a concurrency slot
    /// (§4.8: `running`, `blocked`, `merge_pending`).
    pub async fn non_terminal_workflow_count(&self) -> usize {
        self.inner
            .snapshot
            .read()
            .await
            .workflows
            .values()
            .filter(|w| w.status.is_non_terminal())
            .count()
    }

    // -- Questions ---------------------------------------------------------

    pub async fn questions(&self) -> Vec<Question> {
        self.inner.snapshot.read().await.questions.values().cloned().collect()
    }

    pub async fn get_question(&self, id: &QuestionId) -> Option<Question> {
        self.inner.snapshot.read().await.questions.get(id).cloned()
    }

    pub async fn add_question(&self, question: Question) {
        let mut snapshot = self.inner.snapshot.write().await;
        snapshot.questions.insert(question.id.clone(), question.clone());
        drop(snapshot);
        self.request_flush();
        self.emit(
            EventType::AgentQuestion,
            serde_json::json!({"id": question.id, "task_id": question.task_id}),
        );
    }

    pub async fn pending_questions_for_task(&self, task_id: &TaskId) -> Vec<Question> {
        self.inner
            .snapshot
            .read()
            .await
            .questions
            .values()
            .filter(|q| &q.task_id == task_id && !q.is_answered())
            .cloned()
            .collect()
    }

    pub async fn update_question<F: FnOnce(&mut Question)>(&self, id: &QuestionId, f: F) {
        let mut snapshot = self.inner.snapshot.write().await;
        if let Some(question) = snapshot.questions.get_mut(id) {
            f(question);
        }
        drop(snapshot);
        self.request_flush();
    }

    pub async fn clear_questions_for_task(&self, task_id: &TaskId) {
        let mut snapshot = self.inner.snapshot.write().await;
        snapshot.questions.retain(|_, q| &q.task_id != task_id);
        drop(snapshot);
        self.request_flush();
    }

    // -- Session -----------------------------------------------------------

    pub async fn session(&self) -> Session {
        self.inner.snapshot.read().await.session.clone()
    }

    pub async fn set_session_status(&self, status: SessionStatus) {
        let mut snapshot = self.inner.snapshot.write().await;
        snapshot.session.status = status;
        if status == SessionStatus::Active {
            snapshot.session.started_at = Some(chrono::Utc::now());
        }
        drop(snapshot);
        self.request_flush();
    }
}

fn write_snapshot_atomic(path: &std::path::Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let content =
        serde_json::to_string_pretty(snapshot).with_context(|| "Failed to serialize state")?;

    let lock_path = path.with_extension("json.lock");
    let lock_file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&lock_path)
        .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;
    lock_file
        .lock_exclusive()
        .with_context(|| "Failed to acquire state lock")?;

    let temp_path = path.with_extension("json.tmp");
    {
        use std::io::Write;
        let mut temp_file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        temp_file
            .write_all(content.as_bytes())
            .with_context(|| "Failed to write state content")?;
        temp_file
            .sync_all()
            .with_context(|| "Failed to sync state file")?;
    }

    std::fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename state file: {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Agent, ProcessIdentity};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn wait_for_flush(path: &std::path::Path) {
        for _ in 0..50 {
            if path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn mutations_flush_and_reload() {
        let tmp = TempDir::new().unwrap();
        let state_path = tmp.path().join("state.json");
        let events = Arc::new(EventBroker::new());
        let store = StateStore::load(state_path.clone(), events.clone());

        let task_id = TaskId::new("T1");
        let mut agent = Agent::new(
            task_id.clone(),
            StepTaskId::new(&task_id, 0),
            tmp.path().to_path_buf(),
            "coven/t1".to_string(),
        );
        agent.mark_running(ProcessIdentity {
            pid: 1234,
            started_at: chrono::Utc::now(),
            command: "claude".to_string(),
        });
        store.add_agent(agent).await;

        wait_for_flush(&state_path).await;
        let reloaded = StateStore::load(state_path, events);
        assert_eq!(reloaded.agents().await.len(), 1);
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let tmp = TempDir::new().unwrap();
        let events = Arc::new(EventBroker::new());
        let store = StateStore::load(tmp.path().join("state.json"), events);
        assert!(store.tasks().await.is_empty());
    }
}
