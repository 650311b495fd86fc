//! Session Lifecycle (§4.11): Start/Stop/ForceStop, the state machine
//! gating whether the Scheduler is allowed to launch new work.
//!
//! Every transition is taken under `runtime.session_lock` so two
//! concurrent API calls can't race the same session.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::domain::{AgentStatus, SessionStatus};
use crate::event::EventType;
use crate::process::KillMode;
use crate::runtime::Runtime;

// The closed event set (§4.9) has no dedicated session events; a
// session transition is visible to stream subscribers only indirectly,
// through the `agent.failed` events a force-stop emits and the next
// `state.snapshot`/`/state` poll.

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is already active")]
    AlreadyActive,
    #[error("session is not active")]
    NotActive,
}

/// `Start`: `inactive` -> `active`. Starting an already-active session
/// is an error rather than a silent no-op (§8 "Start after Start yields
/// 409 and no state change").
pub async fn start(runtime: &Arc<Runtime>) -> Result<(), SessionError> {
    let _guard = runtime.session_lock.lock().await;
    if runtime.store.session().await.status != SessionStatus::Inactive {
        return Err(SessionError::AlreadyActive);
    }
    runtime.store.set_session_status(SessionStatus::Active).await;
    Ok(())
}

/// `Stop`: `active` -> `stopping` (the scheduler's next tick becomes a
/// no-op the instant the status flips), then waits for every agent to
/// leave `starting`/`running` or for `deadline` to elapse, then
/// `inactive`. Stopping an inactive session is an error.
pub async fn stop(runtime: &Arc<Runtime>, deadline: Duration) -> Result<(), SessionError> {
    let _guard = runtime.session_lock.lock().await;
    if runtime.store.session().await.status != SessionStatus::Active {
        return Err(SessionError::NotActive);
    }
    runtime.store.set_session_status(SessionStatus::Stopping).await;

    let started = tokio::time::Instant::now();
    loop {
        let still_live = runtime
            .store
            .agents()
            .await
            .iter()
            .any(|a| matches!(a.status, AgentStatus::Starting | AgentStatus::Running));
        if !still_live || started.elapsed() >= deadline {
            break;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }

    runtime.store.set_session_status(SessionStatus::Inactive).await;
    Ok(())
}

/// `ForceStop`: skip the graceful wait entirely. SIGKILL every live
/// agent, mark each `killed` with `"session force stopped"` (§8 scenario
/// 6), cancel every running workflow, and transition straight to
/// `inactive`. Force-stopping an inactive session is still an error —
/// the caller asked to stop *something*.
pub async fn force_stop(runtime: &Arc<Runtime>) -> Result<(), SessionError> {
    let _guard = runtime.session_lock.lock().await;
    if runtime.store.session().await.status == SessionStatus::Inactive {
        return Err(SessionError::NotActive);
    }
    runtime.store.set_session_status(SessionStatus::Stopping).await;

    for agent in runtime.store.agents().await {
        if agent.status.is_terminal() {
            continue;
        }
        let _ = runtime.process.kill(&agent.step_task_id, KillMode::Force).await;
        let step_task_id = agent.step_task_id.clone();
        runtime.store.update_agent(&step_task_id, |a| a.mark_killed("session force stopped")).await;
        runtime.events.publish(
            EventType::AgentFailed,
            serde_json::json!({"step_task_id": step_task_id.as_str(), "error": "session force stopped"}),
        );
    }

    for id in runtime.running_workflow_ids().await {
        runtime.signal_cancel(&id).await;
    }

    runtime.store.set_session_status(SessionStatus::Inactive).await;
    Ok(())
}
