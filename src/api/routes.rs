//! Route handlers (§6 "HTTP surface"). Thin: every handler validates its
//! input, delegates to the owning component, and shapes the response —
//! no business logic lives here.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::domain::{QuestionId, StepTaskId, TaskId, WorkflowId};
use crate::engine;
use crate::event::{Event, EventType};
use crate::process::KillMode;
use crate::runtime::Runtime;
use crate::scheduler;
use crate::session;

use super::error::ApiError;

pub type AppState = Arc<Runtime>;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Serialize)]
pub struct VersionInfo {
    name: &'static str,
    version: &'static str,
}

pub async fn version() -> Json<VersionInfo> {
    Json(VersionInfo { name: env!("CARGO_PKG_NAME"), version: env!("CARGO_PKG_VERSION") })
}

pub async fn state_snapshot(State(runtime): State<AppState>) -> Json<crate::store::Snapshot> {
    Json(runtime.store.snapshot().await)
}

#[derive(Serialize)]
pub struct TasksResponse {
    tasks: Vec<crate::domain::Task>,
    synced_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn list_tasks(State(runtime): State<AppState>) -> Json<TasksResponse> {
    Json(TasksResponse {
        tasks: runtime.store.tasks().await,
        synced_at: runtime.store.tasks_synced_at().await,
    })
}

pub async fn list_agents(State(runtime): State<AppState>) -> Json<Vec<crate::domain::Agent>> {
    Json(runtime.store.agents().await)
}

#[derive(Deserialize)]
pub struct SinceQuery {
    since: Option<u64>,
}

pub async fn agent_output(
    State(runtime): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<SinceQuery>,
) -> Result<Json<Vec<crate::process::OutputLine>>, ApiError> {
    let step_task_id = StepTaskId(id.clone());
    if runtime.store.get_agent(&step_task_id).await.is_none() {
        return Err(ApiError::NotFound(format!("unknown agent {id}")));
    }
    let path = runtime.paths.output_file(&id);
    let lines = crate::process::read_output_since(&path, q.since.unwrap_or(0)).await?;
    Ok(Json(lines))
}

#[derive(Deserialize)]
pub struct ForceQuery {
    #[serde(default)]
    force: bool,
}

pub async fn kill_agent(
    State(runtime): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<ForceQuery>,
) -> Result<Json<crate::domain::Agent>, ApiError> {
    let step_task_id = StepTaskId(id.clone());
    let Some(agent) = runtime.store.get_agent(&step_task_id).await else {
        return Err(ApiError::NotFound(format!("unknown agent {id}")));
    };
    if agent.status.is_terminal() {
        return Err(ApiError::Conflict(format!("agent {id} is already terminal")));
    }

    let mode = if q.force { KillMode::Force } else { KillMode::Graceful };
    runtime.process.kill(&step_task_id, mode).await?;
    if q.force {
        runtime.store.update_agent(&step_task_id, |a| a.mark_killed("killed by request")).await;
    }
    Ok(Json(runtime.store.get_agent(&step_task_id).await.expect("just updated")))
}

#[derive(Deserialize)]
pub struct RespondBody {
    question_id: String,
    response: String,
}

pub async fn respond_to_question(
    State(runtime): State<AppState>,
    Json(body): Json<RespondBody>,
) -> Result<Json<crate::domain::Question>, ApiError> {
    let question_id = QuestionId::new(body.question_id.clone());
    let Some(question) = runtime.store.get_question(&question_id).await else {
        return Err(ApiError::NotFound(format!("unknown question {}", body.question_id)));
    };
    if question.is_answered() {
        return Err(ApiError::Conflict(format!("question {} already answered", body.question_id)));
    }

    let step_task_id = question.workflow.step_task_id.clone();
    runtime.store.update_question(&question_id, {
        let answer = body.response.clone();
        move |q| q.mark_answered(answer)
    }).await;

    // A process that died between answer time and delivery time is not
    // an error (§8 boundary behavior): the question is still marked
    // delivered, no stdin write happens.
    if runtime.process.is_running(&step_task_id).await {
        let _ = runtime.process.write_stdin(&step_task_id, &body.response).await;
    }
    runtime.store.update_question(&question_id, |q| q.mark_delivered()).await;
    let _ = crate::question::remove_question_file(&runtime.paths, &question_id).await;

    Ok(Json(runtime.store.get_question(&question_id).await.expect("just updated")))
}

pub async fn list_questions(State(runtime): State<AppState>) -> Json<Vec<crate::domain::Question>> {
    Json(runtime.store.questions().await.into_iter().filter(|q| !q.is_answered()).collect())
}

pub async fn session_start(State(runtime): State<AppState>) -> Result<Json<crate::domain::Session>, ApiError> {
    session::start(&runtime).await.map_err(|e| ApiError::Conflict(e.to_string()))?;
    Ok(Json(runtime.store.session().await))
}

#[derive(Deserialize)]
pub struct SessionStopQuery {
    #[serde(default)]
    force: bool,
}

const SESSION_STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn session_stop(
    State(runtime): State<AppState>,
    Query(q): Query<SessionStopQuery>,
) -> Result<Json<crate::domain::Session>, ApiError> {
    if q.force {
        session::force_stop(&runtime).await.map_err(|e| ApiError::Conflict(e.to_string()))?;
    } else {
        session::stop(&runtime, SESSION_STOP_TIMEOUT).await.map_err(|e| ApiError::Conflict(e.to_string()))?;
    }
    Ok(Json(runtime.store.session().await))
}

pub async fn list_workflows(State(runtime): State<AppState>) -> Json<Vec<crate::domain::Workflow>> {
    Json(runtime.store.workflows().await)
}

pub async fn get_workflow(
    State(runtime): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::domain::Workflow>, ApiError> {
    let workflow_id = WorkflowId::new(id.clone());
    runtime
        .store
        .get_workflow(&workflow_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("unknown workflow {id}")))
}

#[derive(Deserialize)]
pub struct CancelQuery {
    #[serde(default)]
    force: bool,
}

pub async fn cancel_workflow(
    State(runtime): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<CancelQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let workflow_id = WorkflowId::new(id.clone());
    if runtime.store.get_workflow(&workflow_id).await.is_none() {
        return Err(ApiError::NotFound(format!("unknown workflow {id}")));
    }
    let cancelled = if q.force {
        scheduler::force_cancel_workflow(&runtime, &workflow_id).await
    } else {
        scheduler::cancel_workflow(&runtime, &workflow_id).await
    };
    Ok(Json(json!({"cancelled": cancelled})))
}

pub async fn approve_merge(
    State(runtime): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let workflow_id = WorkflowId::new(id.clone());
    let Some(workflow) = runtime.store.get_workflow(&workflow_id).await else {
        return Err(ApiError::NotFound(format!("unknown workflow {id}")));
    };
    if workflow.status != crate::domain::WorkflowStatus::MergePending {
        return Err(ApiError::Conflict(format!("workflow {id} is not awaiting merge review")));
    }
    if !engine::approve_merge(&runtime, &workflow_id).await {
        return Err(ApiError::Conflict(format!("workflow {id} has no open merge gate")));
    }
    Ok(Json(json!({"approved": true})))
}

#[derive(Deserialize)]
pub struct RejectBody {
    #[serde(default)]
    reason: String,
}

pub async fn reject_merge(
    State(runtime): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RejectBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let workflow_id = WorkflowId::new(id.clone());
    let Some(workflow) = runtime.store.get_workflow(&workflow_id).await else {
        return Err(ApiError::NotFound(format!("unknown workflow {id}")));
    };
    if workflow.status != crate::domain::WorkflowStatus::MergePending {
        return Err(ApiError::Conflict(format!("workflow {id} is not awaiting merge review")));
    }
    let reason = if body.reason.is_empty() { "rejected by operator".to_string() } else { body.reason };
    if !engine::reject_merge(&runtime, &workflow_id, reason).await {
        return Err(ApiError::Conflict(format!("workflow {id} has no open merge gate")));
    }
    Ok(Json(json!({"rejected": true})))
}

pub async fn shutdown(State(runtime): State<AppState>) -> Json<serde_json::Value> {
    runtime.shutdown.notify_waiters();
    Json(json!({"shutting_down": true}))
}

/// `text/event-stream` subscription (§4.9, §6 "Event stream format"): a
/// `state.snapshot` on connect, then every broker event in order, with a
/// `state.snapshot` heartbeat every 30 s so clients detect a silently
/// dead connection without a special "since" parameter.
pub async fn events_stream(
    State(runtime): State<AppState>,
) -> Sse<BoxStream<'static, Result<SseEvent, Infallible>>> {
    let snapshot = runtime.store.snapshot().await;
    let snapshot_event =
        Event::new(EventType::StateSnapshot, serde_json::to_value(&snapshot).unwrap_or(serde_json::Value::Null));

    let rx = runtime.events.subscribe();
    let live = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    // §6: "Heartbeat = `event: state.snapshot` every 30 s" — the
    // reconnection-friendly heartbeat re-sends the *full* snapshot
    // rather than a trivial ping, so a client that missed events past
    // its queue bound resyncs without a separate "since" request.
    let heartbeat_runtime = runtime.clone();
    let heartbeat = stream::unfold(
        (tokio::time::interval(Duration::from_secs(30)), heartbeat_runtime),
        |(mut interval, runtime)| async move {
            interval.tick().await;
            let snapshot = runtime.store.snapshot().await;
            let event = Event::new(
                EventType::StateSnapshot,
                serde_json::to_value(&snapshot).unwrap_or(serde_json::Value::Null),
            );
            Some((event, (interval, runtime)))
        },
    );

    let body = stream::once(async move { snapshot_event })
        .chain(stream::select(live, heartbeat))
        .map(|event| {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Ok(SseEvent::default().event(event.event_type.as_str()).data(data))
        })
        .boxed();

    Sse::new(body).keep_alive(KeepAlive::default())
}
