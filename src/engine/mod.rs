//! Workflow Engine (§4.7): drives one `Workflow` through its grimoire's
//! steps, dispatching on step kind and honoring `when`, `on_fail`,
//! `on_success`, loop iteration, and cooperative cancellation.

mod context;
mod secrets;
mod steps;

pub use steps::{MergeDecision, approve_merge, reject_merge};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::watch;

use crate::domain::{
    Grimoire, OnFailure, OnMaxIterations, OnSuccess, StepSpec, StepStatus, StepTaskId, Task,
    Workflow, WorkflowId, WorkflowStatus,
};
use crate::event::EventType;
use crate::grimoire::load_grimoire;
use crate::runtime::{Runtime, WorkflowHandle};

/// How a leaf step (or loop container) resolved, bubbled up through the
/// recursive walk so an enclosing loop or the top-level driver can act
/// on it.
enum Control {
    Continue,
    ExitLoop,
    Blocked,
    Failed,
    MergePending,
    Cancelled,
}

fn parse_timeout(raw: &Option<String>) -> Option<Duration> {
    raw.as_deref().and_then(|s| humantime::parse_duration(s).ok())
}

/// Create the `Workflow` record and spawn the task that drives it to
/// completion (§4.8 "launching a new workflow").
pub async fn spawn_workflow(runtime: Arc<Runtime>, task: Task, grimoire_name: String) -> Result<WorkflowId> {
    let grimoire = load_grimoire(&runtime.paths, &grimoire_name).await?;
    let workflow_id = WorkflowId::new(task.id.as_str());
    let workflow = Workflow::new(workflow_id.clone(), task.id.clone(), grimoire_name, grimoire.step_names());
    runtime.store.upsert_workflow(workflow).await;
    runtime.events.publish(
        EventType::WorkflowStarted,
        serde_json::json!({"workflow_id": workflow_id.as_str(), "task_id": task.id.as_str()}),
    );

    launch(runtime, workflow_id.clone()).await;
    Ok(workflow_id)
}

/// Re-adopt a workflow left `running`/`blocked`/`merge_pending` by a
/// prior daemon instance (§8 scenario 3 "Daemon restart mid-workflow",
/// §4.7 "Resumption").
///
/// A workflow whose current step was mid-execution needs special care:
/// the engine task that was driving it is gone, but its child process
/// may not be. We verify the recorded agent's identity (§4.4) before
/// deciding whether to keep watching it or to fail the step and apply
/// its `on_fail` policy. Blocked and merge-pending workflows have no
/// live step to reconcile — `launch` simply re-enters the current step.
pub async fn resume_workflow(runtime: Arc<Runtime>, workflow_id: WorkflowId) {
    let Some(workflow) = runtime.store.get_workflow(&workflow_id).await else {
        return;
    };

    if workflow.status == WorkflowStatus::Running {
        if let Some(step) = workflow.steps.get(workflow.current_step) {
            if step.status == StepStatus::Running {
                reconcile_running_step(runtime, workflow).await;
                return;
            }
        }
    }

    launch(runtime, workflow_id).await;
}

/// Decide the fate of a step that was `running` when the daemon last
/// exited, then hand off to `launch` (directly, or once the reattached
/// process finishes) for whatever the grimoire says comes next.
async fn reconcile_running_step(runtime: Arc<Runtime>, workflow: Workflow) {
    let workflow_id = workflow.id.clone();
    let step_index = workflow.current_step;
    let step_task_id = StepTaskId::new(&workflow.task_id, step_index);

    let Some(agent) = runtime.store.get_agent(&step_task_id).await else {
        // A step marked `running` with no agent record never got as far
        // as spawning a process; just re-execute it from scratch.
        launch(runtime, workflow_id).await;
        return;
    };

    let identity_ok = agent
        .identity
        .as_ref()
        .map(|identity| crate::process::identity_matches(identity.pid, identity.started_at))
        .unwrap_or(false);

    if identity_ok {
        let pid = agent.identity.as_ref().expect("checked above").pid;
        tokio::spawn(async move {
            while crate::process::is_alive(pid) {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            finish_reattached_step(runtime, workflow_id, step_index, step_task_id).await;
        });
    } else {
        runtime
            .store
            .update_agent(&step_task_id, |a| a.mark_failed("process terminated unexpectedly"))
            .await;
        apply_reconciled_outcome(
            runtime,
            workflow_id,
            step_index,
            false,
            "process terminated unexpectedly".to_string(),
        )
        .await;
    }
}

/// The reattached process has exited. Its last words (if any) are
/// whatever it wrote to its captured output file — read that back and
/// judge success the same way a live `agent_step` would.
async fn finish_reattached_step(
    runtime: Arc<Runtime>,
    workflow_id: WorkflowId,
    step_index: usize,
    step_task_id: StepTaskId,
) {
    let output_path = runtime.paths.output_file(step_task_id.as_str());
    let lines = crate::process::read_output_since(&output_path, 0).await.unwrap_or_default();
    let stdout: String = lines
        .iter()
        .filter(|line| matches!(line.stream, crate::process::OutputStream::Stdout))
        .map(|line| line.data.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let (success, error) = match steps::agent_reported_success(&stdout) {
        Some(true) => (true, None),
        Some(false) => (false, Some("agent reported failure".to_string())),
        None => (false, Some("process terminated unexpectedly".to_string())),
    };

    if success {
        runtime.store.update_agent(&step_task_id, |a| a.mark_completed(0)).await;
    } else {
        let err = error.clone().unwrap_or_default();
        runtime.store.update_agent(&step_task_id, move |a| a.mark_failed(err)).await;
    }

    apply_reconciled_outcome(runtime, workflow_id, step_index, success, error.unwrap_or_default()).await;
}

/// Record the reconciled step's outcome, then either resume the
/// following step (success, or an `on_fail: continue` failure) or leave
/// the workflow `blocked`/`failed` per the step's policy — without
/// duplicating `run_leaf_step`'s logic, since there's no live context to
/// apply a step result to after a restart.
async fn apply_reconciled_outcome(
    runtime: Arc<Runtime>,
    workflow_id: WorkflowId,
    step_index: usize,
    success: bool,
    error: String,
) {
    runtime
        .store
        .update_workflow(&workflow_id, {
            let error = error.clone();
            move |w| {
                if let Some(record) = w.steps.get_mut(step_index) {
                    record.status = if success { StepStatus::Completed } else { StepStatus::Failed };
                    record.completed_at = Some(chrono::Utc::now());
                    record.error = if success { None } else { Some(error) };
                }
            }
        })
        .await;
    runtime.events.publish(
        EventType::WorkflowStepCompleted,
        serde_json::json!({"workflow_id": workflow_id.as_str(), "step": step_index, "success": success}),
    );

    if success {
        bump_and_relaunch(runtime, workflow_id, step_index).await;
        return;
    }

    let Some(workflow) = runtime.store.get_workflow(&workflow_id).await else {
        return;
    };
    let grimoire = match load_grimoire(&runtime.paths, &workflow.grimoire_name).await {
        Ok(g) => g,
        Err(_) => {
            runtime
                .store
                .update_workflow(&workflow_id, |w| w.status = WorkflowStatus::Failed)
                .await;
            return;
        }
    };
    let on_fail = grimoire
        .flattened_steps()
        .get(step_index)
        .map(|step| step.common().on_fail)
        .unwrap_or(OnFailure::Fail);

    match on_fail {
        OnFailure::Continue => bump_and_relaunch(runtime, workflow_id, step_index).await,
        OnFailure::Block => {
            runtime
                .store
                .update_workflow(&workflow_id, |w| w.status = WorkflowStatus::Blocked)
                .await;
            runtime
                .events
                .publish(EventType::WorkflowBlocked, serde_json::json!({"workflow_id": workflow_id.as_str()}));
        }
        OnFailure::Fail => {
            runtime.store.update_workflow(&workflow_id, |w| w.status = WorkflowStatus::Failed).await;
        }
    }
}

async fn bump_and_relaunch(runtime: Arc<Runtime>, workflow_id: WorkflowId, step_index: usize) {
    runtime.store.update_workflow(&workflow_id, move |w| w.current_step = step_index + 1).await;
    launch(runtime, workflow_id).await;
}

async fn launch(runtime: Arc<Runtime>, workflow_id: WorkflowId) {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let run_runtime = runtime.clone();
    let run_id = workflow_id.clone();
    let join = tokio::spawn(async move {
        run_workflow(run_runtime.clone(), run_id.clone(), cancel_rx).await;
        run_runtime.forget_workflow(&run_id).await;
    });
    runtime.register_workflow(workflow_id, WorkflowHandle { cancel_tx, join }).await;
}

async fn run_workflow(runtime: Arc<Runtime>, workflow_id: WorkflowId, cancel_rx: watch::Receiver<bool>) {
    let Some(workflow) = runtime.store.get_workflow(&workflow_id).await else {
        tracing::warn!("workflow {workflow_id} vanished before it could run");
        return;
    };
    let Some(task) = runtime.store.get_task(&workflow.task_id).await else {
        runtime
            .store
            .update_workflow(&workflow_id, |w| w.status = WorkflowStatus::Failed)
            .await;
        return;
    };

    let grimoire = match load_grimoire(&runtime.paths, &workflow.grimoire_name).await {
        Ok(g) => g,
        Err(e) => {
            tracing::error!("failed to load grimoire {}: {e:#}", workflow.grimoire_name);
            runtime
                .store
                .update_workflow(&workflow_id, |w| w.status = WorkflowStatus::Failed)
                .await;
            return;
        }
    };

    let secrets = match secrets::Secrets::load(&runtime.paths).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("failed to load secrets: {e:#}");
            runtime
                .store
                .update_workflow(&workflow_id, |w| w.status = WorkflowStatus::Failed)
                .await;
            return;
        }
    };

    let mut ctx = context::build(&task, &secrets.context, &workflow.variables);
    let resume_at = workflow.current_step;
    let mut cursor = 0usize;

    let control = run_steps(
        &runtime,
        &task,
        &workflow_id,
        &grimoire.steps,
        &mut cursor,
        resume_at,
        &mut ctx,
        &cancel_rx,
    )
    .await;

    finalize(&runtime, &workflow_id, control, &ctx).await;
}

async fn finalize(runtime: &Arc<Runtime>, workflow_id: &WorkflowId, control: Control, ctx: &Value) {
    let variables = context::extract_variables(ctx);
    let workflow_id = workflow_id.clone();
    runtime
        .store
        .update_workflow(&workflow_id, move |w| {
            w.variables = variables;
            w.updated_at = chrono::Utc::now();
        })
        .await;

    match control {
        Control::Continue | Control::ExitLoop => {
            runtime
                .store
                .update_workflow(&workflow_id, |w| w.status = WorkflowStatus::Completed)
                .await;
            runtime
                .events
                .publish(EventType::WorkflowCompleted, serde_json::json!({"workflow_id": workflow_id.as_str()}));
        }
        Control::Blocked => {
            runtime
                .store
                .update_workflow(&workflow_id, |w| w.status = WorkflowStatus::Blocked)
                .await;
            runtime
                .events
                .publish(EventType::WorkflowBlocked, serde_json::json!({"workflow_id": workflow_id.as_str()}));
        }
        Control::Failed => {
            runtime
                .store
                .update_workflow(&workflow_id, |w| w.status = WorkflowStatus::Failed)
                .await;
        }
        Control::Cancelled => {
            runtime
                .store
                .update_workflow(&workflow_id, |w| w.status = WorkflowStatus::Cancelled)
                .await;
            runtime
                .events
                .publish(EventType::WorkflowCancelled, serde_json::json!({"workflow_id": workflow_id.as_str()}));
        }
        Control::MergePending => {
            // `merge_step` already set the status and emitted the event
            // before returning control here.
        }
    }
}

/// Walk `steps` depth-first (matching `Grimoire::step_names()`'s
/// flattening), skipping steps already completed by a prior run
/// (`*cursor < resume_at`) and executing the rest in order.
#[allow(clippy::too_many_arguments)]
fn run_steps<'a>(
    runtime: &'a Arc<Runtime>,
    task: &'a Task,
    workflow_id: &'a WorkflowId,
    steps: &'a [StepSpec],
    cursor: &'a mut usize,
    resume_at: usize,
    ctx: &'a mut Value,
    cancel_rx: &'a watch::Receiver<bool>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Control> + 'a>> {
    Box::pin(async move {
        for step in steps {
            if *cancel_rx.borrow() {
                return Control::Cancelled;
            }

            let step_index = *cursor;
            *cursor += 1;

            if step_index < resume_at {
                if let StepSpec::Loop { body, .. } = step {
                    // Nested steps were also flattened into resume_at's
                    // count; skip past them too.
                    let inner = run_steps(runtime, task, workflow_id, body, cursor, resume_at, ctx, cancel_rx).await;
                    if !matches!(inner, Control::Continue) {
                        return inner;
                    }
                }
                continue;
            }

            runtime
                .store
                .update_workflow(workflow_id, {
                    let name = step.name().to_string();
                    move |w| {
                        if let Some(record) = w.steps.get_mut(step_index) {
                            record.name = name;
                            record.status = StepStatus::Running;
                            record.started_at = Some(chrono::Utc::now());
                        }
                        w.current_step = step_index;
                    }
                })
                .await;

            if let Some(when) = &step.common().when {
                match crate::template::evaluate_condition(when, ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        mark_step(runtime, workflow_id, step_index, StepStatus::Skipped, None).await;
                        continue;
                    }
                    Err(e) => {
                        mark_step(runtime, workflow_id, step_index, StepStatus::Failed, Some(e.to_string())).await;
                        return Control::Failed;
                    }
                }
            }

            runtime.events.publish(
                EventType::WorkflowStepStarted,
                serde_json::json!({"workflow_id": workflow_id.as_str(), "step": step.name(), "index": step_index}),
            );

            let control = match step {
                StepSpec::Agent { common, spell, variables } => {
                    let result = steps::agent_step(
                        runtime,
                        task,
                        workflow_id,
                        step_index,
                        &common.name,
                        spell,
                        variables,
                        ctx,
                        parse_timeout(&common.timeout),
                        cancel_rx.clone(),
                    )
                    .await;
                    run_leaf_step(runtime, task, workflow_id, step_index, common, ctx, result).await
                }
                StepSpec::Script { common, command, env, workdir } => {
                    let result = steps::script_step(
                        runtime,
                        task,
                        workflow_id,
                        step_index,
                        command,
                        env,
                        workdir.as_deref(),
                        ctx,
                        parse_timeout(&common.timeout),
                        cancel_rx.clone(),
                    )
                    .await;
                    run_leaf_step(runtime, task, workflow_id, step_index, common, ctx, result).await
                }
                StepSpec::Merge { common, require_review, auto_rebase, commit_message, pre_merge } => {
                    run_merge_step(
                        runtime,
                        task,
                        workflow_id,
                        step_index,
                        common,
                        ctx,
                        steps::merge_step(
                            runtime,
                            task,
                            workflow_id,
                            *require_review,
                            *auto_rebase,
                            commit_message.as_deref(),
                            pre_merge,
                            ctx,
                        )
                        .await,
                    )
                    .await
                }
                StepSpec::Loop { common, condition, body, max_iterations, on_max_iterations } => {
                    run_loop_step(
                        runtime,
                        task,
                        workflow_id,
                        step_index,
                        condition,
                        body,
                        *max_iterations,
                        *on_max_iterations,
                        cursor,
                        ctx,
                        cancel_rx,
                    )
                    .await
                }
            };

            match control {
                Control::Continue => continue,
                other => return other,
            }
        }
        Control::Continue
    })
}

async fn mark_step(
    runtime: &Arc<Runtime>,
    workflow_id: &WorkflowId,
    step_index: usize,
    status: StepStatus,
    error: Option<String>,
) {
    runtime
        .store
        .update_workflow(workflow_id, move |w| {
            if let Some(record) = w.steps.get_mut(step_index) {
                record.status = status;
                record.completed_at = Some(chrono::Utc::now());
                record.error = error;
            }
        })
        .await;
}

async fn run_leaf_step(
    runtime: &Arc<Runtime>,
    _task: &Task,
    workflow_id: &WorkflowId,
    step_index: usize,
    common: &crate::domain::StepCommon,
    ctx: &mut Value,
    result: Result<steps::StepCompletion>,
) -> Control {
    let completion = match result {
        Ok(c) => c,
        Err(e) => steps::StepCompletion::Failure { outputs: serde_json::json!({}), error: e.to_string() },
    };

    match completion {
        steps::StepCompletion::Success { outputs } => {
            context::apply_step_result(ctx, &common.name, true, outputs.clone());
            mark_step(runtime, workflow_id, step_index, StepStatus::Completed, None).await;
            runtime.events.publish(
                EventType::WorkflowStepCompleted,
                serde_json::json!({"workflow_id": workflow_id.as_str(), "step": common.name, "success": true}),
            );
            if matches!(common.on_success, Some(OnSuccess::ExitLoop)) {
                Control::ExitLoop
            } else {
                Control::Continue
            }
        }
        steps::StepCompletion::Failure { outputs, error } => {
            context::apply_step_result(ctx, &common.name, false, outputs);
            mark_step(runtime, workflow_id, step_index, StepStatus::Failed, Some(error.clone())).await;
            runtime.events.publish(
                EventType::WorkflowStepCompleted,
                serde_json::json!({"workflow_id": workflow_id.as_str(), "step": common.name, "success": false, "error": error}),
            );
            match common.on_fail {
                OnFailure::Continue => Control::Continue,
                OnFailure::Block => Control::Blocked,
                OnFailure::Fail => Control::Failed,
            }
        }
        // Leaf agent/script steps never return Blocked/MergePending.
        steps::StepCompletion::Blocked { .. } | steps::StepCompletion::MergePending => Control::Failed,
    }
}

async fn run_merge_step(
    runtime: &Arc<Runtime>,
    _task: &Task,
    workflow_id: &WorkflowId,
    step_index: usize,
    common: &crate::domain::StepCommon,
    ctx: &mut Value,
    result: Result<steps::StepCompletion>,
) -> Control {
    let completion = match result {
        Ok(c) => c,
        Err(e) => steps::StepCompletion::Failure { outputs: serde_json::json!({}), error: e.to_string() },
    };

    match completion {
        steps::StepCompletion::Success { outputs } => {
            context::apply_step_result(ctx, &common.name, true, outputs);
            mark_step(runtime, workflow_id, step_index, StepStatus::Completed, None).await;
            Control::Continue
        }
        steps::StepCompletion::Failure { outputs, error } => {
            context::apply_step_result(ctx, &common.name, false, outputs);
            mark_step(runtime, workflow_id, step_index, StepStatus::Failed, Some(error.clone())).await;
            match common.on_fail {
                OnFailure::Continue => Control::Continue,
                OnFailure::Block => Control::Blocked,
                OnFailure::Fail => Control::Failed,
            }
        }
        steps::StepCompletion::Blocked { conflict } => {
            mark_step(runtime, workflow_id, step_index, StepStatus::Failed, Some("merge conflict".to_string())).await;
            let workflow_id_owned = workflow_id.clone();
            runtime
                .store
                .update_workflow(&workflow_id_owned, move |w| w.conflict = conflict)
                .await;
            Control::Blocked
        }
        steps::StepCompletion::MergePending => Control::MergePending,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop_step<'a>(
    runtime: &'a Arc<Runtime>,
    task: &'a Task,
    workflow_id: &'a WorkflowId,
    step_index: usize,
    condition: &'a str,
    body: &'a [StepSpec],
    max_iterations: u32,
    on_max_iterations: OnMaxIterations,
    cursor: &'a mut usize,
    ctx: &'a mut Value,
    cancel_rx: &'a watch::Receiver<bool>,
) -> Control {
    let body_start = *cursor;
    let mut iteration = 0u32;

    loop {
        if *cancel_rx.borrow() {
            return Control::Cancelled;
        }

        match crate::template::evaluate_condition(condition, ctx) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                mark_step(runtime, workflow_id, step_index, StepStatus::Failed, Some(e.to_string())).await;
                return Control::Failed;
            }
        }

        if iteration >= max_iterations {
            match on_max_iterations {
                OnMaxIterations::Block => {
                    mark_step(
                        runtime,
                        workflow_id,
                        step_index,
                        StepStatus::Failed,
                        Some("max_iterations reached".to_string()),
                    )
                    .await;
                    return Control::Blocked;
                }
                OnMaxIterations::Continue => break,
            }
        }

        context::set_loop_index(ctx, iteration);
        *cursor = body_start;
        let control = run_steps(runtime, task, workflow_id, body, cursor, body_start, ctx, cancel_rx).await;
        match control {
            Control::Continue => {}
            Control::ExitLoop => break,
            other => return other,
        }
        iteration += 1;
    }

    mark_step(runtime, workflow_id, step_index, StepStatus::Completed, None).await;
    Control::Continue
}
