//! Per-variant step execution (§4.7 "Agent step" / "Script step" /
//! "Merge step"; the `loop` variant is orchestrated directly by
//! `engine::mod` since it recurses back into this module for its body).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use serde_json::{Value, json};
use tokio::sync::{oneshot, watch};

use crate::domain::{
    Agent, ConflictRecord, StepTaskId, Task, TaskId, TaskStatus, WorkflowContext, WorkflowId,
};
use crate::event::EventType;
use crate::git::{CommitMessage, MergeOptions, MergeOutcome, WorktreeInfo};
use crate::grimoire;
use crate::process::{KillMode, OutputStream, ProcessManager, SpawnRequest, read_output_since};
use crate::question;
use crate::runtime::Runtime;
use crate::template;

use super::context;

/// What a step's execution resolved to; the caller (the main engine
/// loop) interprets this against the step's `on_fail`/`on_success`
/// policy and the surrounding loop/top-level container.
pub enum StepCompletion {
    Success { outputs: Value },
    Failure { outputs: Value, error: String },
    /// A merge step blocked on a conflict or a failed pre-merge check
    /// (§7 "Workflow-level conflict"): not governed by `on_fail`, the
    /// workflow goes straight to `blocked` with the structured record.
    Blocked { conflict: Option<ConflictRecord> },
    /// A merge step awaiting `/approve-merge` or `/reject-merge`.
    MergePending,
}

pub const BUILTIN_SYSTEM_PROMPT: &str = "You are an autonomous coding agent. Follow the instructions below, make the necessary changes in this worktree, and finish by printing a fenced JSON block: ```json\n{\"success\": bool, \"summary\": \"...\", \"outputs\": {}}\n```.\n\n{{.spell_content}}";

#[derive(Debug, serde::Deserialize)]
struct AgentOutput {
    success: bool,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    outputs: serde_json::Map<String, Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Find the *last* ```` ```...``` ```` fenced block in `text` and parse
/// its contents as an `AgentOutput` (§4.7: "parse the last fenced JSON
/// block... Missing or unparseable block ⇒ step failed").
fn parse_last_json_block(text: &str) -> Option<AgentOutput> {
    let mut last: Option<&str> = None;
    let mut search_from = 0;
    while let Some(start_rel) = text[search_from..].find("```") {
        let start = search_from + start_rel + 3;
        // Skip an optional language tag on the same line as the opening fence.
        let content_start = text[start..].find('\n').map(|i| start + i + 1).unwrap_or(start);
        let Some(end_rel) = text[content_start..].find("```") else {
            break;
        };
        let end = content_start + end_rel;
        last = Some(&text[content_start..end]);
        search_from = end + 3;
    }
    let block = last?;
    serde_json::from_str(block.trim()).ok()
}

/// Used by crash-recovery reattachment to judge a step whose agent
/// process died while no daemon was around to read its exit: `None`
/// means no parseable verdict was ever printed.
pub(crate) fn agent_reported_success(stdout: &str) -> Option<bool> {
    parse_last_json_block(stdout).map(|output| output.success)
}

/// Ensure a worktree exists for this task, creating it on first use and
/// recording it in the workflow's variables so later steps (and a
/// resumed workflow) reuse the same checkout (§4.7, §4.3 `Create`).
pub async fn ensure_worktree(
    runtime: &Runtime,
    workflow_id: &WorkflowId,
    task_id: &TaskId,
) -> Result<WorktreeInfo> {
    if let Some(workflow) = runtime.store.get_workflow(workflow_id).await {
        if let Some(existing) = workflow.variables.get("__worktree") {
            if let Ok(info) = serde_json::from_value::<StoredWorktree>(existing.clone()) {
                return Ok(info.into());
            }
        }
    }

    let info = match runtime.git.find_worktree_for_task(task_id)? {
        Some(info) => info,
        None => runtime.git.create_worktree(task_id)?,
    };

    let stored = StoredWorktree::from(info.clone());
    let workflow_id = workflow_id.clone();
    runtime
        .store
        .update_workflow(&workflow_id, move |w| {
            w.variables.insert(
                "__worktree".to_string(),
                serde_json::to_value(stored).unwrap_or(Value::Null),
            );
        })
        .await;

    Ok(info)
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredWorktree {
    path: PathBuf,
    branch_name: String,
    base_branch: String,
}

impl From<WorktreeInfo> for StoredWorktree {
    fn from(info: WorktreeInfo) -> Self {
        Self {
            path: info.path,
            branch_name: info.branch_name,
            base_branch: info.base_branch,
        }
    }
}

impl From<StoredWorktree> for WorktreeInfo {
    fn from(s: StoredWorktree) -> Self {
        WorktreeInfo {
            path: s.path,
            branch_name: s.branch_name,
            base_branch: s.base_branch,
        }
    }
}

/// Shared bookkeeping for any step kind that spawns an OS process
/// (`agent` and `script`): records the Agent, forwards output to the
/// event broker, arms the question detector (agent steps only), and
/// waits for completion honoring cancellation and a step timeout.
struct ProcessStepOutcome {
    exit_code: Option<i32>,
    error: Option<String>,
    killed: bool,
    full_stdout: String,
    full_stderr: String,
}

#[allow(clippy::too_many_arguments)]
async fn run_process_step(
    runtime: &Runtime,
    process: &Arc<ProcessManager>,
    task_id: &TaskId,
    step_task_id: &StepTaskId,
    worktree_path: &PathBuf,
    branch_name: &str,
    argv: Vec<String>,
    env: std::collections::HashMap<String, String>,
    stdin_input: Option<String>,
    timeout: Option<std::time::Duration>,
    mut cancel_rx: watch::Receiver<bool>,
    detect_questions: Option<WorkflowContext>,
) -> Result<ProcessStepOutcome> {
    let agent = Agent::new(
        task_id.clone(),
        step_task_id.clone(),
        worktree_path.clone(),
        branch_name.to_string(),
    );
    runtime.store.add_agent(agent).await;

    let req = SpawnRequest {
        task_id: task_id.clone(),
        step_task_id: step_task_id.clone(),
        argv,
        cwd: worktree_path.clone(),
        env,
        stdin_input,
    };

    let (pid, started_at, done_rx) = match process.spawn(req).await {
        Ok(v) => v,
        Err(e) => {
            let err = e.to_string();
            runtime
                .store
                .update_agent(step_task_id, |a| a.mark_failed(err.clone()))
                .await;
            return Err(e);
        }
    };

    runtime
        .store
        .update_agent(step_task_id, move |a| {
            a.mark_running(crate::domain::ProcessIdentity {
                pid,
                started_at,
                command: "agent".to_string(),
            });
        })
        .await;

    // Relay output to the event broker and (for agent steps) the
    // question detector, for as long as this step's process runs.
    let mut output_rx = process.subscribe_output();
    let events = runtime.events.clone();
    let store = runtime.store.clone();
    let relay_paths = runtime.paths.clone();
    let relay_step_task_id = step_task_id.clone();
    let relay_task_id = task_id.clone();
    let relay_handle = tokio::spawn(async move {
        let paths = relay_paths;
        loop {
            match output_rx.recv().await {
                Ok((id, line)) if id == relay_step_task_id => {
                    events.publish(
                        EventType::AgentOutput,
                        json!({"step_task_id": id.as_str(), "seq": line.seq, "stream": line.stream, "data": line.data}),
                    );
                    if let (OutputStream::Stdout, Some(ctx)) = (line.stream, detect_questions.as_ref()) {
                        if let Some(detected) = question::classify(&line.data) {
                            let question = crate::domain::Question::new(
                                question::new_question_id(),
                                relay_task_id.clone(),
                                ctx.clone(),
                                detected.question_type,
                                detected.prompt,
                                detected.options,
                                line.seq,
                            );
                            if question::persist_question_file(&paths, &question).await.is_ok() {
                                store.add_question(question).await;
                            }
                        }
                    }
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let timeout_sleep = async {
        match timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        result = done_rx => {
            let result = result.context("process task dropped without a result")?;
            ProcessStepOutcome {
                exit_code: result.exit_code,
                error: result.error,
                killed: false,
                full_stdout: String::new(),
                full_stderr: String::new(),
            }
        }
        _ = timeout_sleep => {
            let _ = process.kill(step_task_id, KillMode::Graceful).await;
            ProcessStepOutcome {
                exit_code: None,
                error: Some("timeout".to_string()),
                killed: false,
                full_stdout: String::new(),
                full_stderr: String::new(),
            }
        }
        _ = cancel_rx.changed() => {
            let _ = process.kill(step_task_id, KillMode::Graceful).await;
            ProcessStepOutcome {
                exit_code: None,
                error: Some("cancelled".to_string()),
                killed: true,
                full_stdout: String::new(),
                full_stderr: String::new(),
            }
        }
    };

    relay_handle.abort();

    let lines = read_output_since(&runtime.paths.output_file(step_task_id.as_str()), 0)
        .await
        .unwrap_or_default();
    let full_stdout = lines
        .iter()
        .filter(|l| matches!(l.stream, OutputStream::Stdout))
        .map(|l| l.data.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let full_stderr = lines
        .iter()
        .filter(|l| matches!(l.stream, OutputStream::Stderr))
        .map(|l| l.data.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    if outcome.killed {
        runtime
            .store
            .update_agent(step_task_id, |a| a.mark_killed("cancelled"))
            .await;
    } else if let Some(code) = outcome.exit_code {
        runtime.store.update_agent(step_task_id, move |a| a.mark_completed(code)).await;
    } else {
        let err = outcome.error.clone().unwrap_or_else(|| "process terminated unexpectedly".to_string());
        runtime.store.update_agent(step_task_id, move |a| a.mark_failed(err)).await;
    }

    Ok(ProcessStepOutcome {
        full_stdout,
        full_stderr,
        ..outcome
    })
}

#[allow(clippy::too_many_arguments)]
pub async fn agent_step(
    runtime: &Runtime,
    task: &Task,
    workflow_id: &WorkflowId,
    step_index: usize,
    step_name: &str,
    spell: &str,
    variables: &std::collections::HashMap<String, Value>,
    ctx: &Value,
    timeout: Option<std::time::Duration>,
    cancel_rx: watch::Receiver<bool>,
) -> Result<StepCompletion> {
    let spell_content = grimoire::load_spell(&runtime.paths, spell).await?;

    let mut render_ctx = ctx.clone();
    if let Some(obj) = render_ctx.as_object_mut() {
        for (k, v) in variables {
            obj.insert(k.clone(), v.clone());
        }
    }
    let rendered_spell = template::render(&spell_content, &render_ctx);

    let system_prompt_path = runtime.paths.coven_dir().join("system_prompt.md");
    let system_prompt_template = if system_prompt_path.exists() {
        tokio::fs::read_to_string(&system_prompt_path)
            .await
            .unwrap_or_else(|_| BUILTIN_SYSTEM_PROMPT.to_string())
    } else {
        BUILTIN_SYSTEM_PROMPT.to_string()
    };
    let mut prompt_ctx = render_ctx.clone();
    if let Some(obj) = prompt_ctx.as_object_mut() {
        obj.insert("spell_content".to_string(), Value::String(rendered_spell));
    }
    let prompt = template::render(&system_prompt_template, &prompt_ctx);

    let worktree = ensure_worktree(runtime, workflow_id, &task.id).await?;
    let step_task_id = StepTaskId::new(&task.id, step_index);

    let mut argv = vec![runtime.config.agent_command.clone()];
    argv.extend(runtime.config.agent_args.clone());

    let workflow_context = WorkflowContext {
        workflow_id: workflow_id.clone(),
        step_name: step_name.to_string(),
        step_index,
        step_task_id: step_task_id.clone(),
    };

    let result = run_process_step(
        runtime,
        &runtime.process,
        &task.id,
        &step_task_id,
        &worktree.path,
        &worktree.branch_name,
        argv.drain(..).collect(),
        std::collections::HashMap::new(),
        Some(prompt),
        timeout,
        cancel_rx,
        Some(workflow_context),
    )
    .await?;

    runtime.store.clear_questions_for_task(&task.id).await;

    if result.killed {
        return Ok(StepCompletion::Failure {
            outputs: json!({}),
            error: "cancelled".to_string(),
        });
    }

    if result.exit_code != Some(0) {
        let error = result.error.unwrap_or_else(|| "agent process failed".to_string());
        return Ok(StepCompletion::Failure { outputs: json!({}), error });
    }

    match parse_last_json_block(&result.full_stdout) {
        Some(parsed) if parsed.success => Ok(StepCompletion::Success {
            outputs: json!({"summary": parsed.summary, "outputs": parsed.outputs}),
        }),
        Some(parsed) => Ok(StepCompletion::Failure {
            outputs: json!({"summary": parsed.summary, "outputs": parsed.outputs}),
            error: parsed.error.unwrap_or_else(|| "agent reported failure".to_string()),
        }),
        None => Ok(StepCompletion::Failure {
            outputs: json!({}),
            error: "no fenced JSON block found in agent output".to_string(),
        }),
    }
}

/// The resolved working directory must stay inside the worktree root
/// (§4.7 "the resolved path must stay inside the worktree — reject
/// otherwise").
fn resolve_workdir(worktree_root: &PathBuf, workdir: Option<&str>) -> Result<PathBuf> {
    let Some(workdir) = workdir else {
        return Ok(worktree_root.clone());
    };
    let joined = worktree_root.join(workdir);
    let normalized = normalize_path(&joined);
    let normalized_root = normalize_path(worktree_root);
    if !normalized.starts_with(&normalized_root) {
        bail!("workdir '{workdir}' escapes the worktree root");
    }
    Ok(normalized)
}

fn normalize_path(path: &PathBuf) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
pub async fn script_step(
    runtime: &Runtime,
    task: &Task,
    workflow_id: &WorkflowId,
    step_index: usize,
    command: &str,
    env: &std::collections::HashMap<String, String>,
    workdir: Option<&str>,
    ctx: &Value,
    timeout: Option<std::time::Duration>,
    cancel_rx: watch::Receiver<bool>,
) -> Result<StepCompletion> {
    let worktree = ensure_worktree(runtime, workflow_id, &task.id).await?;
    let cwd = resolve_workdir(&worktree.path, workdir)?;

    let rendered_env: std::collections::HashMap<String, String> = env
        .iter()
        .map(|(k, v)| (k.clone(), template::render(v, ctx)))
        .collect();

    let step_task_id = StepTaskId::new(&task.id, step_index);
    let argv = vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()];

    let result = run_process_step(
        runtime,
        &runtime.process,
        &task.id,
        &step_task_id,
        &cwd,
        &worktree.branch_name,
        argv,
        rendered_env,
        None,
        timeout,
        cancel_rx,
        None,
    )
    .await?;

    let outputs = json!({
        "stdout": result.full_stdout,
        "stderr": result.full_stderr,
        "exit_code": result.exit_code,
    });

    if result.killed {
        return Ok(StepCompletion::Failure { outputs, error: "cancelled".to_string() });
    }

    match result.exit_code {
        Some(0) => Ok(StepCompletion::Success { outputs }),
        _ => {
            let error = result.error.unwrap_or_else(|| "script exited non-zero".to_string());
            Ok(StepCompletion::Failure { outputs, error })
        }
    }
}

pub enum MergeDecision {
    Approve,
    Reject { reason: String },
}

#[allow(clippy::too_many_arguments)]
pub async fn merge_step(
    runtime: &Arc<Runtime>,
    task: &Task,
    workflow_id: &WorkflowId,
    require_review: bool,
    auto_rebase: bool,
    commit_message_template: Option<&str>,
    pre_merge: &[String],
    ctx: &Value,
) -> Result<StepCompletion> {
    let worktree = ensure_worktree(runtime, workflow_id, &task.id).await?;

    for command in pre_merge {
        let output = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(&worktree.path)
            .output()
            .await
            .with_context(|| format!("running pre_merge command '{command}'"))?;
        if !output.status.success() {
            return Ok(StepCompletion::Blocked { conflict: None });
        }
    }

    if require_review {
        runtime
            .store
            .update_workflow(workflow_id, |w| w.status = crate::domain::WorkflowStatus::MergePending)
            .await;
        runtime.events.publish(
            EventType::WorkflowMergePending,
            json!({"workflow_id": workflow_id.as_str()}),
        );

        let (tx, rx) = oneshot::channel();
        runtime.merge_gates.lock().await.insert(workflow_id.clone(), tx);
        let decision = rx.await.unwrap_or(MergeDecision::Reject {
            reason: "workflow cancelled while awaiting merge review".to_string(),
        });
        runtime.merge_gates.lock().await.remove(workflow_id);

        match decision {
            MergeDecision::Reject { reason } => {
                return Ok(StepCompletion::Failure { outputs: json!({}), error: reason });
            }
            MergeDecision::Approve => {}
        }
    }

    perform_merge(runtime, task, &worktree, auto_rebase, commit_message_template, ctx).await
}

async fn perform_merge(
    runtime: &Arc<Runtime>,
    task: &Task,
    worktree: &WorktreeInfo,
    auto_rebase: bool,
    commit_message_template: Option<&str>,
    ctx: &Value,
) -> Result<StepCompletion> {
    let default_summary = template::lookup("previous.output.summary", ctx)
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let default_template = format!("{}: {}\n\n{}", task.task_type, task.title, default_summary);
    let rendered_message = template::render(
        commit_message_template.unwrap_or(&default_template),
        ctx,
    );
    let (subject, body) = match rendered_message.split_once("\n\n") {
        Some((s, b)) => (s.to_string(), Some(b.to_string())),
        None => (rendered_message.clone(), None),
    };

    let outcome = runtime.git.merge_worktree(
        worktree,
        &MergeOptions {
            commit_message: Some(CommitMessage { subject, body }),
            auto_rebase,
        },
    )?;

    match outcome {
        MergeOutcome::Conflict { conflict_files } => Ok(StepCompletion::Blocked {
            conflict: Some(ConflictRecord {
                conflict_files,
                worktree_path: worktree.path.clone(),
                source_branch: worktree.branch_name.clone(),
                target_branch: worktree.base_branch.clone(),
            }),
        }),
        MergeOutcome::Merged => {
            runtime.git.remove_worktree_by_path_and_branch(&worktree.path, &worktree.branch_name).ok();
            let _ = crate::issue_store::update_task_status_with_timeout(
                runtime.issue_store.as_ref(),
                &task.id,
                TaskStatus::Closed,
            )
            .await;
            runtime.store.update_task_status(&task.id, TaskStatus::Closed).await;
            Ok(StepCompletion::Success { outputs: json!({"merged": true}) })
        }
    }
}

/// `RejectMerge`: resolve a pending merge gate with a reject decision.
/// Returns `false` if no workflow is currently waiting (API maps this to
/// HTTP 409).
pub async fn reject_merge(runtime: &Runtime, workflow_id: &WorkflowId, reason: String) -> bool {
    if let Some(tx) = runtime.merge_gates.lock().await.remove(workflow_id) {
        let _ = tx.send(MergeDecision::Reject { reason });
        true
    } else {
        false
    }
}

pub async fn approve_merge(runtime: &Runtime, workflow_id: &WorkflowId) -> bool {
    if let Some(tx) = runtime.merge_gates.lock().await.remove(workflow_id) {
        let _ = tx.send(MergeDecision::Approve);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_last_fenced_json_block() {
        let text = "some noise\n```json\n{\"success\": false}\n```\nmore\n```json\n{\"success\": true, \"summary\": \"done\"}\n```\n";
        let parsed = parse_last_json_block(text).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.summary, "done");
    }

    #[test]
    fn missing_block_yields_none() {
        assert!(parse_last_json_block("just plain text, no fences").is_none());
    }

    #[test]
    fn workdir_escape_is_rejected() {
        let root = PathBuf::from("/work/tree");
        assert!(resolve_workdir(&root, Some("../../etc")).is_err());
        assert!(resolve_workdir(&root, Some("sub/dir")).is_ok());
    }
}
