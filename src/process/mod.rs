//! Process Manager (§4.4): spawns agent subprocesses, captures output
//! with monotonic per-agent sequence numbers, routes stdin, and
//! terminates cooperatively then forcibly.
//!
//! The stdout/stderr reader runs `BufReader::lines()` in a loop on an
//! async `tokio::task` per stream rather than a blocking OS thread.
//! Kill-by-pid is a `libc::kill` pattern generalized to graceful-then-
//! force modes rather than a single signal.

mod identity;

pub use identity::{identity_matches, is_alive};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};

use crate::domain::{AgentStatus, StepTaskId, TaskId};
use crate::paths::WorkspacePaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputLine {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub stream: OutputStream,
    pub data: String,
}

#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub status: AgentStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillMode {
    Graceful,
    Force,
}

const GRACEFUL_KILL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

struct RunningProcess {
    pid: u32,
    stdin: Mutex<Option<ChildStdin>>,
}

pub struct SpawnRequest {
    pub task_id: TaskId,
    pub step_task_id: StepTaskId,
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub stdin_input: Option<String>,
}

pub struct ProcessManager {
    paths: WorkspacePaths,
    running: Arc<Mutex<HashMap<StepTaskId, Arc<RunningProcess>>>>,
    output_tx: tokio::sync::broadcast::Sender<(StepTaskId, OutputLine)>,
}

impl ProcessManager {
    pub fn new(paths: WorkspacePaths) -> Self {
        let (output_tx, _) = tokio::sync::broadcast::channel(1024);
        Self {
            paths,
            running: Arc::new(Mutex::new(HashMap::new())),
            output_tx,
        }
    }

    /// Subscribe to every output line from every running agent; callers
    /// filter by `step_task_id` themselves (the Question Detector does
    /// this for its owning step).
    pub fn subscribe_output(&self) -> tokio::sync::broadcast::Receiver<(StepTaskId, OutputLine)> {
        self.output_tx.subscribe()
    }

    /// Spawn the child and start its reader tasks. Returns immediately;
    /// the returned receiver resolves once the child has exited (or the
    /// spawn itself failed).
    pub async fn spawn(&self, req: SpawnRequest) -> Result<(u32, DateTime<Utc>, oneshot::Receiver<ProcessResult>)> {
        let SpawnRequest {
            step_task_id,
            argv,
            cwd,
            env,
            stdin_input,
            ..
        } = req;

        let Some((program, args)) = argv.split_first() else {
            bail!("empty argv for step {step_task_id}");
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&cwd)
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child: Child = command
            .spawn()
            .with_context(|| format!("failed to spawn agent process: {program}"))?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("spawned child has no pid"))?;
        let started_at = Utc::now();

        let mut stdin_handle = child.stdin.take();
        if let (Some(stdin), Some(input)) = (stdin_handle.as_mut(), stdin_input) {
            let mut bytes = input.into_bytes();
            if !bytes.ends_with(b"\n") {
                bytes.push(b'\n');
            }
            stdin.write_all(&bytes).await.ok();
        }

        self.running.lock().await.insert(
            step_task_id.clone(),
            Arc::new(RunningProcess {
                pid,
                stdin: Mutex::new(stdin_handle),
            }),
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let seq = Arc::new(std::sync::atomic::AtomicU64::new(1));
        let output_path = self.paths.output_file(step_task_id.as_str());
        std::fs::create_dir_all(self.paths.output_dir()).ok();

        let (done_tx, done_rx) = oneshot::channel();

        let reader_tasks = {
            let mut tasks = Vec::new();
            if let Some(stdout) = stdout {
                tasks.push(self.spawn_reader(
                    step_task_id.clone(),
                    OutputStream::Stdout,
                    stdout,
                    seq.clone(),
                    output_path.clone(),
                ));
            }
            if let Some(stderr) = stderr {
                tasks.push(self.spawn_reader(
                    step_task_id.clone(),
                    OutputStream::Stderr,
                    stderr,
                    seq.clone(),
                    output_path.clone(),
                ));
            }
            tasks
        };

        let running = self.running.clone();
        tokio::spawn(async move {
            for task in reader_tasks {
                let _ = task.await;
            }

            let wait_result = child.wait().await;
            running.lock().await.remove(&step_task_id);

            let result = match wait_result {
                Ok(status) => {
                    let code = status.code();
                    let ok = code == Some(0);
                    ProcessResult {
                        status: if ok {
                            AgentStatus::Completed
                        } else {
                            AgentStatus::Failed
                        },
                        exit_code: code,
                        error: if ok {
                            None
                        } else {
                            Some(format!("process exited with status {status}"))
                        },
                    }
                }
                Err(e) => ProcessResult {
                    status: AgentStatus::Failed,
                    exit_code: None,
                    error: Some(format!("failed to wait on process: {e}")),
                },
            };

            let _ = done_tx.send(result);
        });

        Ok((pid, started_at, done_rx))
    }

    fn spawn_reader<R>(
        &self,
        step_task_id: StepTaskId,
        stream: OutputStream,
        reader: R,
        seq: Arc<std::sync::atomic::AtomicU64>,
        output_path: PathBuf,
    ) -> tokio::task::JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let output_tx = self.output_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&output_path)
                .await
            {
                Ok(f) => Some(f),
                Err(e) => {
                    tracing::warn!("failed to open output file {:?}: {e}", output_path);
                    None
                }
            };

            loop {
                match lines.next_line().await {
                    Ok(Some(data)) => {
                        let line = OutputLine {
                            seq: seq.fetch_add(1, std::sync::atomic::Ordering::SeqCst),
                            ts: Utc::now(),
                            stream,
                            data,
                        };

                        if let Some(file) = file.as_mut() {
                            if let Ok(json) = serde_json::to_string(&line) {
                                use tokio::io::AsyncWriteExt as _;
                                let _ = file.write_all(json.as_bytes()).await;
                                let _ = file.write_all(b"\n").await;
                                let _ = file.flush().await;
                            }
                        }

                        let _ = output_tx.send((step_task_id.clone(), line));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("error reading {:?} stream: {e}", stream);
                        break;
                    }
                }
            }
        })
    }

    /// Deliver bytes to the process's stdin (§4.4 "Stdin"), used by the
    /// Question Detector to route answers. A trailing newline is always
    /// appended if missing.
    pub async fn write_stdin(&self, step_task_id: &StepTaskId, data: &str) -> Result<()> {
        let running = self.running.lock().await;
        let Some(proc) = running.get(step_task_id) else {
            bail!("no running process for {step_task_id}");
        };
        let mut stdin_guard = proc.stdin.lock().await;
        let Some(stdin) = stdin_guard.as_mut() else {
            bail!("stdin already closed for {step_task_id}");
        };
        let mut bytes = data.as_bytes().to_vec();
        if !bytes.ends_with(b"\n") {
            bytes.push(b'\n');
        }
        stdin.write_all(&bytes).await.context("writing to stdin")?;
        Ok(())
    }

    /// `mode=graceful` sends SIGTERM and escalates to SIGKILL after 10 s
    /// if the process is still alive; `mode=force` sends SIGKILL
    /// immediately (§4.4 "Termination").
    pub async fn kill(&self, step_task_id: &StepTaskId, mode: KillMode) -> Result<()> {
        let pid = {
            let running = self.running.lock().await;
            running.get(step_task_id).map(|p| p.pid)
        };
        let Some(pid) = pid else {
            // Already exited; nothing to signal. The agent record is
            // still marked killed by the caller regardless.
            return Ok(());
        };

        #[cfg(unix)]
        {
            match mode {
                KillMode::Force => {
                    unsafe { libc::kill(pid as i32, libc::SIGKILL) };
                }
                KillMode::Graceful => {
                    unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                    let running = self.running.clone();
                    let step_task_id = step_task_id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(GRACEFUL_KILL_TIMEOUT).await;
                        let still_running = running.lock().await.contains_key(&step_task_id);
                        if still_running {
                            unsafe { libc::kill(pid as i32, libc::SIGKILL) };
                        }
                    });
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = (pid, mode);
        }

        Ok(())
    }

    pub async fn is_running(&self, step_task_id: &StepTaskId) -> bool {
        self.running.lock().await.contains_key(step_task_id)
    }
}

/// Read every line currently in an agent's persisted output file, used
/// to serve `/agents/{id}/output?since={seq}` and to re-read the tail
/// after a crash-recovery re-adopt (§6, §8 scenario 3).
pub async fn read_output_since(path: &Path, since_seq: u64) -> Result<Vec<OutputLine>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).context("reading output file"),
    };

    let mut lines = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(parsed) = serde_json::from_str::<OutputLine>(line) {
            if parsed.seq > since_seq {
                lines.push(parsed);
            }
        }
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn spawn_captures_stdout_and_reports_completion() {
        let tmp = TempDir::new().unwrap();
        let paths = WorkspacePaths::new(tmp.path());
        let manager = ProcessManager::new(paths.clone());

        let task_id = TaskId::new("T1");
        let step_task_id = StepTaskId::new(&task_id, 0);

        let req = SpawnRequest {
            task_id,
            step_task_id: step_task_id.clone(),
            argv: vec!["/bin/sh".into(), "-c".into(), "echo hello".into()],
            cwd: tmp.path().to_path_buf(),
            env: HashMap::new(),
            stdin_input: None,
        };

        let (_pid, _started_at, done_rx) = manager.spawn(req).await.unwrap();
        let result = done_rx.await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.status, AgentStatus::Completed);

        let lines = read_output_since(&paths.output_file(step_task_id.as_str()), 0)
            .await
            .unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].data, "hello");
        assert_eq!(lines[0].seq, 1);
    }

    #[tokio::test]
    async fn kill_on_already_exited_process_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let paths = WorkspacePaths::new(tmp.path());
        let manager = ProcessManager::new(paths);
        let task_id = TaskId::new("T2");
        let step_task_id = StepTaskId::new(&task_id, 0);
        assert!(manager.kill(&step_task_id, KillMode::Force).await.is_ok());
    }
}
