//! Worktree Manager (§4.3): isolates each task's agent work in its own
//! git worktree and branch, and merges finished work back into the base
//! branch.
//!
//! Task-keyed worktree naming: branches live under `coven/`, worktrees
//! under `.coven/worktrees`, and `create_worktree` takes a `TaskId` whose
//! raw value may contain characters git branch names reject, with
//! retry-on-name-collision the same way workflow branches were always
//! allocated here.

use anyhow::{Context, Result, anyhow, bail};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::domain::TaskId;

/// Result of creating a worktree.
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch_name: String,
    pub base_branch: String,
}

/// Suggested git commit message (subject + optional body).
#[derive(Debug, Clone)]
pub struct CommitMessage {
    pub subject: String,
    pub body: Option<String>,
}

/// Keep the subject single-line and reasonably short.
pub fn sanitize_commit_subject(raw: &str) -> String {
    let first_line = raw.lines().next().unwrap_or("").trim();
    let mut out: String = first_line
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .collect();
    if out.is_empty() {
        out = "coven: update".to_string();
    }

    const MAX_LEN: usize = 72;
    if out.chars().count() > MAX_LEN {
        out = out.chars().take(MAX_LEN).collect();
    }

    out
}

/// Replace characters git branch names reject (space, `.`, `~`, `^`, `:`,
/// `?`, `*`, `[`, backtick) with `-` so any task id can become a branch
/// component.
fn sanitize_branch_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            ' ' | '.' | '~' | '^' | ':' | '?' | '*' | '[' | '`' => '-',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Status of a file in a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed { from: String },
    Copied { from: String },
    Untracked,
}

#[derive(Debug, Clone)]
pub struct FileDiff {
    pub path: String,
    pub status: FileStatus,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub is_binary: bool,
    pub patch: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DiffReport {
    pub files: Vec<FileDiff>,
    pub total_added: usize,
    pub total_removed: usize,
    pub files_changed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct DiffSettings {
    pub ignore_whitespace: bool,
    pub context_lines: u32,
    pub include_untracked: bool,
}

/// Outcome of a merge attempt (§4.3 `Merge`, §7 conflicts).
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    Merged,
    Conflict { conflict_files: Vec<String> },
}

#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    pub commit_message: Option<CommitMessage>,
    /// Rebase the worktree branch onto the base branch before merging,
    /// instead of merging directly. Still surfaces conflicts rather than
    /// resolving them.
    pub auto_rebase: bool,
}

fn parse_null_delimited(output: &[u8]) -> Vec<String> {
    output
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .filter_map(|s| std::str::from_utf8(s).ok())
        .map(|s| s.to_string())
        .collect()
}

fn parse_numstat_output(output: &[u8]) -> Vec<(String, usize, usize, bool)> {
    let text = String::from_utf8_lossy(output);
    let mut results = Vec::new();

    for line in text.lines() {
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() < 3 {
            continue;
        }

        let (added, removed, is_binary) = if parts[0] == "-" && parts[1] == "-" {
            (0, 0, true)
        } else {
            let added = parts[0].parse().unwrap_or(0);
            let removed = parts[1].parse().unwrap_or(0);
            (added, removed, false)
        };

        let path = parts[2].to_string();
        if !path.is_empty() {
            results.push((path, added, removed, is_binary));
        }
    }

    results
}

/// Find the git repository root for a given path.
pub fn find_git_root(path: &Path) -> Option<PathBuf> {
    let start_dir = if path.is_file() { path.parent()? } else { path };

    let output = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(start_dir)
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if root.is_empty() {
        None
    } else {
        Some(PathBuf::from(root))
    }
}

/// Manages Git worktree lifecycle and merging for one workspace repository.
#[derive(Clone)]
pub struct GitManager {
    root: PathBuf,
    worktrees_dir: PathBuf,
}

impl GitManager {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        if !root.join(".git").exists() {
            bail!("Not a git repository: {}", root.display());
        }

        let worktrees_dir = root.join(".coven").join("worktrees");

        Ok(Self {
            root,
            worktrees_dir,
        })
    }

    pub fn head_sha(&self) -> Result<String> {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.root)
            .output()
            .context("Failed to run git rev-parse")?;

        if !output.status.success() {
            bail!(
                "git rev-parse failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn has_commits(&self) -> bool {
        Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(&self.root)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub fn current_branch(&self) -> Result<String> {
        let output = Command::new("git")
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .current_dir(&self.root)
            .output()
            .context("Failed to get current branch")?;

        if !output.status.success() {
            bail!(
                "Failed to get current branch: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Resolve the workspace's base branch: `main` if it exists, else
    /// `master`, else whatever branch is currently checked out (§4.3).
    pub fn base_branch(&self) -> Result<String> {
        for candidate in ["main", "master"] {
            let output = Command::new("git")
                .args([
                    "show-ref",
                    "--verify",
                    "--quiet",
                    &format!("refs/heads/{candidate}"),
                ])
                .current_dir(&self.root)
                .output()
                .context("Failed to check branch existence")?;
            if output.status.success() {
                return Ok(candidate.to_string());
            }
        }
        self.current_branch()
    }

    /// Create a worktree for a task, retrying with incrementing suffixes
    /// on name collision (§4.3 `Create`).
    pub fn create_worktree(&self, task_id: &TaskId) -> Result<WorktreeInfo> {
        self.create_worktree_with_retries(task_id, 10)
    }

    fn create_worktree_with_retries(
        &self,
        task_id: &TaskId,
        max_retries: u32,
    ) -> Result<WorktreeInfo> {
        if !self.has_commits() {
            bail!(
                "Cannot create worktree: repository has no commits. \
                Make an initial commit first."
            );
        }

        #[cfg(unix)]
        {
            if unsafe { libc::geteuid() } == 0 {
                bail!(
                    "Cannot create worktree: running as root. \
                    This would create files owned by root that cannot be modified later. \
                    Run the daemon as your normal user."
                );
            }
        }

        let base_branch = self.base_branch()?;

        if self.worktrees_dir.exists() {
            #[cfg(unix)]
            {
                use std::os::unix::fs::MetadataExt;
                if let Ok(metadata) = std::fs::metadata(&self.worktrees_dir) {
                    let dir_uid = metadata.uid();
                    let current_uid = unsafe { libc::geteuid() };
                    if dir_uid == 0 && current_uid != 0 {
                        bail!(
                            "Cannot create worktree: {} is owned by root.\n\
                            Fix the permissions with:\n\
                            sudo chown -R $(whoami) {:?}",
                            self.worktrees_dir.display(),
                            self.worktrees_dir
                        );
                    }
                }
            }
        }

        std::fs::create_dir_all(&self.worktrees_dir)?;

        let mut existing_worktree_names = HashSet::new();
        if let Ok(entries) = std::fs::read_dir(&self.worktrees_dir) {
            for entry in entries.flatten() {
                if let Ok(name) = entry.file_name().into_string() {
                    existing_worktree_names.insert(name);
                }
            }
        }

        let mut existing_branch_names = HashSet::new();
        if let Ok(output) = Command::new("git")
            .args([
                "for-each-ref",
                "--format=%(refname:short)",
                "refs/heads/coven",
            ])
            .current_dir(&self.root)
            .output()
        {
            if output.status.success() {
                existing_branch_names.extend(
                    String::from_utf8_lossy(&output.stdout)
                        .lines()
                        .filter(|line| !line.is_empty())
                        .map(|line| line.to_string()),
                );
            }
        }

        let base_name = sanitize_branch_component(task_id.as_str());

        for attempt in 0..=max_retries {
            let worktree_dir_name = if attempt == 0 {
                base_name.clone()
            } else {
                format!("{}-{}", base_name, attempt)
            };

            if existing_worktree_names.contains(&worktree_dir_name) {
                continue;
            }

            let worktree_path = self.worktrees_dir.join(&worktree_dir_name);

            if worktree_path.exists() {
                existing_worktree_names.insert(worktree_dir_name.clone());
                continue;
            }

            let branch_name = format!("coven/{}", worktree_dir_name);

            if existing_branch_names.contains(&branch_name) {
                continue;
            }

            let output = Command::new("git")
                .args(["branch", &branch_name])
                .current_dir(&self.root)
                .output()
                .context("Failed to create branch")?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if stderr.contains("already exists") {
                    continue;
                }
                bail!("Failed to create branch: {}", stderr);
            }

            let worktree_path_str = worktree_path
                .to_str()
                .ok_or_else(|| anyhow!("Worktree path contains invalid UTF-8"))?;

            let output = Command::new("git")
                .args(["worktree", "add", worktree_path_str, &branch_name])
                .current_dir(&self.root)
                .output()
                .context("Failed to create worktree")?;

            if output.status.success() {
                return Ok(WorktreeInfo {
                    path: worktree_path,
                    branch_name,
                    base_branch,
                });
            }

            let stderr = String::from_utf8_lossy(&output.stderr);

            let _ = Command::new("git")
                .args(["branch", "-D", &branch_name])
                .current_dir(&self.root)
                .output();

            if stderr.contains("already exists") || stderr.contains("is already checked out") {
                existing_worktree_names.insert(worktree_dir_name);
                existing_branch_names.insert(branch_name);
                continue;
            }

            bail!("Failed to create worktree: {}", stderr);
        }

        bail!(
            "Failed to create worktree for task {} after {} retries - all suffixes in use",
            task_id,
            max_retries
        );
    }

    /// Remove a worktree by path, deriving its branch name from the
    /// directory name (§4.3 `Remove`).
    pub fn remove_worktree_by_path(&self, worktree_path: &Path) -> Result<()> {
        let dir_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("Could not extract directory name from worktree path"))?;
        let branch_name = format!("coven/{}", dir_name);
        self.remove_worktree_by_path_and_branch(worktree_path, &branch_name)
    }

    pub fn remove_worktree_by_path_and_branch(
        &self,
        worktree_path: &Path,
        branch_name: &str,
    ) -> Result<()> {
        if worktree_path.exists() {
            let worktree_path_str = worktree_path
                .to_str()
                .ok_or_else(|| anyhow!("Worktree path contains invalid UTF-8"))?;
            let output = Command::new("git")
                .args(["worktree", "remove", "--force", worktree_path_str])
                .current_dir(&self.root)
                .output()
                .context("Failed to remove worktree")?;

            if !output.status.success() {
                tracing::warn!(
                    "Failed to remove worktree: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
            }
        }

        let output = Command::new("git")
            .args(["branch", "-D", branch_name])
            .current_dir(&self.root)
            .output()
            .context("Failed to delete branch")?;

        if !output.status.success() {
            tracing::warn!(
                "Failed to delete branch: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(())
    }

    /// List worktrees the daemon currently owns (path + branch name),
    /// parsed from `git worktree list --porcelain` (§4.3 `List`).
    pub fn list_worktrees(&self) -> Result<Vec<(PathBuf, String)>> {
        let output = Command::new("git")
            .args(["worktree", "list", "--porcelain"])
            .current_dir(&self.root)
            .output()
            .context("Failed to list worktrees")?;

        if !output.status.success() {
            bail!(
                "git worktree list failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut results = Vec::new();
        let mut current_path: Option<PathBuf> = None;
        let mut current_branch: Option<String> = None;

        for line in text.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                if let (Some(p), Some(b)) = (current_path.take(), current_branch.take()) {
                    if b.starts_with("coven/") {
                        results.push((p, b));
                    }
                }
                current_path = Some(PathBuf::from(path));
            } else if let Some(branch_ref) = line.strip_prefix("branch ") {
                current_branch = branch_ref
                    .strip_prefix("refs/heads/")
                    .map(|s| s.to_string());
            } else if line.is_empty() {
                if let (Some(p), Some(b)) = (current_path.take(), current_branch.take()) {
                    if b.starts_with("coven/") {
                        results.push((p, b));
                    }
                }
            }
        }
        if let (Some(p), Some(b)) = (current_path, current_branch) {
            if b.starts_with("coven/") {
                results.push((p, b));
            }
        }

        Ok(results)
    }

    /// The worktree already created for this task, if one exists,
    /// matched by its sanitized branch component (the engine calls this
    /// before falling back to `create_worktree` so a workflow resuming
    /// across steps, or across a daemon restart, reuses the same
    /// checkout instead of creating a second one).
    pub fn find_worktree_for_task(&self, task_id: &TaskId) -> Result<Option<WorktreeInfo>> {
        let base_name = sanitize_branch_component(task_id.as_str());
        let base_branch = self.base_branch()?;
        for (path, branch) in self.list_worktrees()? {
            let suffix = branch.strip_prefix("coven/").unwrap_or(&branch);
            if suffix == base_name || suffix.starts_with(&format!("{base_name}-")) {
                return Ok(Some(WorktreeInfo {
                    path,
                    branch_name: branch,
                    base_branch,
                }));
            }
        }
        Ok(None)
    }

    /// Worktrees on disk that belong to no known active task (§4.3
    /// `DetectOrphans`, reconciled at daemon startup).
    pub fn detect_orphans(&self, active: &HashSet<TaskId>) -> Result<Vec<(PathBuf, String)>> {
        let active_names: HashSet<String> = active
            .iter()
            .map(|id| sanitize_branch_component(id.as_str()))
            .collect();

        Ok(self
            .list_worktrees()?
            .into_iter()
            .filter(|(path, _)| {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default();
                !active_names
                    .iter()
                    .any(|active| name == active.as_str() || name.starts_with(&format!("{active}-")))
            })
            .collect())
    }

    pub fn changed_files(&self, worktree: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        let output = Command::new("git")
            .args(["diff", "--name-only", "HEAD"])
            .current_dir(worktree)
            .output()
            .context("Failed to run git diff")?;

        if !output.status.success() {
            bail!(
                "git diff failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        files.extend(
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter(|l| !l.is_empty())
                .map(PathBuf::from),
        );

        let output = Command::new("git")
            .args(["ls-files", "--others", "--exclude-standard"])
            .current_dir(worktree)
            .output()
            .context("Failed to run git ls-files")?;

        if output.status.success() {
            files.extend(
                String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(PathBuf::from),
            );
        }

        Ok(files)
    }

    pub fn untracked_files(&self, worktree: &Path) -> Result<Vec<PathBuf>> {
        let output = Command::new("git")
            .args(["ls-files", "--others", "--exclude-standard"])
            .current_dir(worktree)
            .output()
            .context("Failed to run git ls-files")?;

        if !output.status.success() {
            bail!(
                "git ls-files failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    pub fn diff(&self, worktree: &Path, base_branch: Option<&str>) -> Result<String> {
        let mut result = String::new();

        if let Some(base_branch) = base_branch.map(str::trim).filter(|s| !s.is_empty()) {
            let range = format!("{}...HEAD", base_branch);
            let committed_output = Command::new("git")
                .args(["diff", "--no-color", &range])
                .current_dir(worktree)
                .output()
                .context("Failed to run git diff for committed changes")?;

            if committed_output.status.success() {
                let committed_diff = String::from_utf8_lossy(&committed_output.stdout);
                if !committed_diff.is_empty() {
                    result.push_str(&committed_diff);
                }
            } else {
                tracing::warn!(
                    "Failed to compute committed diff vs '{}': {}",
                    base_branch,
                    String::from_utf8_lossy(&committed_output.stderr)
                );
            }
        }

        let uncommitted_output = Command::new("git")
            .args(["diff", "--no-color", "HEAD"])
            .current_dir(worktree)
            .output()
            .context("Failed to run git diff for uncommitted changes")?;

        if uncommitted_output.status.success() {
            let uncommitted_diff = String::from_utf8_lossy(&uncommitted_output.stdout);
            if !uncommitted_diff.is_empty() {
                if !result.is_empty() {
                    result.push_str("\n\n--- Uncommitted changes ---\n\n");
                }
                result.push_str(&uncommitted_diff);
            }
        }

        Ok(result)
    }

    pub fn diff_file(&self, worktree: &Path, file: &Path) -> Result<String> {
        let file_str = file
            .to_str()
            .ok_or_else(|| anyhow!("File path contains invalid UTF-8"))?;
        let output = Command::new("git")
            .args(["diff", "HEAD", "--", file_str])
            .current_dir(worktree)
            .output()
            .context("Failed to run git diff")?;

        if !output.status.success() {
            bail!(
                "git diff failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Merge a worktree branch into `base_branch` (§4.3 `Merge`). Commits
    /// any uncommitted changes in the worktree first, then merges with
    /// `--no-ff` (or rebases first when `opts.auto_rebase` is set).
    /// Conflicts are reported rather than resolved; the repo is left in
    /// a clean state either way (merge/rebase aborted on conflict).
    pub fn merge_worktree(
        &self,
        worktree: &WorktreeInfo,
        opts: &MergeOptions,
    ) -> Result<MergeOutcome> {
        if self.has_tracked_uncommitted_changes()? {
            bail!(
                "Cannot merge: repository has uncommitted changes. \
                 Commit or stash them first."
            );
        }

        let status_output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&worktree.path)
            .output()
            .context("Failed to check worktree status")?;

        if !status_output.stdout.is_empty() {
            let fallback = CommitMessage {
                subject: "Auto-commit remaining changes before merge".to_string(),
                body: None,
            };
            let message = opts.commit_message.as_ref().unwrap_or(&fallback);
            self.commit_all_in_dir(&worktree.path, message)?;
        }

        if opts.auto_rebase {
            let rebase_output = Command::new("git")
                .args(["rebase", &opts_base_branch(opts, &worktree.base_branch)])
                .current_dir(&worktree.path)
                .output()
                .context("Failed to rebase worktree branch")?;

            if !rebase_output.status.success() {
                let conflicts = self.conflicted_files(&worktree.path)?;
                let _ = Command::new("git")
                    .args(["rebase", "--abort"])
                    .current_dir(&worktree.path)
                    .output();
                return Ok(MergeOutcome::Conflict {
                    conflict_files: conflicts,
                });
            }
        }

        let current_branch = self.current_branch()?;
        let should_restore_branch =
            current_branch != worktree.base_branch && current_branch != "HEAD";

        if current_branch != worktree.base_branch {
            let checkout_output = Command::new("git")
                .args(["checkout", &worktree.base_branch])
                .current_dir(&self.root)
                .output()
                .context("Failed to checkout base branch")?;

            if !checkout_output.status.success() {
                bail!(
                    "Failed to checkout base branch '{}': {}",
                    worktree.base_branch,
                    String::from_utf8_lossy(&checkout_output.stderr)
                );
            }
        }

        let merge_output = Command::new("git")
            .args(["merge", "--no-ff", &worktree.branch_name, "--no-edit"])
            .current_dir(&self.root)
            .output()
            .context("Failed to merge branch")?;

        if !merge_output.status.success() {
            let conflicts = self.conflicted_files(&self.root)?;

            let aborted = Command::new("git")
                .args(["merge", "--abort"])
                .current_dir(&self.root)
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false);

            if should_restore_branch {
                let _ = Command::new("git")
                    .args(["checkout", &current_branch])
                    .current_dir(&self.root)
                    .output();
            }

            if !aborted {
                tracing::warn!("failed to abort conflicted merge; repo may need manual cleanup");
            }

            return Ok(MergeOutcome::Conflict {
                conflict_files: conflicts,
            });
        }

        if should_restore_branch {
            let checkout_output = Command::new("git")
                .args(["checkout", &current_branch])
                .current_dir(&self.root)
                .output()
                .context("Failed to restore original branch after merge")?;

            if !checkout_output.status.success() {
                tracing::warn!(
                    "Failed to restore branch '{}': {}",
                    current_branch,
                    String::from_utf8_lossy(&checkout_output.stderr)
                );
            }
        }

        Ok(MergeOutcome::Merged)
    }

    fn conflicted_files(&self, dir: &Path) -> Result<Vec<String>> {
        let output = Command::new("git")
            .args(["diff", "--name-only", "--diff-filter=U"])
            .current_dir(dir)
            .output()
            .context("Failed to list conflicted files")?;

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(|s| s.to_string())
            .collect())
    }

    pub fn commit_root_changes(&self, commit_message: &CommitMessage) -> Result<bool> {
        let output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&self.root)
            .output()
            .context("Failed to check repo status")?;

        if output.stdout.is_empty() {
            return Ok(false);
        }

        self.commit_all_in_dir(&self.root, commit_message)
    }

    fn commit_all_in_dir(&self, dir: &Path, commit_message: &CommitMessage) -> Result<bool> {
        let add_output = Command::new("git")
            .args(["add", "-A"])
            .current_dir(dir)
            .output()
            .context("Failed to stage changes")?;

        if !add_output.status.success() {
            bail!(
                "git add failed: {}",
                String::from_utf8_lossy(&add_output.stderr).trim()
            );
        }

        let mut commit_cmd = Command::new("git");
        commit_cmd
            .arg("commit")
            .arg("-m")
            .arg(&commit_message.subject);
        if let Some(body) = commit_message
            .body
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            commit_cmd.arg("-m").arg(body);
        }

        let commit_output = commit_cmd
            .current_dir(dir)
            .output()
            .context("Failed to commit changes")?;

        if commit_output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&commit_output.stderr);
        if stderr.contains("nothing to commit") {
            tracing::debug!("git commit reported nothing to commit: {}", stderr);
            return Ok(false);
        }

        bail!("git commit failed: {}", stderr.trim());
    }

    pub fn has_uncommitted_changes(&self) -> Result<bool> {
        let output = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(&self.root)
            .output()
            .context("Failed to run git status")?;

        Ok(!output.stdout.is_empty())
    }

    pub fn has_tracked_uncommitted_changes(&self) -> Result<bool> {
        let output = Command::new("git")
            .args(["status", "--porcelain", "--untracked-files=no"])
            .current_dir(&self.root)
            .output()
            .context("Failed to run git status")?;

        Ok(!output.stdout.is_empty())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn diff_report(
        &self,
        worktree: &Path,
        base_branch: Option<&str>,
        settings: &DiffSettings,
    ) -> Result<DiffReport> {
        let base_commit = if let Some(base) = base_branch.map(str::trim).filter(|s| !s.is_empty())
        {
            let output = Command::new("git")
                .args(["merge-base", base, "HEAD"])
                .current_dir(worktree)
                .output()
                .context("Failed to run git merge-base")?;

            if output.status.success() {
                Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
            } else {
                None
            }
        } else {
            None
        };

        let mut files = Vec::new();
        let mut tracked_paths = std::collections::HashSet::new();

        let mut diff_args = vec!["diff", "--numstat"];
        if settings.ignore_whitespace {
            diff_args.push("-w");
        }

        let range = if let Some(ref base) = base_commit {
            format!("{}..HEAD", base)
        } else {
            "HEAD".to_string()
        };
        diff_args.push(&range);

        let output = Command::new("git")
            .args(&diff_args)
            .current_dir(worktree)
            .output()
            .context("Failed to run git diff --numstat")?;

        if output.status.success() {
            for (path, added, removed, is_binary) in parse_numstat_output(&output.stdout) {
                tracked_paths.insert(path.clone());
                files.push(FileDiff {
                    path,
                    status: FileStatus::Modified,
                    lines_added: added,
                    lines_removed: removed,
                    is_binary,
                    patch: None,
                });
            }
        }

        let uncommitted_output = Command::new("git")
            .args(["diff", "--numstat", "HEAD"])
            .current_dir(worktree)
            .output()
            .context("Failed to run git diff --numstat HEAD")?;

        if uncommitted_output.status.success() {
            for (path, added, removed, is_binary) in
                parse_numstat_output(&uncommitted_output.stdout)
            {
                if !tracked_paths.contains(&path) {
                    tracked_paths.insert(path.clone());
                    files.push(FileDiff {
                        path,
                        status: FileStatus::Modified,
                        lines_added: added,
                        lines_removed: removed,
                        is_binary,
                        patch: None,
                    });
                }
            }
        }

        if settings.include_untracked {
            let untracked_output = Command::new("git")
                .args(["ls-files", "--others", "--exclude-standard", "-z"])
                .current_dir(worktree)
                .output()
                .context("Failed to run git ls-files")?;

            if untracked_output.status.success() {
                for path in parse_null_delimited(&untracked_output.stdout) {
                    if !tracked_paths.contains(&path) {
                        let file_path = worktree.join(&path);
                        let lines_added = if file_path.exists() {
                            std::fs::read_to_string(&file_path)
                                .map(|content| content.lines().count())
                                .unwrap_or(0)
                        } else {
                            0
                        };

                        files.push(FileDiff {
                            path,
                            status: FileStatus::Untracked,
                            lines_added,
                            lines_removed: 0,
                            is_binary: false,
                            patch: None,
                        });
                    }
                }
            }
        }

        let total_added: usize = files.iter().map(|f| f.lines_added).sum();
        let total_removed: usize = files.iter().map(|f| f.lines_removed).sum();
        let files_changed = files.len();

        Ok(DiffReport {
            files,
            total_added,
            total_removed,
            files_changed,
        })
    }

    pub fn diff_file_patch(
        &self,
        worktree: &Path,
        file_path: &str,
        base_commit: Option<&str>,
        settings: &DiffSettings,
    ) -> Result<String> {
        let mut args = vec!["diff", "--no-color"];

        if settings.ignore_whitespace {
            args.push("-w");
        }

        if settings.context_lines > 0 {
            let context_arg = format!("-U{}", settings.context_lines);
            let mut args_with_context = args.clone();
            args_with_context.push(&context_arg);

            if let Some(base) = base_commit {
                args_with_context.push(base);
            } else {
                args_with_context.push("HEAD");
            }

            args_with_context.push("--");
            args_with_context.push(file_path);

            let output = Command::new("git")
                .args(&args_with_context)
                .current_dir(worktree)
                .output()
                .context("Failed to run git diff for file")?;

            if !output.status.success() {
                bail!(
                    "git diff failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
            }

            return Ok(String::from_utf8_lossy(&output.stdout).to_string());
        }

        if let Some(base) = base_commit {
            args.push(base);
        } else {
            args.push("HEAD");
        }

        args.push("--");
        args.push(file_path);

        let output = Command::new("git")
            .args(&args)
            .current_dir(worktree)
            .output()
            .context("Failed to run git diff for file")?;

        if !output.status.success() {
            bail!(
                "git diff failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn opts_base_branch(_opts: &MergeOptions, base_branch: &str) -> String {
    base_branch.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap_or_else(|e| panic!("failed to run git {:?}: {}", args, e));
        assert!(
            output.status.success(),
            "git {:?} failed:\nstdout:\n{}\nstderr:\n{}",
            args,
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn init_repo(repo: &Path) {
        git(repo, &["init"]);
        git(repo, &["config", "user.email", "test@example.com"]);
        git(repo, &["config", "user.name", "Test User"]);
        fs::write(repo.join("README.md"), "hello\n").expect("write README");
        git(repo, &["add", "README.md"]);
        git(repo, &["commit", "-m", "init"]);
        git(repo, &["branch", "-m", "main"]);
    }

    #[test]
    fn sanitize_branch_component_replaces_unsafe_characters() {
        assert_eq!(sanitize_branch_component("issue 42"), "issue-42");
        assert_eq!(sanitize_branch_component("a.b~c^d:e?f*g[h`i"), "a-b-c-d-e-f-g-h-i");
    }

    #[test]
    fn create_worktree_uses_coven_branch_prefix() {
        let tmp = TempDir::new().expect("tempdir");
        let repo = tmp.path();
        init_repo(repo);

        let gm = GitManager::new(repo).expect("git manager");
        let task_id = TaskId::new("T-1");
        let info = gm.create_worktree(&task_id).expect("create worktree");

        assert!(info.branch_name.starts_with("coven/"));
        assert_eq!(info.base_branch, "main");
        assert!(info.path.exists());
    }

    #[test]
    fn diff_uses_provided_base_branch() {
        let tmp = TempDir::new().expect("tempdir");
        let repo = tmp.path();
        init_repo(repo);

        git(repo, &["checkout", "-b", "coven/t1"]);
        fs::write(repo.join("README.md"), "hello world\n").expect("write README");
        git(repo, &["add", "README.md"]);
        git(repo, &["commit", "-m", "change"]);

        let gm = GitManager::new(repo).expect("git manager");
        let diff = gm.diff(repo, Some("main")).expect("diff");
        assert!(
            diff.contains("hello world"),
            "expected diff to include changed content, got:\n{}",
            diff
        );
    }

    #[test]
    fn merge_worktree_merges_clean_branch() {
        let tmp = TempDir::new().expect("tempdir");
        let repo = tmp.path();
        init_repo(repo);

        let gm = GitManager::new(repo).expect("git manager");
        let task_id = TaskId::new("T-2");
        let info = gm.create_worktree(&task_id).expect("create worktree");

        fs::write(info.path.join("feature.txt"), "feature\n").expect("write feature");
        git(&info.path, &["add", "feature.txt"]);
        git(&info.path, &["commit", "-m", "add feature"]);

        let outcome = gm
            .merge_worktree(&info, &MergeOptions::default())
            .expect("merge");
        assert!(matches!(outcome, MergeOutcome::Merged));
        assert!(repo.join("feature.txt").exists());
    }

    #[test]
    fn parse_numstat_output_basic() {
        let output = b"10\t5\tfile.rs\n3\t0\tnew_file.txt\n";
        let results = parse_numstat_output(output);

        assert_eq!(results.len(), 2);
        assert_eq!(results[0], ("file.rs".to_string(), 10, 5, false));
        assert_eq!(results[1], ("new_file.txt".to_string(), 3, 0, false));
    }

    #[test]
    fn parse_numstat_output_binary() {
        let output = b"-\t-\timage.png\n";
        let results = parse_numstat_output(output);

        assert_eq!(results.len(), 1);
        assert_eq!(results[0], ("image.png".to_string(), 0, 0, true));
    }

    #[test]
    fn diff_report_basic() {
        let tmp = TempDir::new().expect("tempdir");
        let repo = tmp.path();
        init_repo(repo);

        git(repo, &["checkout", "-b", "coven/t3"]);
        fs::write(repo.join("README.md"), "hello world\nline 2\n").expect("write README");
        git(repo, &["add", "README.md"]);
        git(repo, &["commit", "-m", "change"]);

        let gm = GitManager::new(repo).expect("git manager");
        let settings = DiffSettings::default();
        let report = gm
            .diff_report(repo, Some("main"), &settings)
            .expect("diff_report");

        assert_eq!(report.files_changed, 1);
        assert_eq!(report.files[0].path, "README.md");
        assert_eq!(report.files[0].status, FileStatus::Modified);
        assert!(report.total_added > 0 || report.total_removed > 0);
    }
}
