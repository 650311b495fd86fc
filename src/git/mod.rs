//! Git worktree management and merging

mod manager;

pub use manager::{CommitMessage, MergeOptions, MergeOutcome, sanitize_commit_subject};
pub use manager::{DiffReport, DiffSettings, FileDiff, FileStatus};
pub use manager::{GitManager, WorktreeInfo, find_git_root};
