//! Shared layout of the `.coven` directory (§6 "Lifecycle files").

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    root: PathBuf,
}

impl WorkspacePaths {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            root: workspace_root.into(),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.root
    }

    pub fn coven_dir(&self) -> PathBuf {
        self.root.join(".coven")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.coven_dir().join("covend.sock")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.coven_dir().join("covend.pid")
    }

    pub fn log_path(&self) -> PathBuf {
        self.coven_dir().join("covend.log")
    }

    pub fn state_path(&self) -> PathBuf {
        self.coven_dir().join("state.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.coven_dir().join("config.json")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.coven_dir().join("output")
    }

    pub fn output_file(&self, step_task_id: &str) -> PathBuf {
        self.output_dir().join(format!("{step_task_id}.jsonl"))
    }

    pub fn questions_dir(&self) -> PathBuf {
        self.coven_dir().join("questions")
    }

    pub fn question_file(&self, id: &str) -> PathBuf {
        self.questions_dir().join(format!("{id}.json"))
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.coven_dir().join("worktrees")
    }

    pub fn grimoires_dir(&self) -> PathBuf {
        self.coven_dir().join("grimoires")
    }

    pub fn spells_dir(&self) -> PathBuf {
        self.coven_dir().join("spells")
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.coven_dir().join("secrets.yaml")
    }

    /// Create every directory the daemon expects to exist at startup.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.coven_dir(),
            self.output_dir(),
            self.questions_dir(),
            self.worktrees_dir(),
            self.grimoires_dir(),
            self.spells_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
