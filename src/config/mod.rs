//! Daemon configuration (`config.json`, §6).
//!
//! Five options, each with a default so a missing file or a missing key
//! is never an error; JSON instead of TOML because `config.json` is also
//! read/written by non-Rust tooling. Unknown keys are ignored (serde's
//! default behavior absent `deny_unknown_fields`).

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_poll_interval() -> u64 {
    1
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_max_concurrent_agents() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_grimoire() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    #[serde(default = "default_agent_command")]
    pub agent_command: String,

    #[serde(default)]
    pub agent_args: Vec<String>,

    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: u32,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Grimoire used when a task's type has no entry in `grimoire_by_type`
    /// (§4.8, "grimoire resolution").
    #[serde(default = "default_grimoire")]
    pub default_grimoire: String,

    /// Task-type label (§3 `grimoire_label`) to grimoire name, checked
    /// before `default_grimoire` falls in.
    #[serde(default)]
    pub grimoire_by_type: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            agent_command: default_agent_command(),
            agent_args: Vec::new(),
            max_concurrent_agents: default_max_concurrent_agents(),
            log_level: default_log_level(),
            default_grimoire: default_grimoire(),
            grimoire_by_type: HashMap::new(),
        }
    }
}

impl Config {
    /// Grimoire resolution order (§4.8): the task's own type label, then
    /// the workspace-wide default.
    pub fn grimoire_for_label(&self, label: &str) -> &str {
        self.grimoire_by_type
            .get(label)
            .map(String::as_str)
            .unwrap_or(&self.default_grimoire)
    }
}

impl Config {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval.max(1))
    }

    /// Missing file means defaults (§6, "all optional"); a malformed file
    /// is a hard error rather than a silent fallback, since a typo'd
    /// `config.json` is almost certainly a mistake the operator wants to
    /// see rather than have masked at startup.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self).context("serializing config")?;
        std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load(&tmp.path().join("config.json")).unwrap();
        assert_eq!(config.max_concurrent_agents, 3);
        assert_eq!(config.agent_command, "claude");
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"poll_interval": 5, "made_up_key": true}"#).unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.poll_interval, 5);
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        let mut config = Config::default();
        config.max_concurrent_agents = 7;
        config.save(&path).unwrap();
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.max_concurrent_agents, 7);
    }
}
