//! Secrets source for template rendering (§6 `secrets.yaml`): a
//! name -> value map, read once per workflow spawn, with the process
//! environment as a fallback for names `secrets.yaml` doesn't define.

use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::paths::WorkspacePaths;

/// The loaded secret values (for the template context) and the raw
/// string values (for log redaction — §6 "displayed as `***`").
pub struct Secrets {
    pub context: serde_json::Value,
    values: Vec<String>,
}

impl Secrets {
    pub async fn load(paths: &WorkspacePaths) -> Result<Self> {
        let path = paths.secrets_path();
        let mut map: HashMap<String, String> = if path.exists() {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            HashMap::new()
        };

        // Process env is a fallback only: an explicit secrets.yaml entry
        // always wins.
        for (key, value) in std::env::vars() {
            map.entry(key).or_insert(value);
        }

        let values = map.values().cloned().collect();
        let context = serde_json::to_value(&map).context("serializing secrets context")?;
        Ok(Self { context, values })
    }

    /// Replace every occurrence of a known secret value with `***`
    /// (§6). Applied to text that's about to be logged or surfaced in a
    /// user-visible error, never to the value handed to the agent process
    /// itself.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for value in &self.values {
            if value.len() >= 6 {
                out = out.replace(value.as_str(), "***");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_does_not_error() {
        let tmp = TempDir::new().unwrap();
        let paths = WorkspacePaths::new(tmp.path());
        let secrets = Secrets::load(&paths).await.unwrap();
        assert!(secrets.context.as_object().unwrap().get("__covend_nonexistent_key__").is_none());
    }

    #[tokio::test]
    async fn file_values_are_redacted_in_log_text() {
        let tmp = TempDir::new().unwrap();
        let paths = WorkspacePaths::new(tmp.path());
        tokio::fs::create_dir_all(paths.coven_dir()).await.unwrap();
        tokio::fs::write(paths.secrets_path(), "api_key: sk-super-secret-value\n")
            .await
            .unwrap();
        let secrets = Secrets::load(&paths).await.unwrap();
        let redacted = secrets.redact("using sk-super-secret-value for auth");
        assert_eq!(redacted, "using *** for auth");
    }
}
