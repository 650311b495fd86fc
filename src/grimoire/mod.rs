//! Grimoire & Spell Loader (§4.6): resolves named workflow definitions
//! and prompt templates from `.coven/grimoires` / `.coven/spells`,
//! falling back to a built-in set, and validates the loaded schema.

use std::collections::HashSet;

use anyhow::{Context, Result, bail};

use crate::domain::{Grimoire, StepSpec};
use crate::paths::WorkspacePaths;

/// A single-step grimoire good enough to drive a task end to end when
/// the workspace hasn't defined its own.
const BUILTIN_DEFAULT: &str = r#"
name: default
description: Run the agent once and merge on success.
steps:
  - type: agent
    name: implement
    spell: "implement"
  - type: merge
    name: finish
"#;

/// Demonstrates the merge-gate flow used in acceptance scenario 4: a
/// script step followed by a merge that requires explicit review before
/// it will proceed.
const BUILTIN_WITH_MERGE: &str = r#"
name: with-merge
description: Run a script step, then require explicit review before merging.
steps:
  - type: script
    name: prepare
    command: "true"
  - type: merge
    name: finish
    require_review: true
"#;

fn builtin_grimoire_yaml(name: &str) -> Option<&'static str> {
    match name {
        "default" => Some(BUILTIN_DEFAULT),
        "with-merge" => Some(BUILTIN_WITH_MERGE),
        _ => None,
    }
}

const BUILTIN_IMPLEMENT_SPELL: &str = "{{.task.title}}\n\n{{.task.body}}";

fn builtin_spell(name: &str) -> Option<&'static str> {
    match name {
        "implement" => Some(BUILTIN_IMPLEMENT_SPELL),
        _ => None,
    }
}

/// Resolve a grimoire by name: `.coven/grimoires/{name}.yaml` first,
/// then the built-in set (§4.6).
pub async fn load_grimoire(paths: &WorkspacePaths, name: &str) -> Result<Grimoire> {
    let override_path = paths.grimoires_dir().join(format!("{name}.yaml"));
    let yaml = if override_path.exists() {
        tokio::fs::read_to_string(&override_path)
            .await
            .with_context(|| format!("reading {}", override_path.display()))?
    } else if let Some(builtin) = builtin_grimoire_yaml(name) {
        builtin.to_string()
    } else {
        bail!("unknown grimoire: {name}");
    };

    let grimoire: Grimoire =
        serde_yaml::from_str(&yaml).with_context(|| format!("parsing grimoire {name}"))?;
    validate(&grimoire)?;
    Ok(grimoire)
}

/// Resolve a spell reference. If `reference` contains a newline it is
/// inline template content and no file lookup occurs (§4.6).
pub async fn load_spell(paths: &WorkspacePaths, reference: &str) -> Result<String> {
    if reference.contains('\n') {
        return Ok(reference.to_string());
    }

    let override_path = paths.spells_dir().join(format!("{reference}.md"));
    if override_path.exists() {
        return tokio::fs::read_to_string(&override_path)
            .await
            .with_context(|| format!("reading {}", override_path.display()));
    }

    if let Some(builtin) = builtin_spell(reference) {
        return Ok(builtin.to_string());
    }

    bail!("unknown spell: {reference}");
}

/// Rejects unknown step types (handled by serde deserialization itself
/// returning an error before we even get here), duplicate step names
/// within one container, and timeout strings outside the accepted
/// duration grammar.
pub fn validate(grimoire: &Grimoire) -> Result<()> {
    validate_steps(&grimoire.steps)
}

fn validate_steps(steps: &[StepSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step.name().to_string()) {
            bail!("duplicate step name in container: {}", step.name());
        }
        if let Some(timeout) = &step.common().timeout {
            humantime::parse_duration(timeout)
                .with_context(|| format!("invalid timeout '{timeout}' on step '{}'", step.name()))?;
        }
        if let StepSpec::Loop { body, .. } = step {
            validate_steps(body)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn loads_builtin_default_grimoire() {
        let tmp = TempDir::new().unwrap();
        let paths = WorkspacePaths::new(tmp.path());
        let grimoire = load_grimoire(&paths, "default").await.unwrap();
        assert_eq!(grimoire.name, "default");
        assert_eq!(grimoire.step_names(), vec!["implement", "finish"]);
    }

    #[tokio::test]
    async fn workspace_override_takes_precedence_over_builtin() {
        let tmp = TempDir::new().unwrap();
        let paths = WorkspacePaths::new(tmp.path());
        tokio::fs::create_dir_all(paths.grimoires_dir()).await.unwrap();
        tokio::fs::write(
            paths.grimoires_dir().join("default.yaml"),
            "name: default\nsteps:\n  - type: script\n    name: only-step\n    command: echo hi\n",
        )
        .await
        .unwrap();

        let grimoire = load_grimoire(&paths, "default").await.unwrap();
        assert_eq!(grimoire.step_names(), vec!["only-step"]);
    }

    #[tokio::test]
    async fn unknown_grimoire_name_errors() {
        let tmp = TempDir::new().unwrap();
        let paths = WorkspacePaths::new(tmp.path());
        assert!(load_grimoire(&paths, "does-not-exist").await.is_err());
    }

    #[tokio::test]
    async fn inline_spell_reference_skips_file_lookup() {
        let tmp = TempDir::new().unwrap();
        let paths = WorkspacePaths::new(tmp.path());
        let rendered = load_spell(&paths, "line one\nline two").await.unwrap();
        assert_eq!(rendered, "line one\nline two");
    }

    #[test]
    fn validate_rejects_duplicate_step_names() {
        let yaml = r#"
name: bad
steps:
  - type: script
    name: dup
    command: "true"
  - type: script
    name: dup
    command: "true"
"#;
        let grimoire: Grimoire = serde_yaml::from_str(yaml).unwrap();
        assert!(validate(&grimoire).is_err());
    }

    #[test]
    fn validate_rejects_bad_timeout_grammar() {
        let yaml = r#"
name: bad
steps:
  - type: script
    name: s1
    command: "true"
    timeout: "not-a-duration"
"#;
        let grimoire: Grimoire = serde_yaml::from_str(yaml).unwrap();
        assert!(validate(&grimoire).is_err());
    }
}
