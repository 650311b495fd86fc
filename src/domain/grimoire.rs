//! Grimoire — a named, YAML-defined workflow template, and the spell
//! (reusable step fragment) it may reference (§3, §4.6, §4.7, §9
//! "Polymorphic steps").
//!
//! `StepSpec` is a `#[serde(tag = "type")]` tagged union: one discriminant
//! field picks the variant, everything else is the variant's own shape.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fields every step carries regardless of kind (§3 "Common step fields").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCommon {
    pub name: String,
    /// Template expression evaluated against the workflow context; a
    /// falsy result skips the step without failing the workflow.
    #[serde(default)]
    pub when: Option<String>,
    /// `humantime`-grammar duration ("30s", "5m"); `None` or zero means
    /// no timeout.
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub on_fail: OnFailure,
    #[serde(default)]
    pub on_success: Option<OnSuccess>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Continue,
    Block,
    #[default]
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnSuccess {
    Continue,
    ExitLoop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMaxIterations {
    #[default]
    Block,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepSpec {
    Agent {
        #[serde(flatten)]
        common: StepCommon,
        /// Spell reference: a name looked up under `.coven/spells`, or
        /// inline template text (detected by an embedded newline).
        spell: String,
        /// Extra variables merged into the context before rendering the
        /// spell for this step only.
        #[serde(default)]
        variables: HashMap<String, serde_json::Value>,
    },
    Script {
        #[serde(flatten)]
        common: StepCommon,
        command: String,
        #[serde(default)]
        env: HashMap<String, String>,
        /// Relative to the worktree root; must resolve inside it.
        #[serde(default)]
        workdir: Option<String>,
    },
    Loop {
        #[serde(flatten)]
        common: StepCommon,
        /// Template expression evaluated each iteration; loop continues
        /// while it remains truthy.
        condition: String,
        body: Vec<StepSpec>,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
        #[serde(default)]
        on_max_iterations: OnMaxIterations,
    },
    Merge {
        #[serde(flatten)]
        common: StepCommon,
        #[serde(default = "default_require_review")]
        require_review: bool,
        #[serde(default)]
        auto_rebase: bool,
        #[serde(default)]
        commit_message: Option<String>,
        #[serde(default)]
        pre_merge: Vec<String>,
    },
}

fn default_max_iterations() -> u32 {
    20
}

fn default_require_review() -> bool {
    true
}

impl StepSpec {
    pub fn common(&self) -> &StepCommon {
        match self {
            StepSpec::Agent { common, .. } => common,
            StepSpec::Script { common, .. } => common,
            StepSpec::Loop { common, .. } => common,
            StepSpec::Merge { common, .. } => common,
        }
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }
}

/// A reusable step fragment referenced from an `agent` step via `spell:`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spell {
    pub name: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grimoire {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Overall workflow timeout; `None` means no ceiling beyond the
    /// per-step timeouts.
    #[serde(default)]
    pub timeout: Option<String>,
    pub steps: Vec<StepSpec>,
}

impl Grimoire {
    /// Flattened top-level + nested loop-body step names, in execution
    /// order, for seeding a `Workflow`'s step records.
    pub fn step_names(&self) -> Vec<String> {
        fn collect(steps: &[StepSpec], out: &mut Vec<String>) {
            for step in steps {
                out.push(step.name().to_string());
                if let StepSpec::Loop { body, .. } = step {
                    collect(body, out);
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.steps, &mut out);
        out
    }

    /// Same flattening as `step_names`, but yielding the steps themselves
    /// so a resumption path can look up a step's `on_fail` policy by
    /// flat index (§4.7 "Resumption").
    pub fn flattened_steps(&self) -> Vec<&StepSpec> {
        fn collect<'a>(steps: &'a [StepSpec], out: &mut Vec<&'a StepSpec>) {
            for step in steps {
                out.push(step);
                if let StepSpec::Loop { body, .. } = step {
                    collect(body, out);
                }
            }
        }
        let mut out = Vec::new();
        collect(&self.steps, &mut out);
        out
    }

    pub fn find_step(&self, name: &str) -> Option<&StepSpec> {
        fn search<'a>(steps: &'a [StepSpec], name: &str) -> Option<&'a StepSpec> {
            for step in steps {
                if step.name() == name {
                    return Some(step);
                }
                if let StepSpec::Loop { body, .. } = step {
                    if let Some(found) = search(body, name) {
                        return Some(found);
                    }
                }
            }
            None
        }
        search(&self.steps, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_step_union_from_yaml() {
        let yaml = r#"
name: default
steps:
  - type: agent
    name: implement
    spell: "implement-task"
  - type: script
    name: test
    command: "cargo test"
    on_fail: continue
  - type: merge
    name: finish
    auto_rebase: true
"#;
        let grimoire: Grimoire = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(grimoire.steps.len(), 3);
        assert_eq!(grimoire.step_names(), vec!["implement", "test", "finish"]);
        match &grimoire.steps[1] {
            StepSpec::Script { common, command, .. } => {
                assert_eq!(command, "cargo test");
                assert_eq!(common.on_fail, OnFailure::Continue);
            }
            other => panic!("expected script step, got {:?}", other),
        }
        match &grimoire.steps[2] {
            StepSpec::Merge { require_review, auto_rebase, .. } => {
                assert!(require_review, "require_review defaults to true");
                assert!(*auto_rebase);
            }
            other => panic!("expected merge step, got {:?}", other),
        }
    }

    #[test]
    fn flattens_nested_loop_body_step_names() {
        let yaml = r#"
name: retry-loop
steps:
  - type: loop
    name: retry
    condition: "{{.previous.failed}}"
    max_iterations: 3
    body:
      - type: agent
        name: fix
        spell: "fix-it"
"#;
        let grimoire: Grimoire = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(grimoire.step_names(), vec!["retry", "fix"]);
        assert!(grimoire.find_step("fix").is_some());
    }

    #[test]
    fn on_fail_rejects_unknown_values() {
        let yaml = r#"
name: bad
steps:
  - type: script
    name: s1
    command: "true"
    on_fail: halt
"#;
        let result: Result<Grimoire, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }
}
