//! Opaque identifier newtypes shared across every component.
//!
//! Task ids are externally supplied by the issue store; every other id is
//! daemon-assigned. All are represented as owned strings behind a newtype so
//! they cannot be accidentally swapped for one another at a call site.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

opaque_id!(TaskId);
opaque_id!(WorkflowId);
opaque_id!(QuestionId);

/// `{taskId}-step-{N}`, the external contract identifying one process
/// within a workflow. Preserved verbatim across daemon restarts so
/// persisted output/question files remain matchable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepTaskId(pub String);

impl StepTaskId {
    pub fn new(task_id: &TaskId, step_index: usize) -> Self {
        Self(format!("{}-step-{}", task_id.as_str(), step_index))
    }

    /// Parse `{main}-step-{N}` into `(main_task_id, true)`.
    /// Returns `(original, false)` if the string doesn't match the grammar.
    pub fn parse(raw: &str) -> (TaskId, bool) {
        if let Some(idx) = raw.rfind("-step-") {
            let (main, rest) = raw.split_at(idx);
            let n = &rest["-step-".len()..];
            if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) {
                return (TaskId::new(main), true);
            }
        }
        (TaskId::new(raw), false)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_task_id_parses_back() {
        let task = TaskId::new("T1");
        let step = StepTaskId::new(&task, 3);
        assert_eq!(step.as_str(), "T1-step-3");
        let (parsed, ok) = StepTaskId::parse(step.as_str());
        assert!(ok);
        assert_eq!(parsed, task);
    }

    #[test]
    fn parse_rejects_non_step_ids() {
        let (_, ok) = StepTaskId::parse("T1");
        assert!(!ok);
    }

    #[test]
    fn parse_handles_task_ids_containing_step_substring() {
        // task id itself contains "-step-" as a literal substring; rfind picks
        // the rightmost separator so the numeric suffix still parses.
        let (parsed, ok) = StepTaskId::parse("weird-step-id-step-2");
        assert!(ok);
        assert_eq!(parsed.as_str(), "weird-step-id");
    }
}
