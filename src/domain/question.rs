//! Question — a detected prompt from an agent's output awaiting an answer
//! (§3, §4.5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{QuestionId, StepTaskId, TaskId, WorkflowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Confirmation,
    Choice,
    Permission,
    Input,
}

impl std::fmt::Display for QuestionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QuestionType::Confirmation => "confirmation",
            QuestionType::Choice => "choice",
            QuestionType::Permission => "permission",
            QuestionType::Input => "input",
        };
        write!(f, "{}", s)
    }
}

/// Where in a workflow a question originated, so an answer can be routed
/// back to the right agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub workflow_id: WorkflowId,
    pub step_name: String,
    pub step_index: usize,
    pub step_task_id: StepTaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub task_id: TaskId,
    pub workflow: WorkflowContext,
    pub question_type: QuestionType,
    pub prompt: String,
    /// Populated for `Choice`; empty otherwise.
    pub options: Vec<String>,
    /// Sequence number of the output line that produced this question,
    /// used to keep detection order stable across restarts.
    pub seq: u64,
    pub detected_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub answer: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl Question {
    pub fn new(
        id: QuestionId,
        task_id: TaskId,
        workflow: WorkflowContext,
        question_type: QuestionType,
        prompt: impl Into<String>,
        options: Vec<String>,
        seq: u64,
    ) -> Self {
        Self {
            id,
            task_id,
            workflow,
            question_type,
            prompt: prompt.into(),
            options,
            seq,
            detected_at: Utc::now(),
            answered_at: None,
            answer: None,
            delivered_at: None,
        }
    }

    pub fn is_answered(&self) -> bool {
        self.answered_at.is_some()
    }

    pub fn mark_delivered(&mut self) {
        self.delivered_at = Some(Utc::now());
    }

    pub fn mark_answered(&mut self, answer: impl Into<String>) {
        self.answer = Some(answer.into());
        self.answered_at = Some(Utc::now());
    }
}
