//! Core domain types for the daemon.

mod agent;
mod grimoire;
mod ids;
mod question;
mod session;
mod task;
mod workflow;

pub use agent::{Agent, AgentStatus, ProcessIdentity};
pub use grimoire::{Grimoire, OnFailure, OnMaxIterations, OnSuccess, Spell, StepCommon, StepSpec};
pub use ids::{QuestionId, StepTaskId, TaskId, WorkflowId};
pub use question::{Question, QuestionType, WorkflowContext};
pub use session::{Session, SessionStatus};
pub use task::{Task, TaskStatus};
pub use workflow::{ConflictRecord, StepRecord, StepStatus, Workflow, WorkflowStatus};
