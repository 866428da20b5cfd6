//! Shared data model for plans, tasks, and tool outcomes.
//!
//! These types are the stable contract between the architect, the execution
//! loop, persistence, and whatever renders plan state. They carry no behaviour
//! beyond small constructors and must stay free of I/O.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How a task is expected to be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// A single deterministic tool invocation.
    #[default]
    SimpleAction,
    /// A tool invocation that itself consults the LLM or the user.
    AgenticAction,
}

/// Lifecycle of a task: `pending -> in_progress -> {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// One unit of work within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    #[serde(default)]
    pub task_type: TaskType,
    pub action: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_retry: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,
}

/// The shape of a task as authored by the architect, before ids and
/// runner-owned fields are assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    #[serde(default)]
    pub task_type: TaskType,
    pub action: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub save_as: Option<String>,
}

impl TaskDraft {
    /// Materialize a draft into a fresh `pending` task.
    pub fn into_task(self, id: u64, retries: u32) -> Task {
        Task {
            id,
            task_type: self.task_type,
            action: self.action,
            description: self.description,
            parameters: self.parameters,
            status: TaskStatus::Pending,
            result: None,
            retries,
            can_retry: None,
            save_as: self.save_as.filter(|name| !name.trim().is_empty()),
        }
    }
}

/// Status of a pre-planning investigation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

/// A tool call made by the architect before a plan existed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationStep {
    pub action: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<String>,
}

/// Whether a plan is the live one or an archived block of experience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Live,
    Stale,
}

/// Normalized result of a tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: String,
}

impl ToolOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Truncate `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        None => text.to_string(),
        Some((byte_idx, _)) => format!("{}... [truncated]", &text[..byte_idx]),
    }
}
