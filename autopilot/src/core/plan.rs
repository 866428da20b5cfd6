//! The live plan and its archive of prior attempts.
//!
//! Task ids are allocated from a monotonic counter owned by the plan, so a
//! splice can drop tasks freely without ever handing an old id to a new task.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::types::{InvestigationStep, PlanStatus, Task, TaskDraft, TaskStatus};

/// Root planning artifact for one objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub objective: String,
    #[serde(default)]
    pub scratchpad: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub investigation: Vec<InvestigationStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<Plan>,
    #[serde(default)]
    pub status: PlanStatus,
    /// Next id to hand out. Always greater than every id ever allocated.
    #[serde(default = "first_task_id")]
    pub next_task_id: u64,
}

fn first_task_id() -> u64 {
    1
}

impl Plan {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            objective: objective.into(),
            scratchpad: String::new(),
            tasks: Vec::new(),
            investigation: Vec::new(),
            attempts: Vec::new(),
            status: PlanStatus::Live,
            next_task_id: first_task_id(),
        }
    }

    /// Build a live plan from architect drafts.
    ///
    /// Every draft must name an enabled tool; otherwise the offending actions
    /// are returned so the architect can be told to fix them.
    pub fn initialize(
        objective: &str,
        drafts: Vec<TaskDraft>,
        enabled_tools: &BTreeSet<String>,
    ) -> Result<Self, Vec<String>> {
        if drafts.is_empty() {
            return Err(vec!["plan has no tasks".to_string()]);
        }
        let unknown = unknown_actions(&drafts, enabled_tools);
        if !unknown.is_empty() {
            return Err(unknown);
        }
        let mut plan = Plan::new(objective);
        plan.append_drafts(drafts, 0);
        Ok(plan)
    }

    /// Allocate the next task id.
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_task_id;
        self.next_task_id += 1;
        id
    }

    pub fn task_by_id(&self, id: u64) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    /// Index of the first task that has not run yet.
    pub fn first_pending_index(&self) -> Option<usize> {
        self.tasks
            .iter()
            .position(|task| task.status == TaskStatus::Pending)
    }

    /// True while some task is still waiting to run (or was interrupted).
    pub fn has_pending_work(&self) -> bool {
        self.tasks
            .iter()
            .any(|task| matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress))
    }

    /// Append a line to the scratchpad.
    pub fn note(&mut self, line: impl AsRef<str>) {
        if !self.scratchpad.is_empty() && !self.scratchpad.ends_with('\n') {
            self.scratchpad.push('\n');
        }
        self.scratchpad.push_str(line.as_ref());
    }

    /// Snapshot the current state into `attempts` as a stale block of experience.
    ///
    /// Must be called before any destructive edit of `tasks`.
    pub fn archive(&mut self, reason: &str) {
        let mut snapshot = Plan {
            objective: self.objective.clone(),
            scratchpad: self.scratchpad.clone(),
            tasks: self.tasks.clone(),
            investigation: self.investigation.clone(),
            attempts: Vec::new(),
            status: PlanStatus::Stale,
            next_task_id: self.next_task_id,
        };
        snapshot.note(format!("[archived] {reason}"));
        self.attempts.push(snapshot);
    }

    /// Drop the task at `index` and everything after it, then append `drafts`.
    ///
    /// The first replacement task inherits `inherited_retries` so the retry
    /// budget follows the list position rather than resetting on every revision.
    pub fn replace_from(&mut self, index: usize, drafts: Vec<TaskDraft>, inherited_retries: u32) {
        self.tasks.truncate(index);
        self.append_drafts(drafts, inherited_retries);
    }

    /// Keep tasks up to and including `index`, then append `drafts`.
    pub fn replace_after(&mut self, index: usize, drafts: Vec<TaskDraft>) {
        self.tasks.truncate(index.saturating_add(1));
        self.append_drafts(drafts, 0);
    }

    fn append_drafts(&mut self, drafts: Vec<TaskDraft>, first_retries: u32) {
        for (offset, draft) in drafts.into_iter().enumerate() {
            let id = self.allocate_id();
            let retries = if offset == 0 { first_retries } else { 0 };
            self.tasks.push(draft.into_task(id, retries));
        }
    }

    /// Bounded, human-readable listing of tasks.
    pub fn summary(&self, max_tasks: usize) -> String {
        let mut lines = Vec::new();
        for task in self.tasks.iter().take(max_tasks) {
            lines.push(format!(
                "- [{}] #{} {} ({}): {}",
                task.status.as_str(),
                task.id,
                task.action,
                task.retries,
                task.description
            ));
        }
        if self.tasks.len() > max_tasks {
            lines.push(format!("- ... {} more", self.tasks.len() - max_tasks));
        }
        lines.join("\n")
    }
}

/// Actions named by `drafts` that are not in `enabled_tools`, deduplicated.
pub fn unknown_actions(drafts: &[TaskDraft], enabled_tools: &BTreeSet<String>) -> Vec<String> {
    let mut unknown: Vec<String> = drafts
        .iter()
        .filter(|draft| !enabled_tools.contains(&draft.action))
        .map(|draft| draft.action.clone())
        .collect();
    unknown.sort();
    unknown.dedup();
    unknown
}
