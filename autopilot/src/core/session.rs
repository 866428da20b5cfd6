//! Per-conversation mutable state owned by the orchestrator.
//!
//! Lifecycle: created on the first message, failure state cleared when a new
//! objective starts with no live plan, dropped with the conversation.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde_json::Value;

use crate::core::failure_memory::FailureMemory;

/// Default number of working-memory entries kept before FIFO eviction.
pub const DEFAULT_WORKING_MEMORY_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct SessionState {
    /// Raw data zone populated by tasks that declare `save_as`.
    pub repl_variables: BTreeMap<String, Value>,
    pub installed_packages: Vec<String>,
    pub environment_history: Vec<String>,
    pub active_env: Option<String>,
    pub failure_memory: FailureMemory,
    working_memory: VecDeque<String>,
    working_memory_capacity: usize,
    /// Consecutive failures keyed by list position, not task id.
    consecutive_failures: HashMap<usize, u32>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(DEFAULT_WORKING_MEMORY_CAPACITY)
    }
}

impl SessionState {
    pub fn new(working_memory_capacity: usize) -> Self {
        Self {
            repl_variables: BTreeMap::new(),
            installed_packages: Vec::new(),
            environment_history: Vec::new(),
            active_env: None,
            failure_memory: FailureMemory::new(),
            working_memory: VecDeque::new(),
            working_memory_capacity: working_memory_capacity.max(1),
            consecutive_failures: HashMap::new(),
        }
    }

    /// Reset failure bookkeeping for a brand-new objective.
    pub fn begin_objective(&mut self) {
        self.failure_memory.clear();
        self.consecutive_failures.clear();
    }

    pub fn remember(&mut self, entry: impl Into<String>) {
        self.working_memory.push_back(entry.into());
        while self.working_memory.len() > self.working_memory_capacity {
            self.working_memory.pop_front();
        }
    }

    pub fn working_memory(&self) -> impl Iterator<Item = &str> {
        self.working_memory.iter().map(String::as_str)
    }

    pub fn working_memory_len(&self) -> usize {
        self.working_memory.len()
    }

    /// Store a task result under `name`, parsing it as JSON when possible.
    pub fn save_variable(&mut self, name: &str, raw: &str) {
        let value = serde_json::from_str::<Value>(raw.trim())
            .unwrap_or_else(|_| Value::String(raw.to_string()));
        self.repl_variables.insert(name.to_string(), value);
    }

    /// Increment and return the failure counter for list position `index`.
    pub fn record_index_failure(&mut self, index: usize) -> u32 {
        let count = self.consecutive_failures.entry(index).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset_index_failures(&mut self, index: usize) {
        self.consecutive_failures.remove(&index);
    }

    pub fn index_failures(&self, index: usize) -> u32 {
        self.consecutive_failures.get(&index).copied().unwrap_or(0)
    }

    /// One-paragraph environment status for prompts; empty when nothing is known.
    pub fn environment_status(&self) -> String {
        let mut lines = Vec::new();
        if let Some(env) = &self.active_env {
            lines.push(format!("active environment: {env}"));
        }
        if !self.installed_packages.is_empty() {
            lines.push(format!(
                "installed packages: {}",
                self.installed_packages.join(", ")
            ));
        }
        if !self.environment_history.is_empty() {
            lines.push(format!(
                "environment history: {}",
                self.environment_history.join(" -> ")
            ));
        }
        if !self.repl_variables.is_empty() {
            let names: Vec<&str> = self.repl_variables.keys().map(String::as_str).collect();
            lines.push(format!("saved variables: {}", names.join(", ")));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn working_memory_evicts_oldest_beyond_capacity() {
        let mut session = SessionState::default();
        for idx in 0..12 {
            session.remember(format!("finding {idx}"));
        }
        assert_eq!(session.working_memory_len(), 10);
        let first = session.working_memory().next().expect("entry");
        assert_eq!(first, "finding 2");
    }

    #[test]
    fn save_variable_parses_json_or_keeps_raw() {
        let mut session = SessionState::default();
        session.save_variable("files", r#"["a.rs", "b.rs"]"#);
        session.save_variable("greeting", "hello there");

        assert_eq!(session.repl_variables["files"], json!(["a.rs", "b.rs"]));
        assert_eq!(session.repl_variables["greeting"], json!("hello there"));
    }

    #[test]
    fn begin_objective_clears_failure_state_only() {
        let mut session = SessionState::default();
        session
            .failure_memory
            .record_failure("list_files", &json!({}), "boom");
        session.record_index_failure(0);
        session.save_variable("kept", "1");
        session.remember("kept too");

        session.begin_objective();

        assert!(session.failure_memory.is_empty());
        assert_eq!(session.index_failures(0), 0);
        assert!(session.repl_variables.contains_key("kept"));
        assert_eq!(session.working_memory_len(), 1);
    }

    #[test]
    fn index_failures_count_per_position() {
        let mut session = SessionState::default();
        assert_eq!(session.record_index_failure(2), 1);
        assert_eq!(session.record_index_failure(2), 2);
        assert_eq!(session.record_index_failure(3), 1);
        session.reset_index_failures(2);
        assert_eq!(session.index_failures(2), 0);
    }
}
