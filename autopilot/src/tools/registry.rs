//! Name-keyed tool lookup with stable ordering.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::io::prompt::ToolSummary;

use super::{Permissions, Tool};

/// Registered tools in registration order.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if !self.tools.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tools the permission gate would let run.
    pub fn enabled(&self, permissions: &Permissions) -> Vec<Arc<dyn Tool>> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .filter(|tool| permissions.allows(tool.permission_group()))
            .cloned()
            .collect()
    }

    pub fn enabled_names(&self, permissions: &Permissions) -> BTreeSet<String> {
        self.enabled(permissions)
            .iter()
            .map(|tool| tool.name().to_string())
            .collect()
    }

    /// Descriptions of enabled tools for the architect prompt.
    pub fn summaries(&self, permissions: &Permissions) -> Vec<ToolSummary> {
        self.enabled(permissions)
            .iter()
            .map(|tool| ToolSummary {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters().to_string(),
                permission_group: tool.permission_group().map(|g| g.as_str().to_string()),
            })
            .collect()
    }
}
