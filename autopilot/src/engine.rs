//! Collaborators shared by the architect, execution and replan loops.
//!
//! [`Engine`] is immutable during a run. Mutable state (the live plan and the
//! session) is owned by the orchestrator and passed in by reference, so the
//! loops can borrow both at once without interior mutability.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::warn;

use crate::core::plan::Plan;
use crate::core::session::SessionState;
use crate::core::types::{ToolOutcome, truncate_chars};
use crate::io::StatePaths;
use crate::io::config::AutopilotConfig;
use crate::io::git::Git;
use crate::io::interaction::Interaction;
use crate::io::llm::LlmClient;
use crate::io::plan_store::PlanStore;
use crate::io::prompt::PromptBuilder;
use crate::io::run_log::{RunEntry, RunLog, RunPhase, render_entries};
use crate::tools::{Dispatcher, Permissions, ToolEnv, ToolRegistry, builtin_registry};

/// Progress notifications for whatever renders the run.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Investigating { iteration: u32, tool: String },
    InvestigationBlocked { tool: String },
    PlanReady { tasks: usize },
    PlanFailed { reason: String },
    Checkpoint { task_id: u64, committed: bool },
    TaskStarted { task_id: u64, action: String, description: String },
    LoopPrevented { task_id: u64, action: String },
    TaskFinished { task_id: u64, success: bool, excerpt: String },
    Revising { task_id: u64, retries: u32 },
    Replanning { reason: String },
    GaveUp { task_id: u64, failures: u32 },
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::Investigating { iteration, tool } => {
                write!(f, "[architect {iteration}] investigating with `{tool}`")
            }
            EngineEvent::InvestigationBlocked { tool } => {
                write!(f, "[architect] refused to repeat failed call to `{tool}`")
            }
            EngineEvent::PlanReady { tasks } => write!(f, "plan ready: {tasks} task(s)"),
            EngineEvent::PlanFailed { reason } => write!(f, "planning failed: {reason}"),
            EngineEvent::Checkpoint { task_id, committed } => {
                if *committed {
                    write!(f, "checkpoint committed before task #{task_id}")
                } else {
                    write!(f, "no checkpoint needed before task #{task_id}")
                }
            }
            EngineEvent::TaskStarted {
                task_id,
                action,
                description,
            } => write!(f, "task #{task_id} `{action}`: {description}"),
            EngineEvent::LoopPrevented { task_id, action } => {
                write!(f, "task #{task_id}: `{action}` already failed with these parameters")
            }
            EngineEvent::TaskFinished {
                task_id,
                success,
                excerpt,
            } => {
                let marker = if *success { "ok" } else { "FAILED" };
                write!(f, "task #{task_id} {marker}")?;
                if !excerpt.is_empty() {
                    write!(f, ": {excerpt}")?;
                }
                Ok(())
            }
            EngineEvent::Revising { task_id, retries } => {
                write!(f, "revising plan for task #{task_id} (retry {retries})")
            }
            EngineEvent::Replanning { reason } => write!(f, "replanning: {reason}"),
            EngineEvent::GaveUp { task_id, failures } => write!(
                f,
                "giving up: task #{task_id} failed {failures} times in a row at the same step"
            ),
        }
    }
}

pub type EventSink = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Everything the loops need besides the plan and the session.
pub struct Engine {
    pub config: AutopilotConfig,
    pub workspace: PathBuf,
    pub llm: Arc<dyn LlmClient>,
    pub interaction: Arc<dyn Interaction>,
    pub dispatcher: Dispatcher,
    pub prompts: PromptBuilder,
    pub store: PlanStore,
    pub run_log: RunLog,
    pub git: Git,
    events: EventSink,
}

impl Engine {
    /// Engine with an explicit tool registry; state files live under
    /// `<workspace>/.autopilot/`.
    pub fn new(
        workspace: impl Into<PathBuf>,
        config: AutopilotConfig,
        llm: Arc<dyn LlmClient>,
        interaction: Arc<dyn Interaction>,
        registry: ToolRegistry,
    ) -> Self {
        let workspace = workspace.into();
        let paths = StatePaths::new(&workspace);
        let permissions = Permissions::from_config(&config.permissions);
        Self {
            prompts: PromptBuilder::new(config.prompt_budget_bytes, config.excerpt_chars),
            dispatcher: Dispatcher::new(registry, permissions),
            store: PlanStore::new(paths.plan),
            run_log: RunLog::new(paths.run_log),
            git: Git::new(workspace.clone()),
            config,
            workspace,
            llm,
            interaction,
            events: Arc::new(|_| {}),
        }
    }

    /// Engine with every built-in tool registered.
    pub fn with_builtin_tools(
        workspace: impl Into<PathBuf>,
        config: AutopilotConfig,
        llm: Arc<dyn LlmClient>,
        interaction: Arc<dyn Interaction>,
    ) -> Result<Self> {
        Ok(Self::new(
            workspace,
            config,
            llm,
            interaction,
            builtin_registry()?,
        ))
    }

    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.events = sink;
        self
    }

    pub fn emit(&self, event: EngineEvent) {
        (self.events)(&event);
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Names of tools the permission gate lets run.
    pub fn enabled_tools(&self) -> BTreeSet<String> {
        self.dispatcher
            .registry()
            .enabled_names(self.dispatcher.permissions())
    }

    pub fn architect_system_prompt(&self) -> Result<String> {
        let tools = self
            .dispatcher
            .registry()
            .summaries(self.dispatcher.permissions());
        self.prompts.architect_system(&tools)
    }

    pub fn tool_env<'a>(&'a self, plan: Option<&'a Plan>, session: &'a SessionState) -> ToolEnv<'a> {
        ToolEnv {
            workspace: &self.workspace,
            llm: self.llm.as_ref(),
            interaction: self.interaction.as_ref(),
            plan,
            variables: &session.repl_variables,
            shell: &self.config.shell,
        }
    }

    /// Save the plan. Failures are logged, never returned.
    pub fn persist(&self, plan: &Plan) {
        if let Err(err) = self.store.save(plan) {
            warn!(err = %format!("{err:#}"), "failed to persist plan, continuing in memory");
        }
    }

    /// Append a run-log entry. Failures are logged, never returned.
    pub fn record_run(
        &self,
        phase: RunPhase,
        task_id: Option<u64>,
        action: &str,
        parameters: &Map<String, Value>,
        outcome: &ToolOutcome,
        elapsed: Duration,
    ) {
        let entry = RunEntry {
            timestamp: Utc::now(),
            phase,
            task_id,
            action: action.to_string(),
            parameters: parameters.clone(),
            success: outcome.success,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            output: truncate_chars(&outcome.output, self.config.excerpt_chars * 4),
        };
        if let Err(err) = self.run_log.append(&entry) {
            warn!(err = %format!("{err:#}"), "failed to append run log");
        }
    }

    /// Recent failures from the run log plus the failure-memory digest, for
    /// the "View Log" choice.
    pub fn failure_digest(&self, session: &SessionState) -> String {
        let mut parts = Vec::new();
        match self.run_log.tail(10, true) {
            Ok(entries) if !entries.is_empty() => {
                parts.push(format!("Recent failures:\n{}", render_entries(&entries)));
            }
            Ok(_) => parts.push("Run log has no failures recorded.".to_string()),
            Err(err) => parts.push(format!("Run log unavailable: {err:#}")),
        }
        let memory = session.failure_memory.memory_context();
        if !memory.is_empty() {
            parts.push(memory);
        }
        parts.join("\n\n")
    }

    /// Excerpt of `output` sized for events and working memory.
    pub fn excerpt(&self, output: &str) -> String {
        truncate_chars(output.trim(), self.config.excerpt_chars)
    }
}
