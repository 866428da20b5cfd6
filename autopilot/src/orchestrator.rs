//! Conversation-level driver: owns the live plan and session state and routes
//! each user message to planning, replanning or resumption.

use std::fmt;

use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::architect::{ArchitectOutcome, ArchitectRequest, augmented_objective, run_architect};
use crate::cancel::is_cancelled;
use crate::core::plan::Plan;
use crate::core::session::SessionState;
use crate::core::types::TaskStatus;
use crate::engine::{Engine, EngineEvent};
use crate::execute::{ExecutionOutcome, execute_plan};
use crate::io::llm::ChatMessage;
use crate::replan::replan;

/// Final state of one `handle_message` or `resume` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { failed: usize },
    PlanFailed { reason: String },
    GaveUp { task_id: u64, failures: u32 },
    Stopped { task_id: u64 },
    Cancelled,
}

impl From<ExecutionOutcome> for RunOutcome {
    fn from(outcome: ExecutionOutcome) -> Self {
        match outcome {
            ExecutionOutcome::Completed { failed } => RunOutcome::Completed { failed },
            ExecutionOutcome::GaveUp { task_id, failures } => {
                RunOutcome::GaveUp { task_id, failures }
            }
            ExecutionOutcome::Stopped { task_id } => RunOutcome::Stopped { task_id },
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed { failed: 0 } => write!(f, "plan completed"),
            RunOutcome::Completed { failed } => {
                write!(f, "plan completed with {failed} skipped failure(s)")
            }
            RunOutcome::PlanFailed { reason } => write!(f, "planning failed: {reason}"),
            RunOutcome::GaveUp { task_id, failures } => write!(
                f,
                "gave up after {failures} consecutive failures (task #{task_id})"
            ),
            RunOutcome::Stopped { task_id } => write!(f, "stopped by user at task #{task_id}"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

pub struct Orchestrator {
    engine: Engine,
    session: SessionState,
    plan: Option<Plan>,
    history: Vec<ChatMessage>,
}

impl Orchestrator {
    pub fn new(engine: Engine) -> Self {
        let session = SessionState::new(engine.config.working_memory_capacity);
        Self {
            engine,
            session,
            plan: None,
            history: Vec::new(),
        }
    }

    /// Orchestrator picking up the plan saved in the workspace, if any.
    pub fn load(engine: Engine) -> Result<Self> {
        let plan = engine.store.load()?;
        let mut orchestrator = Self::new(engine);
        orchestrator.plan = plan;
        Ok(orchestrator)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Handle one user message.
    ///
    /// With a live plan that still has work, the message is a replan
    /// instruction. Otherwise it starts a new objective.
    #[instrument(skip_all)]
    pub async fn handle_message(&mut self, text: &str, cancel: &CancellationToken) -> Result<RunOutcome> {
        let text = text.trim();
        if text.is_empty() {
            bail!("message is empty");
        }
        let result = match self.plan.take() {
            Some(plan) if plan.has_pending_work() => self.continue_with_instruction(plan, text, cancel).await,
            _ => self.start_objective(text, cancel).await,
        };
        self.history.push(ChatMessage::user(text));
        let outcome = self.settle(result)?;
        self.history.push(ChatMessage::assistant(outcome.to_string()));
        Ok(outcome)
    }

    /// Continue the persisted plan. Tasks interrupted by a cancellation are
    /// run again.
    #[instrument(skip_all)]
    pub async fn resume(&mut self, cancel: &CancellationToken) -> Result<RunOutcome> {
        let Some(mut plan) = self.plan.take() else {
            bail!("no saved plan to resume");
        };
        let mut reset = 0;
        for task in &mut plan.tasks {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Pending;
                reset += 1;
            }
        }
        if reset > 0 {
            info!(reset, "re-queued interrupted tasks");
            plan.note(format!("Resumed; {reset} interrupted task(s) re-queued."));
        }
        self.engine.persist(&plan);
        self.plan = Some(plan);
        let result = self.execute_live(cancel).await;
        self.settle(result)
    }

    async fn start_objective(&mut self, objective: &str, cancel: &CancellationToken) -> Result<RunOutcome> {
        self.session.begin_objective();
        let request = ArchitectRequest {
            system: self.engine.architect_system_prompt()?,
            history: self.history.clone(),
            prompt: augmented_objective(&self.engine, &self.session, objective)?,
        };

        let outcome = run_architect(&self.engine, &mut self.session, None, request, cancel).await?;
        let (draft, investigation) = match outcome {
            ArchitectOutcome::Planned {
                draft,
                investigation,
            } => (draft, investigation),
            ArchitectOutcome::Failed { reason, .. } => {
                self.engine.emit(EngineEvent::PlanFailed {
                    reason: reason.clone(),
                });
                return Ok(RunOutcome::PlanFailed { reason });
            }
        };

        let mut plan = match Plan::initialize(objective, draft.tasks, &self.engine.enabled_tools()) {
            Ok(plan) => plan,
            Err(problems) => {
                let reason = format!("plan rejected: {}", problems.join(", "));
                self.engine.emit(EngineEvent::PlanFailed {
                    reason: reason.clone(),
                });
                return Ok(RunOutcome::PlanFailed { reason });
            }
        };
        plan.investigation = investigation;
        if let Some(note) = draft.scratchpad.as_deref().filter(|n| !n.trim().is_empty()) {
            plan.note(note.trim());
        }
        self.engine.persist(&plan);
        self.engine.emit(EngineEvent::PlanReady {
            tasks: plan.tasks.len(),
        });
        self.plan = Some(plan);
        self.execute_live(cancel).await
    }

    async fn continue_with_instruction(
        &mut self,
        mut plan: Plan,
        instruction: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        for task in &mut plan.tasks {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Pending;
            }
        }
        // Keep everything before the first task that has not run.
        let after = plan.first_pending_index().and_then(|idx| idx.checked_sub(1));
        let result = replan(&self.engine, &mut self.session, &mut plan, after, instruction, cancel).await;
        self.plan = Some(plan);
        if !result? {
            warn!("replan produced no fragment, continuing with the existing plan");
        }
        self.execute_live(cancel).await
    }

    async fn execute_live(&mut self, cancel: &CancellationToken) -> Result<RunOutcome> {
        let Some(plan) = self.plan.as_mut() else {
            bail!("no live plan");
        };
        let outcome = execute_plan(&self.engine, &mut self.session, plan, 0, cancel).await?;
        self.engine.persist(plan);
        Ok(outcome.into())
    }

    /// Map cancellation to [`RunOutcome::Cancelled`] after saving the plan.
    fn settle(&mut self, result: Result<RunOutcome>) -> Result<RunOutcome> {
        match result {
            Ok(outcome) => {
                info!(%outcome, "run finished");
                Ok(outcome)
            }
            Err(err) if is_cancelled(&err) => {
                if let Some(plan) = &self.plan {
                    self.engine.persist(plan);
                }
                info!("run cancelled");
                Ok(RunOutcome::Cancelled)
            }
            Err(err) => Err(err),
        }
    }
}
