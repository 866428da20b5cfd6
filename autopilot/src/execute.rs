//! Plan execution loop.
//!
//! Tasks run strictly one at a time in list order. A failure is recorded in
//! failure memory and counted against its list position; the third
//! consecutive failure at one position halts the loop outright. Below that,
//! the plan is revised while the task's retry budget lasts, and the user
//! decides once it is spent.

use std::time::Instant;

use anyhow::Result;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cancel::{ensure_active, is_cancelled};
use crate::core::plan::Plan;
use crate::core::resolver::resolve_parameters;
use crate::core::response::Decision;
use crate::core::session::SessionState;
use crate::core::types::{Task, TaskStatus, ToolOutcome};
use crate::engine::{Engine, EngineEvent};
use crate::io::interaction::UserDecision;
use crate::io::run_log::RunPhase;
use crate::replan::{replan, revise_plan_for_failure};
use crate::supervisor::review_task;

/// How an execution pass ended. Cancellation is reported as `Err(Cancelled)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// No pending task is left. `failed` counts tasks the user skipped.
    Completed { failed: usize },
    /// Hard stop after too many consecutive failures at one position.
    GaveUp { task_id: u64, failures: u32 },
    /// The user chose Stop on a terminal failure.
    Stopped { task_id: u64 },
}

enum FailureVerdict {
    /// Re-run the same index (the plan was revised).
    Retry,
    /// Move past the failed task.
    Skip,
    Halt(ExecutionOutcome),
}

/// Execute pending tasks from `start` onwards.
#[instrument(skip_all, fields(start))]
pub async fn execute_plan(
    engine: &Engine,
    session: &mut SessionState,
    plan: &mut Plan,
    start: usize,
    cancel: &CancellationToken,
) -> Result<ExecutionOutcome> {
    let mut index = start;
    while index < plan.tasks.len() {
        ensure_active(cancel)?;
        if plan.tasks[index].status != TaskStatus::Pending {
            index += 1;
            continue;
        }
        let task = plan.tasks[index].clone();

        if engine.config.checkpoint_actions.contains(&task.action) {
            let committed = engine.git.checkpoint(&format!(
                "autopilot: checkpoint before task #{} ({})",
                task.id, task.action
            ));
            engine.emit(EngineEvent::Checkpoint {
                task_id: task.id,
                committed,
            });
        }

        plan.tasks[index].status = TaskStatus::InProgress;
        engine.persist(plan);
        engine.emit(EngineEvent::TaskStarted {
            task_id: task.id,
            action: task.action.clone(),
            description: task.description.clone(),
        });

        let params = resolve_parameters(&task, Some(&*plan), session)?;
        let outcome = run_task(engine, session, plan, &task, &params, cancel).await?;

        {
            let slot = &mut plan.tasks[index];
            slot.result = Some(outcome.output.clone());
            slot.status = if outcome.success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
        }
        if outcome.success {
            if let Some(name) = &task.save_as {
                session.save_variable(name, &outcome.output);
            }
        }
        engine.persist(plan);
        engine.emit(EngineEvent::TaskFinished {
            task_id: task.id,
            success: outcome.success,
            excerpt: engine.excerpt(&outcome.output),
        });

        if outcome.success {
            on_success(engine, session, plan, index, &task, &outcome.output, cancel).await?;
            index += 1;
            continue;
        }

        match on_failure(engine, session, plan, index, &task, &params, &outcome.output, cancel)
            .await?
        {
            FailureVerdict::Retry => {}
            FailureVerdict::Skip => index += 1,
            FailureVerdict::Halt(outcome) => return Ok(outcome),
        }
    }

    let failed = plan
        .tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Failed)
        .count();
    info!(failed, "execution finished");
    Ok(ExecutionOutcome::Completed { failed })
}

/// Dispatch one task unless the identical call already failed. Only
/// cancellation escapes as `Err`.
async fn run_task(
    engine: &Engine,
    session: &SessionState,
    plan: &Plan,
    task: &Task,
    params: &Map<String, Value>,
    cancel: &CancellationToken,
) -> Result<ToolOutcome> {
    let started = Instant::now();
    let outcome = if session
        .failure_memory
        .has_failed_before(&task.action, &Value::Object(params.clone()))
    {
        debug!(task_id = task.id, "identical call failed before, not dispatching");
        engine.emit(EngineEvent::LoopPrevented {
            task_id: task.id,
            action: task.action.clone(),
        });
        ToolOutcome::failure(format!(
            "Loop prevented: `{}` already failed with these exact parameters. \
             Repeating it will fail again; change the tool, the parameters, or the strategy.",
            task.action
        ))
    } else {
        let env = engine.tool_env(Some(plan), session);
        match engine
            .dispatcher
            .execute_task(&task.action, params, &env, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => ToolOutcome::failure(format!("{err:#}")),
        }
    };
    engine.record_run(
        RunPhase::Task,
        Some(task.id),
        &task.action,
        params,
        &outcome,
        started.elapsed(),
    );
    Ok(outcome)
}

async fn on_success(
    engine: &Engine,
    session: &mut SessionState,
    plan: &mut Plan,
    index: usize,
    task: &Task,
    output: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    session.reset_index_failures(index);
    if output.trim().chars().count() >= engine.config.working_memory_min_output {
        session.remember(format!(
            "task #{} {}: {}",
            task.id,
            task.action,
            engine.excerpt(output)
        ));
    }

    let significant = engine.config.significant_actions.contains(&task.action)
        || engine.dispatcher.requests_user_input(&task.action);
    if !significant {
        return Ok(());
    }
    let decision = review_task(engine, plan, &plan.tasks[index], output, cancel).await?;
    if decision.decision != Decision::Replan {
        return Ok(());
    }
    let instruction = decision
        .new_instruction
        .unwrap_or_else(|| decision.reasoning.clone());
    info!(task_id = task.id, %instruction, "supervisor requested a replan");
    if !replan(engine, session, plan, Some(index), &instruction, cancel).await? {
        warn!("supervisor replan produced no fragment, continuing with the current plan");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn on_failure(
    engine: &Engine,
    session: &mut SessionState,
    plan: &mut Plan,
    index: usize,
    task: &Task,
    params: &Map<String, Value>,
    error: &str,
    cancel: &CancellationToken,
) -> Result<FailureVerdict> {
    session
        .failure_memory
        .record_failure(&task.action, &Value::Object(params.clone()), error);
    let failures = session.record_index_failure(index);

    if failures >= engine.config.max_consecutive_failures {
        warn!(task_id = task.id, failures, "giving up");
        plan.note(format!(
            "Giving up: step {} failed {failures} consecutive times (last task #{}).",
            index + 1,
            task.id
        ));
        engine.persist(plan);
        engine.emit(EngineEvent::GaveUp {
            task_id: task.id,
            failures,
        });
        return Ok(FailureVerdict::Halt(ExecutionOutcome::GaveUp {
            task_id: task.id,
            failures,
        }));
    }

    if plan.tasks[index].retries < engine.config.max_task_retries
        && revise_plan_for_failure(engine, session, plan, index, params, error, cancel).await?
    {
        return Ok(FailureVerdict::Retry);
    }

    plan.tasks[index].can_retry = Some(true);
    engine.persist(plan);
    loop {
        ensure_active(cancel)?;
        let decision = engine
            .interaction
            .decide_on_failure(&plan.tasks[index], error)
            .await?;
        debug!(task_id = task.id, ?decision, "user decision");
        match decision {
            UserDecision::Stop => {
                plan.note(format!("Stopped by user at task #{}.", task.id));
                engine.persist(plan);
                return Ok(FailureVerdict::Halt(ExecutionOutcome::Stopped {
                    task_id: task.id,
                }));
            }
            UserDecision::ContinueAnyway => {
                plan.tasks[index].can_retry = None;
                plan.note(format!("Continued past failed task #{}.", task.id));
                engine.persist(plan);
                return Ok(FailureVerdict::Skip);
            }
            UserDecision::ViewLog => {
                engine.interaction.show(&engine.failure_digest(session)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::AutopilotConfig;
    use crate::test_support::{
        ScriptedInteraction, ScriptedLlm, ScriptedTool, draft_with, plan_with_actions,
    };
    use crate::tools::ToolRegistry;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        llm: ScriptedLlm,
        interaction: ScriptedInteraction,
        config: AutopilotConfig,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                dir: TempDir::new().expect("tempdir"),
                llm: ScriptedLlm::default(),
                interaction: ScriptedInteraction::default(),
                config: AutopilotConfig::default(),
            }
        }

        fn engine(&self, tools: Vec<ScriptedTool>) -> Engine {
            let mut registry = ToolRegistry::new();
            for tool in tools {
                registry.register(Arc::new(tool));
            }
            Engine::new(
                self.dir.path(),
                self.config.clone(),
                Arc::new(self.llm.clone()),
                Arc::new(self.interaction.clone()),
                registry,
            )
        }
    }

    fn plan_from(drafts: Vec<crate::core::types::TaskDraft>) -> Plan {
        let enabled: BTreeSet<String> = drafts.iter().map(|d| d.action.clone()).collect();
        Plan::initialize("objective", drafts, &enabled).expect("plan")
    }

    #[tokio::test]
    async fn runs_tasks_in_order_and_threads_results() {
        let harness = Harness::new();
        let echo = ScriptedTool::echo("echo");
        let calls = echo.calls();
        let engine = harness.engine(vec![ScriptedTool::succeeding("list", "a.txt"), echo]);
        let mut plan = plan_from(vec![
            draft_with("list", json!({})),
            draft_with("echo", json!({"text": "files: {{tasks[1].result}}"})),
        ]);

        let outcome = execute_plan(
            &engine,
            &mut SessionState::default(),
            &mut plan,
            0,
            &CancellationToken::new(),
        )
        .await
        .expect("execute");
        assert_eq!(outcome, ExecutionOutcome::Completed { failed: 0 });
        assert!(plan.tasks.iter().all(|t| t.status == TaskStatus::Completed));
        assert_eq!(
            calls.last().expect("call")["text"],
            json!("files: a.txt")
        );
        assert_eq!(engine.run_log.read_all().expect("log").len(), 2);
    }

    #[tokio::test]
    async fn save_as_stores_parsed_json() {
        let harness = Harness::new();
        let engine = harness.engine(vec![ScriptedTool::succeeding("inspect", "{\"n\": 3}")]);
        let mut draft = draft_with("inspect", json!({}));
        draft.save_as = Some("stats".to_string());
        let mut plan = plan_from(vec![draft]);
        let mut session = SessionState::default();

        execute_plan(&engine, &mut session, &mut plan, 0, &CancellationToken::new())
            .await
            .expect("execute");
        assert_eq!(session.repl_variables["stats"], json!({"n": 3}));
    }

    #[tokio::test]
    async fn exhausted_retries_ask_the_user_and_continue_anyway_skips() {
        let mut harness = Harness::new();
        harness.config.max_task_retries = 0;
        harness.interaction =
            ScriptedInteraction::new([UserDecision::ViewLog, UserDecision::ContinueAnyway]);
        let after = ScriptedTool::succeeding("after", "fine");
        let after_calls = after.calls();
        let engine = harness.engine(vec![ScriptedTool::failing("broken", "exit 1"), after]);
        let mut plan = plan_with_actions(&["broken", "after"]);

        let outcome = execute_plan(
            &engine,
            &mut SessionState::default(),
            &mut plan,
            0,
            &CancellationToken::new(),
        )
        .await
        .expect("execute");
        assert_eq!(outcome, ExecutionOutcome::Completed { failed: 1 });
        assert_eq!(plan.tasks[0].status, TaskStatus::Failed);
        assert_eq!(after_calls.count(), 1);
        assert_eq!(harness.interaction.failure_prompts().len(), 2);
        assert!(harness.interaction.shown()[0].contains("broken"));
    }

    #[tokio::test]
    async fn stop_halts_and_marks_task_retryable() {
        let mut harness = Harness::new();
        harness.config.max_task_retries = 0;
        let engine = harness.engine(vec![
            ScriptedTool::failing("broken", "exit 1"),
            ScriptedTool::succeeding("after", "fine"),
        ]);
        let mut plan = plan_with_actions(&["broken", "after"]);

        let outcome = execute_plan(
            &engine,
            &mut SessionState::default(),
            &mut plan,
            0,
            &CancellationToken::new(),
        )
        .await
        .expect("execute");
        assert_eq!(outcome, ExecutionOutcome::Stopped { task_id: 1 });
        assert_eq!(plan.tasks[0].can_retry, Some(true));
        assert_eq!(plan.tasks[1].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn failure_triggers_revision_at_the_same_index() {
        let harness = Harness::new();
        harness.llm.push_reply(
            "```json\n{\"tasks\": [{\"action\": \"good\", \"description\": \"other way\"}]}\n```",
        );
        let good = ScriptedTool::succeeding("good", "worked");
        let good_calls = good.calls();
        let engine = harness.engine(vec![ScriptedTool::failing("bad", "nope"), good]);
        let mut plan = plan_with_actions(&["bad"]);

        let outcome = execute_plan(
            &engine,
            &mut SessionState::default(),
            &mut plan,
            0,
            &CancellationToken::new(),
        )
        .await
        .expect("execute");
        assert_eq!(outcome, ExecutionOutcome::Completed { failed: 0 });
        assert_eq!(good_calls.count(), 1);
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].id, 2);
        assert_eq!(plan.tasks[0].retries, 1);
        assert_eq!(plan.attempts.len(), 1);
        assert_eq!(plan.attempts[0].tasks[0].status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn supervisor_replan_splices_after_current_task() {
        let mut harness = Harness::new();
        harness.config.significant_actions = ["fetch".to_string()].into_iter().collect();
        harness.llm.push_reply(
            "```json\n{\"decision\": \"replan\", \"reasoning\": \"page moved\", \"new_instruction\": \"read the mirror\"}\n```",
        );
        harness.llm.push_reply(
            "```json\n{\"tasks\": [{\"action\": \"read\", \"description\": \"mirror\"}]}\n```",
        );
        let engine = harness.engine(vec![
            ScriptedTool::succeeding("fetch", "moved to mirror"),
            ScriptedTool::succeeding("read", "content"),
        ]);
        let mut plan = plan_with_actions(&["fetch", "fetch"]);

        let outcome = execute_plan(
            &engine,
            &mut SessionState::default(),
            &mut plan,
            0,
            &CancellationToken::new(),
        )
        .await
        .expect("execute");
        assert_eq!(outcome, ExecutionOutcome::Completed { failed: 0 });
        let actions: Vec<&str> = plan.tasks.iter().map(|t| t.action.as_str()).collect();
        assert_eq!(actions, vec!["fetch", "read"]);
        assert_eq!(plan.attempts.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_leaves_task_in_progress() {
        let harness = Harness::new();
        let engine = harness.engine(vec![ScriptedTool::erroring("slow", || {
            crate::cancel::Cancelled.into()
        })]);
        let mut plan = plan_with_actions(&["slow"]);

        let err = execute_plan(
            &engine,
            &mut SessionState::default(),
            &mut plan,
            0,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(is_cancelled(&err));
        assert_eq!(plan.tasks[0].status, TaskStatus::InProgress);
        assert_eq!(plan.tasks[0].result, None);
    }
}
