//! Plan revision: archive the live plan, ask the architect for a fragment and
//! splice it in.
//!
//! Two flavours share the machinery. A failure revision replaces the failed
//! task and everything after it; an instruction replan keeps everything up to
//! the current task and replaces the rest.

use anyhow::Result;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::architect::{ArchitectOutcome, ArchitectRequest, augmented_objective, run_architect};
use crate::core::plan::Plan;
use crate::core::session::SessionState;
use crate::core::types::TaskDraft;
use crate::engine::{Engine, EngineEvent};
use crate::io::prompt::{FixTaskInputs, ReplanInputs};

const PLAN_SUMMARY_TASKS: usize = 50;

/// Revise the plan after the task at `index` failed with `error`.
///
/// Returns `true` when a fragment was spliced in at `index`.
#[instrument(skip_all, fields(index))]
pub async fn revise_plan_for_failure(
    engine: &Engine,
    session: &mut SessionState,
    plan: &mut Plan,
    index: usize,
    parameters: &Map<String, Value>,
    error: &str,
    cancel: &CancellationToken,
) -> Result<bool> {
    let Some(failed) = plan.tasks.get(index) else {
        warn!(index, "no task to revise");
        return Ok(false);
    };
    let reason = format!(
        "task #{} (`{}`) failed: {}",
        failed.id,
        failed.action,
        error.lines().next().unwrap_or_default()
    );
    plan.archive(&reason);
    let retries = {
        let task = &mut plan.tasks[index];
        task.retries += 1;
        task.retries
    };
    engine.emit(EngineEvent::Revising {
        task_id: plan.tasks[index].id,
        retries,
    });

    let summary = plan.summary(PLAN_SUMMARY_TASKS);
    let failures = session.failure_memory.memory_context();
    let revision = engine.prompts.fix_task(&FixTaskInputs {
        task: &plan.tasks[index],
        parameters,
        error,
        plan_summary: &summary,
        failures: &failures,
        first_new_id: plan.next_task_id,
    });

    match request_fragment(engine, session, plan, revision, cancel).await? {
        Some(tasks) => {
            let count = tasks.len();
            plan.replace_from(index, tasks, retries);
            plan.note(format!("Revised after {reason}; {count} replacement task(s)."));
            engine.persist(plan);
            info!(count, retries, "plan revised");
            Ok(true)
        }
        None => {
            plan.note(format!("Revision failed after {reason}."));
            engine.persist(plan);
            Ok(false)
        }
    }
}

/// Fold `instruction` into the remaining work, keeping tasks up to and
/// including `after` (`None` replaces every task).
#[instrument(skip_all, fields(after))]
pub async fn replan(
    engine: &Engine,
    session: &mut SessionState,
    plan: &mut Plan,
    after: Option<usize>,
    instruction: &str,
    cancel: &CancellationToken,
) -> Result<bool> {
    let reason = format!("replan: {}", instruction.trim());
    plan.archive(&reason);
    engine.emit(EngineEvent::Replanning {
        reason: instruction.trim().to_string(),
    });

    let summary = plan.summary(PLAN_SUMMARY_TASKS);
    let failures = session.failure_memory.memory_context();
    let revision = engine.prompts.replan(&ReplanInputs {
        instruction,
        current: after.and_then(|idx| plan.tasks.get(idx)),
        plan_summary: &summary,
        failures: &failures,
        first_new_id: plan.next_task_id,
    });

    match request_fragment(engine, session, plan, revision, cancel).await? {
        Some(tasks) => {
            let count = tasks.len();
            match after {
                Some(idx) => plan.replace_after(idx, tasks),
                None => plan.replace_from(0, tasks, 0),
            }
            plan.note(format!("Replanned ({count} new task(s)): {}", instruction.trim()));
            engine.persist(plan);
            Ok(true)
        }
        None => {
            plan.note(format!("Replan failed: {}", instruction.trim()));
            engine.persist(plan);
            Ok(false)
        }
    }
}

/// Run the architect on a revision prompt. `None` means no usable fragment.
async fn request_fragment(
    engine: &Engine,
    session: &mut SessionState,
    plan: &mut Plan,
    revision: Result<String>,
    cancel: &CancellationToken,
) -> Result<Option<Vec<TaskDraft>>> {
    let request = revision.and_then(|revision| {
        let objective = augmented_objective(engine, session, &plan.objective)?;
        Ok(ArchitectRequest {
            system: engine.architect_system_prompt()?,
            history: Vec::new(),
            prompt: format!("{objective}\n\n{revision}"),
        })
    });
    let request = match request {
        Ok(request) => request,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "failed to build revision prompt");
            return Ok(None);
        }
    };

    match run_architect(engine, session, Some(&*plan), request, cancel).await? {
        ArchitectOutcome::Planned {
            draft,
            investigation,
        } => {
            plan.investigation.extend(investigation);
            if let Some(note) = draft.scratchpad.as_deref().filter(|n| !n.trim().is_empty()) {
                plan.note(note.trim());
            }
            Ok(Some(draft.tasks))
        }
        ArchitectOutcome::Failed {
            reason,
            investigation,
        } => {
            warn!(%reason, "architect could not produce a fragment");
            plan.investigation.extend(investigation);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{PlanStatus, TaskStatus};
    use crate::io::config::AutopilotConfig;
    use crate::test_support::{ScriptedInteraction, ScriptedLlm, ScriptedTool, plan_with_actions};
    use crate::tools::ToolRegistry;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn engine(dir: &TempDir, llm: &ScriptedLlm, actions: &[&str]) -> Engine {
        let mut registry = ToolRegistry::new();
        for action in actions {
            registry.register(Arc::new(ScriptedTool::succeeding(action, "ok")));
        }
        Engine::new(
            dir.path(),
            AutopilotConfig::default(),
            Arc::new(llm.clone()),
            Arc::new(ScriptedInteraction::default()),
            registry,
        )
    }

    fn fragment(actions: &[&str]) -> String {
        let tasks: Vec<String> = actions
            .iter()
            .map(|a| format!("{{\"action\": \"{a}\", \"description\": \"{a} again\"}}"))
            .collect();
        format!("```json\n{{\"tasks\": [{}]}}\n```", tasks.join(", "))
    }

    #[tokio::test]
    async fn failure_revision_replaces_failed_task_and_tail() {
        let dir = TempDir::new().expect("tempdir");
        let llm = ScriptedLlm::new([fragment(&["b", "c"])]);
        let engine = engine(&dir, &llm, &["a", "b", "c"]);
        let mut plan = plan_with_actions(&["a", "b", "c"]);
        plan.tasks[0].status = TaskStatus::Completed;
        plan.tasks[0].result = Some("done".to_string());
        plan.tasks[1].status = TaskStatus::Failed;
        plan.tasks[1].result = Some("boom".to_string());

        let revised = revise_plan_for_failure(
            &engine,
            &mut SessionState::default(),
            &mut plan,
            1,
            &Map::new(),
            "boom",
            &CancellationToken::new(),
        )
        .await
        .expect("revise");
        assert!(revised);

        let ids: Vec<u64> = plan.tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 4, 5]);
        assert_eq!(plan.tasks[1].retries, 1);
        assert_eq!(plan.tasks[1].status, TaskStatus::Pending);
        assert_eq!(plan.tasks[2].retries, 0);

        assert_eq!(plan.attempts.len(), 1);
        let archived = &plan.attempts[0];
        assert_eq!(archived.status, PlanStatus::Stale);
        assert_eq!(archived.tasks[1].result.as_deref(), Some("boom"));
        assert!(archived.scratchpad.contains("task #2 (`b`) failed: boom"));

        let calls = llm.calls();
        let prompt = &calls[0].last().expect("prompt").content;
        assert!(prompt.contains("New task ids start at 4"));
        assert!(engine.store.exists());
    }

    #[tokio::test]
    async fn failed_revision_leaves_tasks_but_keeps_the_archive() {
        let dir = TempDir::new().expect("tempdir");
        let llm = ScriptedLlm::default();
        let engine = engine(&dir, &llm, &["a"]);
        let mut plan = plan_with_actions(&["a"]);
        plan.tasks[0].status = TaskStatus::Failed;

        let revised = revise_plan_for_failure(
            &engine,
            &mut SessionState::default(),
            &mut plan,
            0,
            &Map::new(),
            "boom",
            &CancellationToken::new(),
        )
        .await
        .expect("revise");
        assert!(!revised);
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].retries, 1);
        assert_eq!(plan.attempts.len(), 1);
        assert!(plan.scratchpad.contains("Revision failed"));
    }

    #[tokio::test]
    async fn replan_keeps_work_up_to_the_current_task() {
        let dir = TempDir::new().expect("tempdir");
        let llm = ScriptedLlm::new([fragment(&["c"])]);
        let engine = engine(&dir, &llm, &["a", "b", "c"]);
        let mut plan = plan_with_actions(&["a", "b", "b"]);
        plan.tasks[0].status = TaskStatus::Completed;
        plan.tasks[1].status = TaskStatus::Completed;

        let replanned = replan(
            &engine,
            &mut SessionState::default(),
            &mut plan,
            Some(1),
            "use c for the rest",
            &CancellationToken::new(),
        )
        .await
        .expect("replan");
        assert!(replanned);
        let actions: Vec<&str> = plan.tasks.iter().map(|t| t.action.as_str()).collect();
        assert_eq!(actions, vec!["a", "b", "c"]);
        assert_eq!(plan.tasks[2].id, 4);

        let calls = llm.calls();
        let prompt = &calls[0].last().expect("prompt").content;
        assert!(prompt.contains("Task #2 and everything before it are kept"));
        assert!(prompt.contains("use c for the rest"));
    }
}
