//! Post-task review: continue on the current plan or replan.

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::cancel::is_cancelled;
use crate::core::plan::Plan;
use crate::core::response::{SupervisorDecision, parse_supervisor_decision};
use crate::core::types::Task;
use crate::engine::Engine;
use crate::io::llm::ChatMessage;
use crate::io::prompt::SupervisorInputs;

const PLAN_SUMMARY_TASKS: usize = 30;

/// Ask the supervisor about one task's output.
///
/// Never fails except on cancellation: any other problem yields
/// [`SupervisorDecision::fallback`], which continues.
#[instrument(skip_all, fields(task_id = task.id, action = %task.action))]
pub async fn review_task(
    engine: &Engine,
    plan: &Plan,
    task: &Task,
    output: &str,
    cancel: &CancellationToken,
) -> Result<SupervisorDecision> {
    let summary = plan.summary(PLAN_SUMMARY_TASKS);
    let prompt = match engine.prompts.supervisor(&SupervisorInputs {
        objective: &plan.objective,
        plan_summary: &summary,
        task,
        output,
    }) {
        Ok(prompt) => prompt,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "failed to render supervisor prompt");
            return Ok(SupervisorDecision::fallback("supervisor prompt unavailable"));
        }
    };

    let model = engine.config.llm.supervisor_model.as_deref();
    let reply = match engine
        .llm
        .chat(&[ChatMessage::user(prompt)], model, cancel)
        .await
    {
        Ok(reply) => reply,
        Err(err) if is_cancelled(&err) => return Err(err),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "supervisor call failed, continuing");
            return Ok(SupervisorDecision::fallback(format!(
                "supervisor unavailable: {err:#}"
            )));
        }
    };

    let decision = parse_supervisor_decision(&reply).unwrap_or_else(|| {
        debug!("unparseable supervisor reply");
        SupervisorDecision::fallback("supervisor reply could not be parsed")
    });
    debug!(decision = ?decision.decision, reasoning = %decision.reasoning, "supervisor verdict");
    Ok(decision)
}
