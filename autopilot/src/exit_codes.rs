//! Stable exit codes for autopilot CLI commands.

use crate::orchestrator::RunOutcome;

/// Command succeeded; for `run`/`resume` the plan completed.
pub const OK: i32 = 0;
/// Invalid config, workspace or arguments, or any other error.
pub const INVALID: i32 = 1;
/// The architect produced no valid plan.
pub const PLAN_FAILED: i32 = 2;
/// Hard stop after repeated failures at the same step.
pub const GAVE_UP: i32 = 3;
/// The user chose to stop on a failed task.
pub const STOPPED: i32 = 4;
/// Interrupted with Ctrl-C.
pub const CANCELLED: i32 = 130;

/// Exit code for a finished run.
pub fn for_outcome(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Completed { .. } => OK,
        RunOutcome::PlanFailed { .. } => PLAN_FAILED,
        RunOutcome::GaveUp { .. } => GAVE_UP,
        RunOutcome::Stopped { .. } => STOPPED,
        RunOutcome::Cancelled => CANCELLED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_to_distinct_codes() {
        let codes = [
            for_outcome(&RunOutcome::Completed { failed: 1 }),
            for_outcome(&RunOutcome::PlanFailed {
                reason: "x".to_string(),
            }),
            for_outcome(&RunOutcome::GaveUp {
                task_id: 1,
                failures: 3,
            }),
            for_outcome(&RunOutcome::Stopped { task_id: 1 }),
            for_outcome(&RunOutcome::Cancelled),
        ];
        assert_eq!(codes, [OK, PLAN_FAILED, GAVE_UP, STOPPED, CANCELLED]);
    }
}
