//! Semantic invariants for persisted plans.

use std::collections::HashSet;

use crate::core::plan::Plan;
use crate::core::types::PlanStatus;

/// Check invariants that serde alone cannot express:
/// - No duplicate task ids
/// - Ids strictly ascending in list order
/// - Every id below `next_task_id`
/// - Archived attempts are tagged `stale`
pub fn validate_plan_invariants(plan: &Plan) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for task in &plan.tasks {
        if !seen.insert(task.id) {
            errors.push(format!("duplicate task id {}", task.id));
        }
        if task.id >= plan.next_task_id {
            errors.push(format!(
                "task id {} is not below next_task_id {}",
                task.id, plan.next_task_id
            ));
        }
    }

    if !ids_ascending(plan) {
        errors.push("task ids must be strictly ascending".to_string());
    }

    if plan.status != PlanStatus::Live {
        errors.push("top-level plan must be live".to_string());
    }

    for (idx, attempt) in plan.attempts.iter().enumerate() {
        if attempt.status != PlanStatus::Stale {
            errors.push(format!("attempt {idx} must be stale"));
        }
    }

    errors
}

fn ids_ascending(plan: &Plan) -> bool {
    plan.tasks.windows(2).all(|pair| pair[0].id < pair[1].id)
}
