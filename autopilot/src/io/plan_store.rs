//! Plan load/save with schema + invariant validation.
//!
//! The live plan is persisted to `.autopilot/plan.json` after every mutating
//! step. Writes are atomic; loads reject anything a hand edit could break.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::invariants::validate_plan_invariants;
use crate::core::plan::Plan;

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");

static PLAN_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(PLAN_SCHEMA).map_err(|err| err.to_string())?;
    validator_for(&schema).map_err(|err| err.to_string())
});

/// Filesystem home of the live plan.
#[derive(Debug, Clone)]
pub struct PlanStore {
    path: PathBuf,
}

impl PlanStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the persisted plan, or `None` when nothing was saved yet.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn load(&self) -> Result<Option<Plan>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read plan {}", self.path.display()))?;
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse plan {}", self.path.display()))?;
        validate_schema(&value)?;
        let plan: Plan = serde_json::from_value(value)
            .with_context(|| format!("deserialize plan {}", self.path.display()))?;
        let errors = validate_plan_invariants(&plan);
        if !errors.is_empty() {
            return Err(anyhow!("plan invariants failed: {}", errors.join("; ")));
        }
        debug!(tasks = plan.tasks.len(), "loaded plan");
        Ok(Some(plan))
    }

    pub fn save(&self, plan: &Plan) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(plan).context("serialize plan")?;
        buf.push('\n');
        super::write_atomic(&self.path, &buf)
    }

    /// Remove the persisted plan (objective finished or abandoned).
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("remove plan {}", self.path.display()))?;
        }
        Ok(())
    }
}

fn validate_schema(plan: &Value) -> Result<()> {
    let compiled = PLAN_VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("invalid plan schema: {err}"))?;
    if !compiled.is_valid(plan) {
        let messages = compiled
            .iter_errors(plan)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "plan schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
