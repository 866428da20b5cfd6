//! Test-only doubles: scripted tools, LLM and user, plus plan builders.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::cancel::ensure_active;
use crate::core::plan::Plan;
use crate::core::types::{Task, TaskDraft, TaskType, ToolOutcome};
use crate::io::config::ShellConfig;
use crate::io::interaction::{Interaction, UserDecision};
use crate::io::llm::{ChatMessage, LlmClient};
use crate::tools::{PermissionGroup, Tool, ToolEnv};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Draft for `action` with no parameters.
pub fn draft(action: &str) -> TaskDraft {
    draft_with(action, Value::Object(Map::new()))
}

/// Draft for `action` with the given parameter object.
pub fn draft_with(action: &str, parameters: Value) -> TaskDraft {
    TaskDraft {
        task_type: TaskType::SimpleAction,
        action: action.to_string(),
        description: format!("{action} step"),
        parameters: parameters.as_object().cloned().unwrap_or_default(),
        save_as: None,
    }
}

/// Live plan with one pending task per action, ids starting at 1.
pub fn plan_with_actions(actions: &[&str]) -> Plan {
    let enabled: BTreeSet<String> = actions.iter().map(|a| a.to_string()).collect();
    let drafts = actions.iter().map(|action| draft(action)).collect();
    Plan::initialize("test objective", drafts, &enabled).expect("valid plan")
}

/// Shared record of the parameters each call received.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Map<String, Value>>>>);

impl CallLog {
    pub fn count(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn last(&self) -> Option<Map<String, Value>> {
        lock(&self.0).last().cloned()
    }

    pub fn all(&self) -> Vec<Map<String, Value>> {
        lock(&self.0).clone()
    }

    fn push(&self, params: &Map<String, Value>) {
        lock(&self.0).push(params.clone());
    }
}

type ErrorFactory = Arc<dyn Fn() -> anyhow::Error + Send + Sync>;

#[derive(Clone)]
enum Step {
    Reply(ToolOutcome),
    Error(ErrorFactory),
    /// Succeed with the received parameters serialized as JSON.
    Echo,
}

/// Tool whose replies are scripted up front. Once the script runs out the
/// last step repeats.
pub struct ScriptedTool {
    name: String,
    group: Option<PermissionGroup>,
    user_input: bool,
    steps: Mutex<VecDeque<Step>>,
    last: Step,
    calls: CallLog,
}

impl ScriptedTool {
    fn with_steps(name: &str, steps: Vec<Step>) -> Self {
        let mut steps: VecDeque<Step> = steps.into();
        let last = steps.back().cloned().unwrap_or(Step::Echo);
        if steps.len() == 1 {
            steps.clear();
        }
        Self {
            name: name.to_string(),
            group: None,
            user_input: false,
            steps: Mutex::new(steps),
            last,
            calls: CallLog::default(),
        }
    }

    pub fn succeeding(name: &str, output: &str) -> Self {
        Self::with_steps(name, vec![Step::Reply(ToolOutcome::success(output))])
    }

    pub fn failing(name: &str, output: &str) -> Self {
        Self::with_steps(name, vec![Step::Reply(ToolOutcome::failure(output))])
    }

    pub fn erroring(
        name: &str,
        make_error: impl Fn() -> anyhow::Error + Send + Sync + 'static,
    ) -> Self {
        Self::with_steps(name, vec![Step::Error(Arc::new(make_error))])
    }

    pub fn echo(name: &str) -> Self {
        Self::with_steps(name, vec![Step::Echo])
    }

    /// Reply with each outcome in turn, then keep repeating the final one.
    pub fn sequence(name: &str, outcomes: Vec<ToolOutcome>) -> Self {
        Self::with_steps(name, outcomes.into_iter().map(Step::Reply).collect())
    }

    pub fn with_group(mut self, group: PermissionGroup) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_user_input(mut self) -> Self {
        self.user_input = true;
        self
    }

    /// Handle that stays valid after the tool moves into a registry.
    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "scripted test tool"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({"type": "object"})
    }

    fn permission_group(&self) -> Option<PermissionGroup> {
        self.group
    }

    fn requests_user_input(&self) -> bool {
        self.user_input
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        _env: &ToolEnv<'_>,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        ensure_active(cancel)?;
        self.calls.push(params);
        let step = lock(&self.steps)
            .pop_front()
            .unwrap_or_else(|| self.last.clone());
        match step {
            Step::Reply(outcome) => Ok(outcome),
            Step::Error(make_error) => Err(make_error()),
            Step::Echo => Ok(ToolOutcome::success(Value::Object(params.clone()).to_string())),
        }
    }
}

/// One recorded LLM request.
#[derive(Debug, Clone)]
pub struct LlmCall {
    pub messages: Vec<ChatMessage>,
    pub model_override: Option<String>,
}

/// LLM that returns queued replies in order and errors once they run out.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLlm {
    replies: Arc<Mutex<VecDeque<String>>>,
    calls: Arc<Mutex<Vec<LlmCall>>>,
}

impl ScriptedLlm {
    pub fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        let llm = Self::default();
        for reply in replies {
            llm.push_reply(reply);
        }
        llm
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        lock(&self.replies).push_back(reply.into());
    }

    /// Messages of every call so far.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        lock(&self.calls)
            .iter()
            .map(|call| call.messages.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<LlmCall> {
        lock(&self.calls).clone()
    }

    pub fn remaining(&self) -> usize {
        lock(&self.replies).len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        model_override: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        ensure_active(cancel)?;
        lock(&self.calls).push(LlmCall {
            messages: messages.to_vec(),
            model_override: model_override.map(str::to_string),
        });
        lock(&self.replies)
            .pop_front()
            .ok_or_else(|| anyhow!("scripted llm has no reply left"))
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

/// User double: queued failure decisions (default `Stop`) and answers
/// (default none).
#[derive(Debug, Clone, Default)]
pub struct ScriptedInteraction {
    decisions: Arc<Mutex<VecDeque<UserDecision>>>,
    answers: Arc<Mutex<VecDeque<Option<String>>>>,
    prompts: Arc<Mutex<Vec<(u64, String)>>>,
    shown: Arc<Mutex<Vec<String>>>,
}

impl ScriptedInteraction {
    pub fn new(decisions: impl IntoIterator<Item = UserDecision>) -> Self {
        let interaction = Self::default();
        lock(&interaction.decisions).extend(decisions);
        interaction
    }

    pub fn push_answer(&self, answer: Option<&str>) {
        lock(&self.answers).push_back(answer.map(str::to_string));
    }

    /// `(task id, error)` of every failure prompt shown so far.
    pub fn failure_prompts(&self) -> Vec<(u64, String)> {
        lock(&self.prompts).clone()
    }

    pub fn shown(&self) -> Vec<String> {
        lock(&self.shown).clone()
    }
}

#[async_trait]
impl Interaction for ScriptedInteraction {
    async fn decide_on_failure(&self, task: &Task, error: &str) -> Result<UserDecision> {
        lock(&self.prompts).push((task.id, error.to_string()));
        Ok(lock(&self.decisions)
            .pop_front()
            .unwrap_or(UserDecision::Stop))
    }

    async fn ask(&self, _question: &str) -> Result<Option<String>> {
        Ok(lock(&self.answers).pop_front().flatten())
    }

    async fn show(&self, text: &str) {
        lock(&self.shown).push(text.to_string());
    }
}

/// Temporary workspace plus the doubles a [`ToolEnv`] borrows.
pub struct TestEnv {
    dir: TempDir,
    pub llm: ScriptedLlm,
    pub interaction: ScriptedInteraction,
    pub shell: ShellConfig,
    pub variables: BTreeMap<String, Value>,
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("tempdir"),
            llm: ScriptedLlm::default(),
            interaction: ScriptedInteraction::default(),
            shell: ShellConfig::default(),
            variables: BTreeMap::new(),
        }
    }

    pub fn with_llm_replies<'a>(self, replies: impl IntoIterator<Item = &'a str>) -> Self {
        for reply in replies {
            self.llm.push_reply(reply);
        }
        self
    }

    pub fn with_answers<'a>(self, answers: impl IntoIterator<Item = Option<&'a str>>) -> Self {
        for answer in answers {
            self.interaction.push_answer(answer);
        }
        self
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn env<'a>(&'a self, plan: Option<&'a Plan>) -> ToolEnv<'a> {
        ToolEnv {
            workspace: self.dir.path(),
            llm: &self.llm,
            interaction: &self.interaction,
            plan,
            variables: &self.variables,
            shell: &self.shell,
        }
    }
}
