//! Agentic tools: a one-shot LLM sub-call and a question for the user.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use crate::cancel::{Cancelled, ensure_active};
use crate::core::types::ToolOutcome;
use crate::io::llm::ChatMessage;

use super::{Tool, ToolEnv, optional_str, required_str};

pub struct AskLlmTool;

#[async_trait]
impl Tool for AskLlmTool {
    fn name(&self) -> &str {
        "ask_llm"
    }

    fn description(&self) -> &str {
        "Ask the language model a question and return its answer. Use for \
         summarizing, drafting, or reasoning over earlier task results."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string"},
                "system": {"type": "string", "description": "Optional system instruction"}
            },
            "required": ["prompt"]
        })
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        env: &ToolEnv<'_>,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        let prompt = match required_str(params, "prompt") {
            Ok(prompt) if !prompt.trim().is_empty() => prompt,
            Ok(_) => return Ok(ToolOutcome::failure("Parameter `prompt` is empty")),
            Err(missing) => return Ok(missing),
        };
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = optional_str(params, "system").filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));

        let reply = env.llm.chat(&messages, None, cancel).await?;
        if reply.trim().is_empty() {
            return Ok(ToolOutcome::failure("The model returned an empty answer"));
        }
        Ok(ToolOutcome::success(reply.trim().to_string()))
    }
}

pub struct AskUserTool;

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }

    fn description(&self) -> &str {
        "Ask the human operator a question and wait for a typed answer."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"question": {"type": "string"}},
            "required": ["question"]
        })
    }

    fn requests_user_input(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        params: &Map<String, Value>,
        env: &ToolEnv<'_>,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        let question = match required_str(params, "question") {
            Ok(question) => question,
            Err(missing) => return Ok(missing),
        };
        ensure_active(cancel)?;
        // A terminal prompt keeps its blocking reader thread after cancellation.
        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            answer = env.interaction.ask(question) => answer?,
        };
        match answer {
            Some(answer) => Ok(ToolOutcome::success(answer)),
            None => Ok(ToolOutcome::failure("No answer from the user")),
        }
    }
}
