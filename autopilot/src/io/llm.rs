//! LLM client abstraction.
//!
//! The [`LlmClient`] trait decouples the architect, supervisor and `ask_llm`
//! tool from the actual backend. Two backends ship: an external command fed
//! the transcript on stdin (e.g. `codex exec -`), and an OpenAI-compatible
//! HTTP endpoint. Tests use scripted clients that return canned replies.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::cancel::{Cancelled, ensure_active};
use crate::io::config::{LlmBackend, LlmConfig};
use crate::io::process::{ProcessLimits, run_command_async};

/// Placeholder in `llm.command` replaced by the requested model name.
const MODEL_PLACEHOLDER: &str = "{model}";

/// Replies larger than this are cut by the command backend.
const COMMAND_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Abstraction over chat-completion backends.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send the conversation and return the assistant's reply text.
    ///
    /// Must return [`Cancelled`] promptly once `cancel` fires.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        model_override: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// Default model name, for logs.
    fn model(&self) -> &str;
}

/// Flatten a conversation into one prompt for single-shot backends.
pub fn render_transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|msg| format!("### {}\n\n{}", msg.role.as_str().to_uppercase(), msg.content.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Backend that spawns a command per call.
#[derive(Debug, Clone)]
pub struct CommandLlm {
    argv: Vec<String>,
    model: String,
    workdir: PathBuf,
    timeout: Duration,
}

impl CommandLlm {
    pub fn new(argv: Vec<String>, model: String, workdir: PathBuf, timeout: Duration) -> Self {
        Self {
            argv,
            model,
            workdir,
            timeout,
        }
    }

    fn command(&self, model: &str) -> Result<Command> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| anyhow!("llm.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args.iter().map(|arg| arg.replace(MODEL_PLACEHOLDER, model)))
            .current_dir(&self.workdir);
        Ok(cmd)
    }
}

#[async_trait]
impl LlmClient for CommandLlm {
    #[instrument(skip_all, fields(program = ?self.argv.first(), messages = messages.len()))]
    async fn chat(
        &self,
        messages: &[ChatMessage],
        model_override: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        ensure_active(cancel)?;
        let model = model_override.unwrap_or(&self.model);
        let cmd = self.command(model)?;
        let prompt = render_transcript(messages);
        let limits = ProcessLimits {
            timeout: self.timeout,
            output_limit_bytes: COMMAND_OUTPUT_LIMIT_BYTES,
        };

        let output = run_command_async(cmd, Some(prompt.into_bytes()), limits, cancel.clone())
            .await
            .context("run llm command")?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "llm command timed out");
            return Err(anyhow!("llm command timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "llm command failed");
            return Err(anyhow!(
                "llm command failed with status {:?}: {}",
                output.status.code(),
                output.stderr_lossy().trim()
            ));
        }
        debug!(bytes = output.stdout.len(), "llm command replied");
        Ok(output.stdout_lossy())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// OpenAI-compatible `/chat/completions` backend.
#[derive(Debug, Clone)]
pub struct OpenAiLlm {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiLlm {
    pub fn new(
        base_url: &str,
        model: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model,
            api_key,
        })
    }

    async fn send(&self, messages: &[ChatMessage], model: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": model,
            "messages": messages,
        });
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("POST {}", self.endpoint))?;

        let status = response.status();
        let body_text = response.text().await.context("read completion body")?;
        if !status.is_success() {
            return Err(anyhow!("llm endpoint returned HTTP {status}: {body_text}"));
        }
        let parsed: CompletionResponse =
            serde_json::from_str(&body_text).context("parse completion response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("completion response had no message content"))
    }
}

#[async_trait]
impl LlmClient for OpenAiLlm {
    #[instrument(skip_all, fields(endpoint = %self.endpoint, messages = messages.len()))]
    async fn chat(
        &self,
        messages: &[ChatMessage],
        model_override: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        ensure_active(cancel)?;
        let model = model_override.unwrap_or(&self.model);
        tokio::select! {
            () = cancel.cancelled() => Err(Cancelled.into()),
            reply = self.send(messages, model) => reply,
        }
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Build the configured backend.
pub fn build_llm(config: &LlmConfig, workdir: PathBuf) -> Result<Arc<dyn LlmClient>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.backend {
        LlmBackend::Command => Ok(Arc::new(CommandLlm::new(
            config.command.clone(),
            config.model.clone(),
            workdir,
            timeout,
        ))),
        LlmBackend::Openai => {
            let api_key = std::env::var(&config.api_key_env).ok();
            if api_key.is_none() {
                warn!(var = %config.api_key_env, "api key variable not set");
            }
            Ok(Arc::new(OpenAiLlm::new(
                &config.base_url,
                config.model.clone(),
                api_key,
                timeout,
            )?))
        }
    }
}
