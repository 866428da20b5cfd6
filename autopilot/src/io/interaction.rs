//! User-facing decision points.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use async_trait::async_trait;
use dialoguer::{Input, Select};
use tracing::debug;

use crate::core::types::Task;

/// Answer to a terminal task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDecision {
    Stop,
    ContinueAnyway,
    ViewLog,
}

impl UserDecision {
    pub const ALL: [UserDecision; 3] = [
        UserDecision::Stop,
        UserDecision::ContinueAnyway,
        UserDecision::ViewLog,
    ];

    pub fn label(self) -> &'static str {
        match self {
            UserDecision::Stop => "Stop",
            UserDecision::ContinueAnyway => "Continue Anyway",
            UserDecision::ViewLog => "View Log",
        }
    }
}

#[async_trait]
pub trait Interaction: Send + Sync {
    /// Block until the user picks how to handle a task that cannot be revised.
    /// A dismissed prompt must map to [`UserDecision::Stop`].
    async fn decide_on_failure(&self, task: &Task, error: &str) -> Result<UserDecision>;

    /// Ask a free-form question. `None` means the user gave no answer.
    async fn ask(&self, question: &str) -> Result<Option<String>>;

    /// Display text to the user.
    async fn show(&self, text: &str);
}

/// Interactive prompts on the controlling terminal.
#[derive(Debug, Clone, Default)]
pub struct TerminalInteraction;

#[async_trait]
impl Interaction for TerminalInteraction {
    async fn decide_on_failure(&self, task: &Task, error: &str) -> Result<UserDecision> {
        let prompt = format!(
            "Task #{} ({}) failed: {}",
            task.id,
            task.action,
            first_line(error)
        );
        let picked = tokio::task::spawn_blocking(move || {
            Select::new()
                .with_prompt(prompt)
                .items(&UserDecision::ALL.map(UserDecision::label))
                .default(0)
                .interact_opt()
        })
        .await
        .context("join prompt task")?;

        // Dismissal and terminal errors both mean stop.
        let decision = match picked {
            Ok(Some(idx)) => UserDecision::ALL
                .get(idx)
                .copied()
                .unwrap_or(UserDecision::Stop),
            Ok(None) => UserDecision::Stop,
            Err(err) => {
                debug!(err = %err, "failure prompt dismissed");
                UserDecision::Stop
            }
        };
        Ok(decision)
    }

    async fn ask(&self, question: &str) -> Result<Option<String>> {
        let question = question.to_string();
        let answer = tokio::task::spawn_blocking(move || {
            Input::<String>::new()
                .with_prompt(question)
                .allow_empty(true)
                .interact_text()
        })
        .await
        .context("join prompt task")?;
        Ok(answer
            .ok()
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty()))
    }

    async fn show(&self, text: &str) {
        println!("{text}");
    }
}

/// Non-interactive mode: never blocks, stops on every terminal failure.
#[derive(Debug, Clone, Default)]
pub struct HeadlessInteraction;

#[async_trait]
impl Interaction for HeadlessInteraction {
    async fn decide_on_failure(&self, task: &Task, error: &str) -> Result<UserDecision> {
        debug!(task_id = task.id, error = first_line(error), "headless: stopping on failure");
        Ok(UserDecision::Stop)
    }

    async fn ask(&self, _question: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn show(&self, text: &str) {
        println!("{text}");
    }
}

/// Terminal prompts when stdin is a TTY, headless otherwise.
pub fn default_interaction() -> Box<dyn Interaction> {
    if std::io::stdin().is_terminal() {
        Box::new(TerminalInteraction)
    } else {
        Box::new(HeadlessInteraction)
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
