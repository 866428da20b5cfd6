//! Defensive parsing of free-form LLM replies.
//!
//! Replies are untrusted text: they may wrap JSON in fences, prefix it with
//! reasoning blocks, or contain no JSON at all. Nothing here returns an error;
//! unparseable input degrades to [`ArchitectReply::Text`] or `None`.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::types::TaskDraft;

static REASONING_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)<think>.*?</think>|<thinking>.*?</thinking>|<reasoning>.*?</reasoning>",
    )
    .expect("reasoning block pattern is valid")
});

static STRAY_CLOSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</(?:think|thinking|reasoning)>").expect("closing tag pattern is valid")
});

static STRAY_OPEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<(?:think|thinking|reasoning)>").expect("opening tag pattern is valid")
});

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("fence pattern is valid")
});

/// A plan as emitted by the architect, before initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDraft {
    pub tasks: Vec<TaskDraft>,
    #[serde(default)]
    pub scratchpad: Option<String>,
}

/// What an architect reply asks the engine to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ArchitectReply {
    Plan(PlanDraft),
    ToolCall {
        tool: String,
        params: Map<String, Value>,
    },
    /// JSON that looked like a plan but could not be used.
    Invalid(String),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Continue,
    Replan,
}

/// Verdict of the post-task supervisor call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorDecision {
    pub decision: Decision,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub new_instruction: Option<String>,
}

impl SupervisorDecision {
    /// The safe default used whenever the supervisor cannot be consulted.
    pub fn fallback(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Continue,
            reasoning: reason.into(),
            new_instruction: None,
        }
    }
}

/// Remove model reasoning blocks, including a dangling close tag whose
/// opener was cut off and a dangling open tag that was never closed.
pub fn strip_reasoning(text: &str) -> String {
    let without_blocks = REASONING_BLOCK_RE.replace_all(text, "");
    let after_close = match STRAY_CLOSE_RE.find_iter(&without_blocks).last() {
        Some(m) => &without_blocks[m.end()..],
        None => &without_blocks[..],
    };
    STRAY_OPEN_RE.replace_all(after_close, "").trim().to_string()
}

/// Find the first JSON object in `text`: fenced blocks first, then any
/// balanced `{...}` span.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    for caps in FENCE_RE.captures_iter(text) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(caps[1].trim()) {
            return Some(map);
        }
    }
    for (start, _) in text.match_indices('{') {
        let Some(end) = matching_brace(&text[start..]) else {
            continue;
        };
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text[start..start + end]) {
            return Some(map);
        }
    }
    None
}

/// Byte length of the balanced object starting at `text[0] == '{'`.
fn matching_brace(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(idx + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Classify an architect reply.
pub fn classify_architect_reply(raw: &str) -> ArchitectReply {
    let text = strip_reasoning(raw);
    let Some(object) = extract_json_object(&text) else {
        return ArchitectReply::Text(text);
    };

    if let Some(tasks) = object.get("tasks") {
        let Some(items) = tasks.as_array() else {
            return ArchitectReply::Invalid("`tasks` must be an array".to_string());
        };
        if items.is_empty() {
            return ArchitectReply::Invalid("`tasks` must not be empty".to_string());
        }
        return match serde_json::from_value::<PlanDraft>(Value::Object(object)) {
            Ok(draft) => ArchitectReply::Plan(draft),
            Err(err) => ArchitectReply::Invalid(format!("plan does not match the task shape: {err}")),
        };
    }

    if let Some(tool) = object.get("tool").and_then(Value::as_str) {
        let params = object
            .get("params")
            .or_else(|| object.get("parameters"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        return ArchitectReply::ToolCall {
            tool: tool.to_string(),
            params,
        };
    }

    ArchitectReply::Text(text)
}

/// Parse a supervisor reply. Callers substitute [`SupervisorDecision::fallback`]
/// when this returns `None`.
pub fn parse_supervisor_decision(raw: &str) -> Option<SupervisorDecision> {
    let mut object = extract_json_object(&strip_reasoning(raw))?;
    if let Some(Value::String(decision)) = object.get_mut("decision") {
        *decision = decision.trim().to_ascii_lowercase();
    }
    let mut parsed: SupervisorDecision = serde_json::from_value(Value::Object(object)).ok()?;
    parsed.new_instruction = parsed
        .new_instruction
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty());
    Some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_reasoning_blocks() {
        let raw = "<think>plan it</think>\n<THINKING>more</THINKING>answer";
        assert_eq!(strip_reasoning(raw), "answer");

        let dangling_close = "chain of thought here</reasoning>\nfinal";
        assert_eq!(strip_reasoning(dangling_close), "final");

        let dangling_open = "<think>\n{\"tool\": \"list_files\"}";
        assert_eq!(strip_reasoning(dangling_open), "{\"tool\": \"list_files\"}");
    }

    #[test]
    fn classifies_fenced_plan() {
        let raw = r#"Here is the plan:
```json
{"tasks": [{"action": "list_files", "description": "look", "parameters": {"path": "."}}]}
```"#;
        let ArchitectReply::Plan(draft) = classify_architect_reply(raw) else {
            panic!("expected plan");
        };
        assert_eq!(draft.tasks.len(), 1);
        assert_eq!(draft.tasks[0].action, "list_files");
    }

    #[test]
    fn classifies_unfenced_tool_call() {
        let raw = r#"<think>I should look first</think> Let me check {"tool": "read_file", "params": {"path": "a.txt"}} please"#;
        match classify_architect_reply(raw) {
            ArchitectReply::ToolCall { tool, params } => {
                assert_eq!(tool, "read_file");
                assert_eq!(params["path"], "a.txt");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_matching() {
        let raw = r#"{"tool": "execute_command", "params": {"command": "echo '}{'"}}"#;
        match classify_architect_reply(raw) {
            ArchitectReply::ToolCall { params, .. } => {
                assert_eq!(params["command"], "echo '}{'");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn skips_fences_that_are_not_json() {
        let raw = "```bash\nls -la\n```\n```json\n{\"tool\": \"list_files\"}\n```";
        assert!(matches!(
            classify_architect_reply(raw),
            ArchitectReply::ToolCall { .. }
        ));
    }

    #[test]
    fn empty_or_malformed_plans_are_invalid() {
        assert!(matches!(
            classify_architect_reply(r#"{"tasks": []}"#),
            ArchitectReply::Invalid(_)
        ));
        assert!(matches!(
            classify_architect_reply(r#"{"tasks": [{"description": "no action"}]}"#),
            ArchitectReply::Invalid(_)
        ));
    }

    #[test]
    fn prose_is_text() {
        assert_eq!(
            classify_architect_reply("I am not sure yet."),
            ArchitectReply::Text("I am not sure yet.".to_string())
        );
        assert!(matches!(
            classify_architect_reply("{not json"),
            ArchitectReply::Text(_)
        ));
    }

    #[test]
    fn parses_supervisor_decision() {
        let raw = "```json\n{\"decision\": \"Replan\", \"reasoning\": \"target missing\", \"new_instruction\": \"use v2 API\"}\n```";
        let parsed = parse_supervisor_decision(raw).expect("decision");
        assert_eq!(parsed.decision, Decision::Replan);
        assert_eq!(parsed.new_instruction.as_deref(), Some("use v2 API"));

        let blank = r#"{"decision": "continue", "reasoning": "fine", "new_instruction": "  "}"#;
        let parsed = parse_supervisor_decision(blank).expect("decision");
        assert_eq!(parsed.decision, Decision::Continue);
        assert_eq!(parsed.new_instruction, None);

        assert!(parse_supervisor_decision("sounds good").is_none());
        assert!(parse_supervisor_decision(r#"{"decision": "maybe"}"#).is_none());
    }
}
