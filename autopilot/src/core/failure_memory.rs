//! Loop-prevention log of previously failed tool calls.
//!
//! Identity is `(tool name, canonical parameters)`. Canonical means object
//! keys are sorted recursively, so `{"a":1,"b":2}` and `{"b":2,"a":1}` are the
//! same call regardless of how the map was built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::types::truncate_chars;

/// Maximum characters of error output rendered per entry in the digest.
pub const DIGEST_ERROR_CHARS: usize = 400;

/// A single recorded failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAttempt {
    pub tool_name: String,
    pub parameters: Value,
    pub error_output: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only failure log. Only [`FailureMemory::clear`] removes entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailureMemory {
    attempts: Vec<FailedAttempt>,
}

impl FailureMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self, tool_name: &str, parameters: &Value, error_output: &str) {
        self.attempts.push(FailedAttempt {
            tool_name: tool_name.to_string(),
            parameters: parameters.clone(),
            error_output: error_output.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn has_failed_before(&self, tool_name: &str, parameters: &Value) -> bool {
        let key = canonical_json(parameters);
        self.attempts.iter().any(|attempt| {
            attempt.tool_name == tool_name && canonical_json(&attempt.parameters) == key
        })
    }

    /// Render every recorded failure for prompt injection.
    ///
    /// Returns an empty string when nothing has failed, so callers can splice
    /// the result into a prompt unconditionally.
    pub fn memory_context(&self) -> String {
        if self.attempts.is_empty() {
            return String::new();
        }
        let mut buf = String::from("## FAILURE MEMORY\n");
        buf.push_str("The following exact tool calls already failed:\n");
        for (idx, attempt) in self.attempts.iter().enumerate() {
            buf.push_str(&format!(
                "{}. tool `{}` with parameters {} failed: {}\n",
                idx + 1,
                attempt.tool_name,
                canonical_json(&attempt.parameters),
                truncate_chars(attempt.error_output.trim(), DIGEST_ERROR_CHARS)
            ));
        }
        buf.push_str(
            "Do NOT retry any of these calls with identical parameters. \
             Change the tool, the parameters, or the strategy.\n",
        );
        buf
    }

    pub fn clear(&mut self) {
        self.attempts.clear();
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn attempts(&self) -> &[FailedAttempt] {
        &self.attempts
    }
}

/// Serialize `value` with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
