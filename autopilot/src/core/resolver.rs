//! Template expansion for task parameters.
//!
//! Two placeholder families are expanded in every string-valued parameter:
//!
//! - `{{tasks[N].result}}` with an optional `| regex_search('pattern', group)`
//!   (or `.regex_search(...)`) transform, where `N` is a task id.
//! - `{{name}}` for values saved into the session with `save_as`.
//!
//! Anything that cannot be resolved is left verbatim so the receiving tool
//! fails with the placeholder visible, instead of the resolver failing.

use std::borrow::Cow;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::{Captures, Regex, RegexBuilder};
use serde_json::{Map, Value};

use crate::core::plan::Plan;
use crate::core::session::SessionState;
use crate::core::types::Task;

static TASK_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"\{\{\s*tasks\[(\d+)\]\.result(?:\s*(?:\||\.)\s*regex_search\(\s*(?:'((?:[^'\\]|\\.)*)'|"((?:[^"\\]|\\.)*)")\s*(?:,\s*(\d+)\s*)?\))?\s*\}\}"#,
    )
    .expect("task reference pattern is valid")
});

static VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("variable pattern is valid")
});

/// Resolve `task.parameters` against prior task results and session variables.
///
/// Errors only when there is no active plan.
pub fn resolve_parameters(
    task: &Task,
    plan: Option<&Plan>,
    session: &SessionState,
) -> Result<Map<String, Value>> {
    let plan = plan.ok_or_else(|| anyhow!("cannot resolve parameters without an active plan"))?;
    let mut resolved = Map::new();
    for (key, value) in &task.parameters {
        let value = match value {
            Value::String(text) => Value::String(resolve_text(text, plan, session)),
            other => other.clone(),
        };
        resolved.insert(key.clone(), value);
    }
    Ok(resolved)
}

/// Expand placeholders in a single string.
pub fn resolve_text(text: &str, plan: &Plan, session: &SessionState) -> String {
    let with_results = TASK_REF_RE.replace_all(text, |caps: &Captures<'_>| {
        resolve_task_reference(caps, plan).into_owned()
    });
    VARIABLE_RE
        .replace_all(&with_results, |caps: &Captures<'_>| {
            match session.repl_variables.get(&caps[1]) {
                Some(value) => render_variable(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn resolve_task_reference<'c>(caps: &'c Captures<'_>, plan: &'c Plan) -> Cow<'c, str> {
    let original = Cow::Borrowed(&caps[0]);
    let Some(task) = caps[1]
        .parse::<u64>()
        .ok()
        .and_then(|id| plan.task_by_id(id))
    else {
        return original;
    };
    let Some(result) = task.result.as_deref() else {
        return original;
    };

    let pattern = caps.get(2).or_else(|| caps.get(3));
    let Some(pattern) = pattern else {
        return Cow::Borrowed(result);
    };
    let group = caps
        .get(4)
        .and_then(|m| m.as_str().parse::<usize>().ok())
        .unwrap_or(0);

    match regex_search(result, &unescape_quotes(pattern.as_str()), group) {
        Some(found) => Cow::Owned(found),
        None => original,
    }
}

/// Search `haystack` with a multiline `pattern`, returning capture `group`.
fn regex_search(haystack: &str, pattern: &str, group: usize) -> Option<String> {
    let re = RegexBuilder::new(pattern).multi_line(true).build().ok()?;
    let caps = re.captures(haystack)?;
    caps.get(group).map(|m| m.as_str().to_string())
}

fn unescape_quotes(pattern: &str) -> String {
    pattern.replace("\\'", "'").replace("\\\"", "\"")
}

/// Strings are inserted as-is unless they hold JSON, which is re-indented.
fn render_variable(value: &Value) -> String {
    match value {
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(parsed @ (Value::Object(_) | Value::Array(_))) => {
                serde_json::to_string_pretty(&parsed).unwrap_or_else(|_| text.clone())
            }
            _ => text.clone(),
        },
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::plan_with_actions;
    use serde_json::json;

    fn task_with_param(value: Value) -> Task {
        let mut plan = plan_with_actions(&["inspect"]);
        let mut task = plan.tasks.remove(0);
        task.parameters.insert("input".to_string(), value);
        task
    }

    fn resolve_input(plan: &Plan, session: &SessionState, value: Value) -> Value {
        let task = task_with_param(value);
        let resolved = resolve_parameters(&task, Some(plan), session).expect("resolve");
        resolved["input"].clone()
    }

    #[test]
    fn substitutes_task_result() {
        let mut plan = plan_with_actions(&["a", "b"]);
        plan.tasks[0].result = Some("hello".to_string());
        let session = SessionState::default();

        let got = resolve_input(&plan, &session, json!("{{tasks[1].result}}"));
        assert_eq!(got, json!("hello"));
    }

    #[test]
    fn leaves_placeholder_when_result_missing() {
        let plan = plan_with_actions(&["a", "b"]);
        let session = SessionState::default();

        let got = resolve_input(&plan, &session, json!("see {{tasks[1].result}} here"));
        assert_eq!(got, json!("see {{tasks[1].result}} here"));

        let got = resolve_input(&plan, &session, json!("{{tasks[99].result}}"));
        assert_eq!(got, json!("{{tasks[99].result}}"));
    }

    #[test]
    fn regex_search_extracts_capture_group() {
        let mut plan = plan_with_actions(&["a"]);
        plan.tasks[0].result = Some("version: 1.2.3".to_string());
        let session = SessionState::default();

        let got = resolve_input(
            &plan,
            &session,
            json!(r"{{tasks[1].result | regex_search('(\d+\.\d+\.\d+)', 1)}}"),
        );
        assert_eq!(got, json!("1.2.3"));

        let got = resolve_input(
            &plan,
            &session,
            json!(r#"v{{tasks[1].result.regex_search("\d+\.\d+")}}"#),
        );
        assert_eq!(got, json!("v1.2"));
    }

    #[test]
    fn regex_search_is_multiline() {
        let mut plan = plan_with_actions(&["a"]);
        plan.tasks[0].result = Some("header\nname = demo\nother".to_string());
        let session = SessionState::default();

        let got = resolve_input(
            &plan,
            &session,
            json!(r"{{tasks[1].result | regex_search('^name = (\w+)$', 1)}}"),
        );
        assert_eq!(got, json!("demo"));
    }

    #[test]
    fn regex_failures_leave_text_unresolved() {
        let mut plan = plan_with_actions(&["a"]);
        plan.tasks[0].result = Some("no digits".to_string());
        let session = SessionState::default();

        let unmatched = r"{{tasks[1].result | regex_search('(\d+)', 1)}}";
        assert_eq!(resolve_input(&plan, &session, json!(unmatched)), json!(unmatched));

        let invalid = r"{{tasks[1].result | regex_search('(unclosed', 1)}}";
        assert_eq!(resolve_input(&plan, &session, json!(invalid)), json!(invalid));

        let bad_group = r"{{tasks[1].result | regex_search('(no)', 5)}}";
        assert_eq!(resolve_input(&plan, &session, json!(bad_group)), json!(bad_group));
    }

    #[test]
    fn substitutes_session_variables() {
        let plan = plan_with_actions(&["a"]);
        let mut session = SessionState::default();
        session.save_variable("name", "world");
        session.save_variable("config", r#"{"debug": true}"#);
        session
            .repl_variables
            .insert("nested".to_string(), json!("{\"k\": [1]}"));

        assert_eq!(
            resolve_input(&plan, &session, json!("hello {{name}}")),
            json!("hello world")
        );
        assert_eq!(
            resolve_input(&plan, &session, json!("{{config}}")),
            json!("{\n  \"debug\": true\n}")
        );
        assert_eq!(
            resolve_input(&plan, &session, json!("{{nested}}")),
            json!("{\n  \"k\": [\n    1\n  ]\n}")
        );
        assert_eq!(
            resolve_input(&plan, &session, json!("{{missing}}")),
            json!("{{missing}}")
        );
    }

    #[test]
    fn non_string_parameters_pass_through() {
        let plan = plan_with_actions(&["a"]);
        let session = SessionState::default();
        assert_eq!(
            resolve_input(&plan, &session, json!({"depth": 2})),
            json!({"depth": 2})
        );
    }

    #[test]
    fn resolving_without_plan_is_an_error() {
        let task = task_with_param(json!("x"));
        let err = resolve_parameters(&task, None, &SessionState::default()).unwrap_err();
        assert!(err.to_string().contains("active plan"));
    }
}
