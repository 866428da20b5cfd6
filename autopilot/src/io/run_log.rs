//! Append-only execution log at `.autopilot/runs.jsonl`.
//!
//! One JSON object per line for every task execution and investigation call.
//! This is product output, unaffected by `RUST_LOG`.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Which phase produced the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Investigation,
    Task,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEntry {
    pub timestamp: DateTime<Utc>,
    pub phase: RunPhase,
    /// Absent for investigation calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<u64>,
    pub action: String,
    pub parameters: Map<String, Value>,
    pub success: bool,
    pub duration_ms: u64,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &RunEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(entry).context("serialize run entry")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))
    }

    /// Read every entry; malformed lines are skipped with a warning.
    pub fn read_all(&self) -> Result<Vec<RunEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        let mut entries = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("read {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(line = idx + 1, err = %err, "skipping malformed run log line"),
            }
        }
        Ok(entries)
    }

    /// The last `limit` entries, optionally failures only.
    pub fn tail(&self, limit: usize, failures_only: bool) -> Result<Vec<RunEntry>> {
        let mut entries: Vec<RunEntry> = self
            .read_all()?
            .into_iter()
            .filter(|entry| !failures_only || !entry.success)
            .collect();
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }
}

/// Render entries as a compact, human-readable listing.
pub fn render_entries(entries: &[RunEntry]) -> String {
    let mut buf = String::new();
    for entry in entries {
        let marker = if entry.success { "ok" } else { "FAILED" };
        let who = match entry.task_id {
            Some(id) => format!("task #{id}"),
            None => "investigation".to_string(),
        };
        buf.push_str(&format!(
            "{} {} {} [{}] {}ms\n",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            who,
            entry.action,
            marker,
            entry.duration_ms
        ));
        let output = entry.output.trim();
        if !output.is_empty() {
            for line in output.lines() {
                buf.push_str("    ");
                buf.push_str(line);
                buf.push('\n');
            }
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(action: &str, success: bool) -> RunEntry {
        RunEntry {
            timestamp: Utc::now(),
            phase: RunPhase::Task,
            task_id: Some(1),
            action: action.to_string(),
            parameters: Map::new(),
            success,
            duration_ms: 5,
            output: format!("{action} output"),
        }
    }

    #[test]
    fn append_and_tail_with_failure_filter() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = RunLog::new(temp.path().join(".autopilot/runs.jsonl"));
        log.append(&entry("list_files", true)).expect("append");
        log.append(&entry("execute_command", false)).expect("append");
        log.append(&entry("read_file", true)).expect("append");

        assert_eq!(log.read_all().expect("read").len(), 3);
        let last_two = log.tail(2, false).expect("tail");
        assert_eq!(last_two[0].action, "execute_command");
        assert_eq!(last_two[1].action, "read_file");

        let failures = log.tail(10, true).expect("tail");
        assert_eq!(failures.len(), 1);
        assert!(render_entries(&failures).contains("execute_command [FAILED]"));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = RunLog::new(temp.path().join("runs.jsonl"));
        log.append(&entry("list_files", true)).expect("append");
        let mut file = OpenOptions::new()
            .append(true)
            .open(log.path())
            .expect("open");
        file.write_all(b"not json\n").expect("write");

        assert_eq!(log.read_all().expect("read").len(), 1);
    }
}
