//! `fetch_url`: HTTP GET returning the response body as text.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::cancel::Cancelled;
use crate::core::types::{ToolOutcome, truncate_chars};

use super::{PermissionGroup, Tool, ToolEnv, optional_u64, required_str};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 120;
const MAX_BODY_CHARS: usize = 100_000;

pub struct FetchUrlTool {
    client: reqwest::Client,
}

impl FetchUrlTool {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("autopilot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Tool for FetchUrlTool {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch a URL with HTTP GET and return the response body as text. \
         Non-2xx responses are failures."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "http:// or https:// URL"},
                "timeout_secs": {"type": "integer", "minimum": 1, "maximum": MAX_TIMEOUT_SECS}
            },
            "required": ["url"]
        })
    }

    fn permission_group(&self) -> Option<PermissionGroup> {
        Some(PermissionGroup::InternetAccess)
    }

    #[instrument(skip_all)]
    async fn execute(
        &self,
        params: &Map<String, Value>,
        _env: &ToolEnv<'_>,
        cancel: &CancellationToken,
    ) -> Result<ToolOutcome> {
        let url = match required_str(params, "url") {
            Ok(url) => url.trim(),
            Err(missing) => return Ok(missing),
        };
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Ok(ToolOutcome::failure(format!(
                "Unsupported URL `{url}`: only http and https are allowed"
            )));
        }
        let timeout = optional_u64(params, "timeout_secs")
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .clamp(1, MAX_TIMEOUT_SECS);

        let request = async {
            let response = self
                .client
                .get(url)
                .timeout(Duration::from_secs(timeout))
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        let (status, body) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            result = request => match result {
                Ok(pair) => pair,
                Err(err) if err.is_timeout() => {
                    return Ok(ToolOutcome::failure(format!(
                        "Request to {url} timed out after {timeout}s"
                    )));
                }
                Err(err) => {
                    return Ok(ToolOutcome::failure(format!("Request to {url} failed: {err}")));
                }
            },
        };
        debug!(%status, bytes = body.len(), "fetched");

        let body = truncate_chars(&body, MAX_BODY_CHARS);
        if !status.is_success() {
            return Ok(ToolOutcome::failure(format!("HTTP {status}\n{body}")));
        }
        Ok(ToolOutcome::success(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let harness = TestEnv::new();
        let tool = FetchUrlTool::new().expect("client");
        let params = json!({"url": "file:///etc/passwd"})
            .as_object()
            .cloned()
            .expect("object");
        let outcome = tool
            .execute(&params, &harness.env(None), &CancellationToken::new())
            .await
            .expect("fetch");
        assert!(!outcome.success);
        assert!(outcome.output.contains("only http and https"));
    }

    #[tokio::test]
    async fn cancellation_wins_over_a_pending_request() {
        let harness = TestEnv::new();
        let tool = FetchUrlTool::new().expect("client");
        let params = json!({"url": "http://10.255.255.1/"})
            .as_object()
            .cloned()
            .expect("object");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = tool
            .execute(&params, &harness.env(None), &cancel)
            .await
            .unwrap_err();
        assert!(crate::cancel::is_cancelled(&err));
    }
}
