//! HTTP fetch tool

use crate::permissions::Capability;
use crate::tools::types::{required_str, MAX_OUTPUT_BYTES};
use crate::tools::{Tool, ToolContext, ToolOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Redirect hops followed, each one permission-checked
pub const MAX_REDIRECTS: usize = 10;
/// Body bytes kept; leaves room for the truncation note under the output cap
pub const MAX_BODY_BYTES: usize = MAX_OUTPUT_BYTES - 1024;

enum Fetched {
    Body {
        url: reqwest::Url,
        status: reqwest::StatusCode,
        content_type: Option<String>,
        body: String,
    },
    Denied(String),
}

/// Read at most `MAX_BODY_BYTES` of the body
async fn read_capped(response: reqwest::Response) -> reqwest::Result<String> {
    let mut body = Vec::new();
    let mut truncated = false;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let room = MAX_BODY_BYTES - body.len();
        if chunk.len() > room {
            body.extend_from_slice(&chunk[..room]);
            truncated = true;
            break;
        }
        body.extend_from_slice(&chunk);
    }
    let mut text = String::from_utf8_lossy(&body).into_owned();
    if truncated {
        text.push_str(&format!("\n\n[output truncated at {} bytes]", MAX_BODY_BYTES));
    }
    Ok(text)
}

pub struct WebFetchTool {
    client: reqwest::Client,
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

impl WebFetchTool {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("a3s-converse/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }

    /// Use a custom client. It must not follow redirects itself, or hops
    /// would bypass the per-hop permission check.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch(&self, mut url: reqwest::Url, ctx: &ToolContext) -> Result<Fetched> {
        for _ in 0..=MAX_REDIRECTS {
            let decision = ctx.permissions.check(Capability::Web, Some(url.as_str())).await;
            if !decision.allowed {
                return Ok(Fetched::Denied(decision.denial_message()));
            }

            ctx.log(format!("fetching {}", url));
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .with_context(|| format!("Request to {} failed", url))?;
            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok());
                if let Some(location) = location {
                    let next = url
                        .join(location)
                        .with_context(|| format!("Invalid redirect location: {}", location))?;
                    if !matches!(next.scheme(), "http" | "https") {
                        anyhow::bail!("Unsupported redirect scheme: {}", next.scheme());
                    }
                    tracing::debug!(from = %url, to = %next, "following redirect");
                    url = next;
                    continue;
                }
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = read_capped(response)
                .await
                .with_context(|| format!("Failed to read body from {}", url))?;
            return Ok(Fetched::Body {
                url,
                status,
                content_type,
                body,
            });
        }
        anyhow::bail!("Too many redirects (more than {})", MAX_REDIRECTS)
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL over HTTP(S) and return the response body as text."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "http:// or https:// URL"}
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let raw = required_str(args, "url")?;
        let url = reqwest::Url::parse(raw).with_context(|| format!("Invalid URL: {}", raw))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("Unsupported URL scheme: {}", url.scheme());
        }

        let fetched = tokio::select! {
            _ = ctx.cancel.cancelled() => anyhow::bail!("Fetch cancelled: {}", url),
            result = self.fetch(url.clone(), ctx) => result?,
        };
        let (url, status, content_type, body) = match fetched {
            Fetched::Denied(message) => return Ok(ToolOutput::success(message)),
            Fetched::Body {
                url,
                status,
                content_type,
                body,
            } => (url, status, content_type, body),
        };

        let metadata = serde_json::json!({
            "status": status.as_u16(),
            "content_type": content_type,
        });
        let output = if status.is_success() {
            ToolOutput::success(body)
        } else {
            ToolOutput::error(format!("HTTP {}: {}", status.as_u16(), body))
        };
        Ok(output.with_title(url.to_string()).with_metadata(metadata))
    }
}
