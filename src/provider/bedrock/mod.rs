//! AWS Bedrock Converse Stream adapter
//!
//! Requests are signed with SigV4 on every attempt. The response body is a
//! binary event stream whose JSON payloads map onto canonical events.

pub mod eventstream;
pub mod sigv4;

use self::eventstream::{Frame, FrameDecoder};
use self::sigv4::{SignableRequest, SigningParams};
use super::retry::{send_with_retry, RetryConfig};
use super::{
    normalize_base_url, settle_request, BlockStart, Delta, EventStream, Provider, ProviderRequest,
    StreamEvent,
};
use crate::config::AwsCredentials;
use crate::error::{ConverseError, Result};
use crate::message::{ContentBlock, Role, TokenUsage};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub const DEFAULT_REGION: &str = "us-east-1";
const SERVICE: &str = "bedrock";
const EVENTSTREAM_CONTENT_TYPE: &str = "application/vnd.amazon.eventstream";

/// Bedrock provider using the Converse Stream API
pub struct BedrockProvider {
    credentials: AwsCredentials,
    region: String,
    model: String,
    endpoint: String,
    client: reqwest::Client,
    retry_config: RetryConfig,
}

impl BedrockProvider {
    pub fn new(
        credentials: AwsCredentials,
        region: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let region = region.into();
        Self {
            credentials,
            endpoint: format!("https://bedrock-runtime.{}.amazonaws.com", region),
            region,
            model: model.into(),
            client: reqwest::Client::new(),
            retry_config: RetryConfig::default(),
        }
    }

    /// Override the runtime endpoint (VPC endpoints, local test servers)
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = normalize_base_url(endpoint);
        self
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn model_for<'a>(&'a self, request: &'a ProviderRequest) -> &'a str {
        if request.params.model.is_empty() {
            &self.model
        } else {
            &request.params.model
        }
    }

    pub(crate) fn request_url(&self, model: &str) -> Result<reqwest::Url> {
        let raw = format!(
            "{}/model/{}/converse-stream",
            self.endpoint,
            sigv4::uri_encode(model, true)
        );
        reqwest::Url::parse(&raw)
            .map_err(|e| ConverseError::Config(format!("Invalid Bedrock endpoint {}: {}", raw, e)))
    }

    pub(crate) fn build_request(&self, request: &ProviderRequest) -> serde_json::Value {
        let mut inference = serde_json::json!({ "maxTokens": request.params.max_tokens });
        if let Some(temperature) = request.params.temperature {
            inference["temperature"] = serde_json::json!(temperature);
        }

        let mut body = serde_json::json!({
            "messages": convert_messages(request),
            "inferenceConfig": inference,
        });
        if let Some(system) = request.effective_system() {
            body["system"] = serde_json::json!([{ "text": system }]);
        }
        if !request.tools.is_empty() {
            body["toolConfig"] = serde_json::json!({
                "tools": request
                    .tools
                    .iter()
                    .map(|t| serde_json::json!({
                        "toolSpec": {
                            "name": t.name,
                            "description": t.description,
                            "inputSchema": { "json": t.parameters },
                        }
                    }))
                    .collect::<Vec<_>>(),
            });
        }
        body
    }

    /// Headers for one attempt, signature included
    pub(crate) fn signed_headers(
        &self,
        url: &reqwest::Url,
        payload: &[u8],
        timestamp: chrono::DateTime<Utc>,
    ) -> Result<Vec<(String, String)>> {
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ConverseError::Config(format!("Endpoint has no host: {}", url)))
            }
        };

        let mut headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("host".to_string(), host),
            ("x-amz-date".to_string(), sigv4::amz_date(&timestamp)),
        ];
        if let Some(token) = &self.credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.expose().to_string()));
        }

        let payload_hash = sigv4::sha256_hex(payload);
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let signature = sigv4::sign(
            &SignableRequest {
                method: "POST",
                path: url.path(),
                query: &query,
                headers: &headers,
                payload_hash: &payload_hash,
            },
            &SigningParams {
                credentials: &self.credentials,
                region: &self.region,
                service: SERVICE,
                timestamp,
            },
        )?;

        headers.push(("authorization".to_string(), signature.authorization));
        // reqwest derives Host from the URL
        headers.retain(|(name, _)| name != "host");
        Ok(headers)
    }
}

fn convert_messages(request: &ProviderRequest) -> Vec<serde_json::Value> {
    request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .filter_map(|msg| {
            let content: Vec<serde_json::Value> =
                msg.content.iter().filter_map(convert_block).collect();
            if content.is_empty() {
                return None;
            }
            Some(serde_json::json!({
                "role": msg.role.to_string(),
                "content": content,
            }))
        })
        .collect()
}

fn convert_block(block: &ContentBlock) -> Option<serde_json::Value> {
    let value = match block {
        ContentBlock::Text { text } if text.is_empty() => return None,
        ContentBlock::Text { text } => serde_json::json!({ "text": text }),
        ContentBlock::Image { media_type, data } => {
            let format = media_type.rsplit('/').next().unwrap_or(media_type.as_str());
            serde_json::json!({
                "image": { "format": format, "source": { "bytes": data } }
            })
        }
        ContentBlock::ToolUse { id, name, input, .. } => serde_json::json!({
            "toolUse": { "toolUseId": id, "name": name, "input": input }
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            output,
            is_error,
        } => serde_json::json!({
            "toolResult": {
                "toolUseId": tool_use_id,
                "content": [{ "text": output }],
                "status": if *is_error { "error" } else { "success" },
            }
        }),
        ContentBlock::Error { message } => {
            serde_json::json!({ "text": format!("[error] {}", message) })
        }
    };
    Some(value)
}

#[async_trait]
impl Provider for BedrockProvider {
    fn name(&self) -> &str {
        "bedrock"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(
        &self,
        request: &ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        let span = tracing::info_span!(
            "a3s.llm.request",
            "a3s.llm.provider" = "bedrock",
            "a3s.llm.model" = %self.model,
            "a3s.llm.region" = %self.region,
            "a3s.llm.status" = tracing::field::Empty,
        );
        async {
            let model = self.model_for(request).to_string();
            let url = self.request_url(&model)?;
            let payload = serde_json::to_vec(&self.build_request(request))?;

            let outcome = send_with_retry(&self.retry_config, &cancel, |_attempt| {
                let headers = self.signed_headers(&url, &payload, Utc::now())?;
                let mut builder = self
                    .client
                    .post(url.clone())
                    .header("accept", EVENTSTREAM_CONTENT_TYPE)
                    .body(payload.clone());
                for (name, value) in headers {
                    builder = builder.header(name, value);
                }
                Ok(builder)
            })
            .await;

            match settle_request(outcome)? {
                Ok(response) => {
                    tracing::Span::current().record("a3s.llm.status", response.status().as_u16());
                    Ok(translate_frames(
                        response.bytes_stream(),
                        cancel,
                        BedrockTranslator::new(model),
                    ))
                }
                Err(stream) => Ok(stream),
            }
        }
        .instrument(span)
        .await
    }
}

/// Drive a binary event-stream body through the frame decoder and translator
pub(crate) fn translate_frames<S, E>(
    body: S,
    cancel: CancellationToken,
    mut translator: BedrockTranslator,
) -> EventStream
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut body = Box::pin(body);
        let mut decoder = FrameDecoder::new();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("Bedrock stream cancelled");
                    return;
                }
                chunk = body.next() => chunk,
            };

            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    yield Err(ConverseError::Transport(format!("Stream read failed: {}", e)));
                    return;
                }
                None => break,
            };

            let frames = match decoder.push(&bytes) {
                Ok(frames) => frames,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            for frame in frames {
                for out in translator.on_frame(&frame) {
                    if cancel.is_cancelled() {
                        return;
                    }
                    yield Ok(out);
                }
            }
        }

        if decoder.pending() > 0 {
            tracing::warn!(bytes = decoder.pending(), "Bedrock stream ended mid-frame");
        }
    })
}

// ============================================================================
// Stream translation
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockStartPayload {
    #[serde(default)]
    content_block_index: usize,
    #[serde(default)]
    start: Option<BlockStartKind>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockStartKind {
    #[serde(default)]
    tool_use: Option<ToolUseStart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUseStart {
    tool_use_id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockDeltaPayload {
    #[serde(default)]
    content_block_index: usize,
    delta: BlockDeltaKind,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockDeltaKind {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    tool_use: Option<ToolUseDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolUseDelta {
    #[serde(default)]
    input: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockStopPayload {
    #[serde(default)]
    content_block_index: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageStopPayload {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetadataPayload {
    #[serde(default)]
    usage: Option<BedrockUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BedrockUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_write_input_tokens: Option<u64>,
}

impl From<BedrockUsage> for TokenUsage {
    fn from(u: BedrockUsage) -> Self {
        TokenUsage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            cache_read_tokens: u.cache_read_input_tokens,
            cache_write_tokens: u.cache_write_input_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExceptionPayload {
    #[serde(default)]
    message: Option<String>,
}

/// Maps Converse Stream frames to canonical events.
///
/// Text blocks have no explicit start event on the wire; the first delta
/// for an unseen index opens one.
#[derive(Debug)]
pub(crate) struct BedrockTranslator {
    model: String,
    open: HashSet<usize>,
}

impl BedrockTranslator {
    pub(crate) fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            open: HashSet::new(),
        }
    }

    pub(crate) fn on_frame(&mut self, frame: &Frame) -> Vec<StreamEvent> {
        match frame.header_str(":message-type").unwrap_or("event") {
            "event" => {}
            "exception" => {
                let kind = frame.header_str(":exception-type").unwrap_or("exception");
                let raw = String::from_utf8_lossy(&frame.payload).into_owned();
                let detail = serde_json::from_slice::<ExceptionPayload>(&frame.payload)
                    .ok()
                    .and_then(|p| p.message)
                    .unwrap_or_default();
                tracing::warn!(exception = kind, "Bedrock stream exception: {}", detail);
                // The payload goes to the UI untouched
                return vec![StreamEvent::error(None, format!("{}: {}", kind, raw))];
            }
            _ => {
                let code = frame.header_str(":error-code").unwrap_or("error");
                let message = frame.header_str(":error-message").unwrap_or_default();
                let mut text = format!("{}: {}", code, message);
                if !frame.payload.is_empty() {
                    text.push(' ');
                    text.push_str(&String::from_utf8_lossy(&frame.payload));
                }
                return vec![StreamEvent::error(None, text)];
            }
        }

        let event_type = frame.header_str(":event-type").unwrap_or_default();
        match self.translate(event_type, &frame.payload) {
            Ok(events) => events,
            Err(e) => {
                tracing::debug!(event_type, "Skipping unparsable Bedrock event: {}", e);
                Vec::new()
            }
        }
    }

    fn translate(
        &mut self,
        event_type: &str,
        payload: &[u8],
    ) -> std::result::Result<Vec<StreamEvent>, serde_json::Error> {
        let events = match event_type {
            "messageStart" => vec![StreamEvent::MessageStart {
                id: None,
                model: Some(self.model.clone()),
                usage: None,
            }],
            "contentBlockStart" => {
                let p: BlockStartPayload = serde_json::from_slice(payload)?;
                let index = p.content_block_index;
                self.open.insert(index);
                let block = match p.start.and_then(|s| s.tool_use) {
                    Some(tool) => BlockStart::ToolUse {
                        id: tool.tool_use_id,
                        name: tool.name,
                    },
                    None => BlockStart::Text,
                };
                vec![StreamEvent::ContentBlockStart { index, block }]
            }
            "contentBlockDelta" => {
                let p: BlockDeltaPayload = serde_json::from_slice(payload)?;
                let index = p.content_block_index;
                let delta = match (p.delta.text, p.delta.tool_use) {
                    (Some(text), _) => Delta::Text(text),
                    (None, Some(tool)) => Delta::InputJson(tool.input),
                    (None, None) => return Ok(Vec::new()),
                };
                let mut out = Vec::new();
                if self.open.insert(index) {
                    out.push(StreamEvent::ContentBlockStart {
                        index,
                        block: BlockStart::Text,
                    });
                }
                out.push(StreamEvent::ContentBlockDelta { index, delta });
                out
            }
            "contentBlockStop" => {
                let p: BlockStopPayload = serde_json::from_slice(payload)?;
                if self.open.remove(&p.content_block_index) {
                    vec![StreamEvent::ContentBlockStop {
                        index: p.content_block_index,
                    }]
                } else {
                    Vec::new()
                }
            }
            "messageStop" => {
                let p: MessageStopPayload = serde_json::from_slice(payload)?;
                vec![StreamEvent::MessageDelta {
                    stop_reason: p.stop_reason,
                    usage: None,
                }]
            }
            "metadata" => {
                let p: MetadataPayload = serde_json::from_slice(payload)?;
                match p.usage {
                    Some(usage) => vec![StreamEvent::MessageDelta {
                        stop_reason: None,
                        usage: Some(usage.into()),
                    }],
                    None => Vec::new(),
                }
            }
            other => {
                tracing::debug!("Ignoring Bedrock event type {}", other);
                Vec::new()
            }
        };
        Ok(events)
    }
}
