//! Anthropic Messages API adapter
//!
//! Native stream events already match the canonical shape, so translation
//! is close to 1:1. Block kinds this engine does not model (thinking,
//! redacted thinking) are skipped along with their deltas.

use super::retry::{send_with_retry, RetryConfig};
use super::sse::{translate_sse, SseEvent, SseTranslator};
use super::{
    normalize_base_url, settle_request, BlockStart, Delta, EventStream, Provider, ProviderRequest,
    SecretString, StreamEvent,
};
use crate::error::Result;
use crate::message::{ContentBlock, Role, TokenUsage};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Anthropic Claude provider
pub struct AnthropicProvider {
    api_key: SecretString,
    model: String,
    base_url: String,
    client: reqwest::Client,
    retry_config: RetryConfig,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<SecretString>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            client: reqwest::Client::new(),
            retry_config: RetryConfig::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = normalize_base_url(base_url);
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

    pub(crate) fn build_request(&self, request: &ProviderRequest) -> serde_json::Value {
        let model = if request.params.model.is_empty() {
            self.model.as_str()
        } else {
            request.params.model.as_str()
        };

        let mut body = serde_json::json!({
            "model": model,
            "max_tokens": request.params.max_tokens,
            "messages": convert_messages(request),
            "stream": true,
        });

        if let Some(system) = request.effective_system() {
            body["system"] = serde_json::json!(system);
        }
        if let Some(temperature) = request.params.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(request
                .tools
                .iter()
                .map(|t| serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                }))
                .collect::<Vec<_>>());
        }
        body
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
        ContentBlock::Text { text } => serde_json::json!({"type": "text", "text": text}),
        ContentBlock::Image { media_type, data } => serde_json::json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data},
        }),
        ContentBlock::ToolUse { id, name, input, .. } => serde_json::json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            output,
            is_error,
        } => serde_json::json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": output,
            "is_error": is_error,
        }),
        ContentBlock::Error { message } => {
            serde_json::json!({"type": "text", "text": format!("[error] {}", message)})
        }
    };
    Some(value)
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
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
            "a3s.llm.provider" = "anthropic",
            "a3s.llm.model" = %self.model,
            "a3s.llm.status" = tracing::field::Empty,
        );
        async {
            let body = self.build_request(request);
            let url = format!("{}/v1/messages", self.base_url);

            let outcome = send_with_retry(&self.retry_config, &cancel, |_attempt| {
                Ok(self
                    .client
                    .post(url.as_str())
                    .header("x-api-key", self.api_key.expose())
                    .header("anthropic-version", API_VERSION)
                    .header("accept", "text/event-stream")
                    .json(&body))
            })
            .await;

            match settle_request(outcome)? {
                Ok(response) => {
                    tracing::Span::current().record("a3s.llm.status", response.status().as_u16());
                    Ok(translate_sse(
                        response.bytes_stream(),
                        cancel,
                        AnthropicTranslator::default(),
                    ))
                }
                Err(stream) => Ok(stream),
            }
        }
        .instrument(span)
        .await
    }
}

// ============================================================================
// Stream translation
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart {
        message: AnthropicMessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: AnthropicContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: AnthropicDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: AnthropicMessageDeltaData,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: AnthropicError,
    },
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageStart {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDeltaData {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}

impl From<AnthropicUsage> for TokenUsage {
    fn from(u: AnthropicUsage) -> Self {
        TokenUsage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            cache_read_tokens: u.cache_read_input_tokens,
            cache_write_tokens: u.cache_creation_input_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default)]
pub(crate) struct AnthropicTranslator {
    skipped: HashSet<usize>,
}

impl SseTranslator for AnthropicTranslator {
    fn on_event(&mut self, event: SseEvent) -> Vec<StreamEvent> {
        if event.data == "[DONE]" {
            return Vec::new();
        }
        let parsed: AnthropicStreamEvent = match serde_json::from_str(&event.data) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!("Skipping unparsable Anthropic event: {} ({})", event.data, e);
                return Vec::new();
            }
        };

        match parsed {
            AnthropicStreamEvent::MessageStart { message } => vec![StreamEvent::MessageStart {
                id: message.id,
                model: message.model,
                usage: message.usage.map(TokenUsage::from),
            }],
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                AnthropicContentBlock::Text { text } => {
                    let mut out = vec![StreamEvent::ContentBlockStart {
                        index,
                        block: BlockStart::Text,
                    }];
                    if !text.is_empty() {
                        out.push(StreamEvent::ContentBlockDelta {
                            index,
                            delta: Delta::Text(text),
                        });
                    }
                    out
                }
                AnthropicContentBlock::ToolUse { id, name } => vec![StreamEvent::ContentBlockStart {
                    index,
                    block: BlockStart::ToolUse { id, name },
                }],
                AnthropicContentBlock::Unsupported => {
                    self.skipped.insert(index);
                    Vec::new()
                }
            },
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
                if self.skipped.contains(&index) {
                    return Vec::new();
                }
                let delta = match delta {
                    AnthropicDelta::TextDelta { text } => Delta::Text(text),
                    AnthropicDelta::InputJsonDelta { partial_json } => Delta::InputJson(partial_json),
                    AnthropicDelta::Unsupported => return Vec::new(),
                };
                vec![StreamEvent::ContentBlockDelta { index, delta }]
            }
            AnthropicStreamEvent::ContentBlockStop { index } => {
                if self.skipped.remove(&index) {
                    return Vec::new();
                }
                vec![StreamEvent::ContentBlockStop { index }]
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => vec![StreamEvent::MessageDelta {
                stop_reason: delta.stop_reason,
                usage: usage.map(TokenUsage::from),
            }],
            AnthropicStreamEvent::MessageStop | AnthropicStreamEvent::Ping => Vec::new(),
            AnthropicStreamEvent::Error { error } => {
                tracing::warn!(error_type = %error.error_type, "Anthropic stream error: {}", error.message);
                vec![StreamEvent::error(None, event.data)]
            }
        }
    }
}
