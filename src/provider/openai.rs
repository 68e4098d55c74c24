//! OpenAI Chat Completions adapter (also serves OpenAI-compatible backends)
//!
//! Chat Completions streams flat deltas: text arrives as `content` and tool
//! calls as indexed `tool_calls` whose `arguments` are concatenated string
//! fragments. The translator opens canonical blocks on first sight and closes
//! them all when `finish_reason` (or `[DONE]`) arrives.

use super::retry::{send_with_retry, RetryConfig};
use super::sse::{translate_sse, SseEvent, SseTranslator};
use super::{
    normalize_base_url, settle_request, BlockStart, Delta, EventStream, Provider, ProviderRequest,
    SecretString, StreamEvent,
};
use crate::error::Result;
use crate::message::{ContentBlock, Message, Role, TokenUsage};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI provider
pub struct OpenAiProvider {
    api_key: SecretString,
    model: String,
    base_url: String,
    client: reqwest::Client,
    retry_config: RetryConfig,
}

impl OpenAiProvider {
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

        let mut messages = Vec::new();
        if let Some(system) = request.effective_system() {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for msg in request.messages.iter().filter(|m| m.role != Role::System) {
            messages.extend(convert_message(msg));
        }

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.params.max_tokens,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(temperature) = request.params.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(request
                .tools
                .iter()
                .map(|t| serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                }))
                .collect::<Vec<_>>());
        }
        body
    }
}

/// One transcript message may fan out into several Chat Completions
/// messages, since each tool result is its own `tool` message.
fn convert_message(msg: &Message) -> Vec<serde_json::Value> {
    if msg.role == Role::Assistant {
        let text = msg.text();
        let tool_calls: Vec<serde_json::Value> = msg
            .tool_calls()
            .into_iter()
            .map(|tc| {
                serde_json::json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {"name": tc.name, "arguments": tc.input.to_string()},
                })
            })
            .collect();
        let mut out = serde_json::json!({
            "role": "assistant",
            "content": if text.is_empty() { serde_json::Value::Null } else { serde_json::json!(text) },
        });
        if !tool_calls.is_empty() {
            out["tool_calls"] = serde_json::json!(tool_calls);
        }
        return vec![out];
    }

    let mut out = Vec::new();
    let mut parts = Vec::new();
    let mut has_image = false;
    for block in &msg.content {
        match block {
            ContentBlock::ToolResult {
                tool_use_id,
                output,
                ..
            } => out.push(serde_json::json!({
                "role": "tool",
                "tool_call_id": tool_use_id,
                "content": output,
            })),
            ContentBlock::Text { text } => {
                parts.push(serde_json::json!({"type": "text", "text": text}));
            }
            ContentBlock::Image { media_type, data } => {
                has_image = true;
                parts.push(serde_json::json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:{};base64,{}", media_type, data)},
                }));
            }
            ContentBlock::Error { message } => {
                parts.push(serde_json::json!({"type": "text", "text": format!("[error] {}", message)}));
            }
            ContentBlock::ToolUse { .. } => {}
        }
    }

    if !parts.is_empty() {
        let content = if has_image {
            serde_json::json!(parts)
        } else {
            serde_json::json!(parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join(""))
        };
        out.push(serde_json::json!({"role": "user", "content": content}));
    }
    out
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
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
            "a3s.llm.provider" = "openai",
            "a3s.llm.model" = %self.model,
            "a3s.llm.status" = tracing::field::Empty,
        );
        async {
            let body = self.build_request(request);
            let url = format!("{}/v1/chat/completions", self.base_url);

            let outcome = send_with_retry(&self.retry_config, &cancel, |_attempt| {
                Ok(self
                    .client
                    .post(url.as_str())
                    .header("Authorization", format!("Bearer {}", self.api_key.expose()))
                    .json(&body))
            })
            .await;

            match settle_request(outcome)? {
                Ok(response) => {
                    tracing::Span::current().record("a3s.llm.status", response.status().as_u16());
                    Ok(translate_sse(
                        response.bytes_stream(),
                        cancel,
                        OpenAiTranslator::default(),
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
struct ChatChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    delta: Option<ChatDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChatFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct ChatFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn map_finish_reason(reason: &str) -> String {
    match reason {
        "stop" => "end_turn".to_string(),
        "tool_calls" | "function_call" => "tool_use".to_string(),
        "length" => "max_tokens".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Default)]
pub(crate) struct OpenAiTranslator {
    started: bool,
    next_index: usize,
    text_index: Option<usize>,
    /// OpenAI tool_call index -> canonical block index
    tool_indices: BTreeMap<usize, usize>,
    closed: bool,
}

impl OpenAiTranslator {
    fn close_all(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if let Some(index) = self.text_index.take() {
            out.push(StreamEvent::ContentBlockStop { index });
        }
        for (_, index) in std::mem::take(&mut self.tool_indices) {
            out.push(StreamEvent::ContentBlockStop { index });
        }
        out
    }

    fn allocate(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }
}

impl SseTranslator for OpenAiTranslator {
    fn on_event(&mut self, event: SseEvent) -> Vec<StreamEvent> {
        if event.data == "[DONE]" {
            return self.finish();
        }
        let chunk: ChatChunk = match serde_json::from_str(&event.data) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!("Skipping unparsable OpenAI chunk: {} ({})", event.data, e);
                return Vec::new();
            }
        };
        if chunk.error.is_some() {
            return vec![StreamEvent::error(None, event.data)];
        }

        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            out.push(StreamEvent::MessageStart {
                id: chunk.id.clone(),
                model: chunk.model.clone(),
                usage: None,
            });
        }

        for choice in chunk.choices {
            let delta = choice.delta.unwrap_or_default();

            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                let index = match self.text_index {
                    Some(i) => i,
                    None => {
                        let i = self.allocate();
                        self.text_index = Some(i);
                        out.push(StreamEvent::ContentBlockStart {
                            index: i,
                            block: BlockStart::Text,
                        });
                        i
                    }
                };
                out.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::Text(text),
                });
            }

            for call in delta.tool_calls {
                let (name, arguments) = match call.function {
                    Some(f) => (f.name, f.arguments),
                    None => (None, None),
                };
                let index = match self.tool_indices.get(&call.index) {
                    Some(i) => *i,
                    None => {
                        let i = self.allocate();
                        self.tool_indices.insert(call.index, i);
                        out.push(StreamEvent::ContentBlockStart {
                            index: i,
                            block: BlockStart::ToolUse {
                                id: call.id.unwrap_or_else(|| format!("call_{}", i)),
                                name: name.unwrap_or_default(),
                            },
                        });
                        i
                    }
                };
                if let Some(fragment) = arguments.filter(|a| !a.is_empty()) {
                    out.push(StreamEvent::ContentBlockDelta {
                        index,
                        delta: Delta::InputJson(fragment),
                    });
                }
            }

            if let Some(reason) = choice.finish_reason {
                out.extend(self.close_all());
                self.closed = true;
                out.push(StreamEvent::MessageDelta {
                    stop_reason: Some(map_finish_reason(&reason)),
                    usage: None,
                });
            }
        }

        if let Some(usage) = chunk.usage {
            out.push(StreamEvent::MessageDelta {
                stop_reason: None,
                usage: Some(TokenUsage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                    ..Default::default()
                }),
            });
        }
        out
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        self.close_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{GenerationParams, MessageAssembler};

    fn sse(data: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_convert_tool_results_fan_out() {
        let msg = Message::tool_results(vec![
            ContentBlock::tool_result("a", "one", false),
            ContentBlock::tool_result("b", "two", true),
        ]);
        let out = convert_message(&msg);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["role"], "tool");
        assert_eq!(out[1]["tool_call_id"], "b");
    }

    #[test]
    fn test_convert_assistant_tool_calls() {
        let msg = Message::assistant(vec![ContentBlock::ToolUse {
            id: "call_1".into(),
            name: "glob".into(),
            input: serde_json::json!({"pattern": "*.rs"}),
            status: Default::default(),
        }]);
        let out = convert_message(&msg);
        assert!(out[0]["content"].is_null());
        assert_eq!(out[0]["tool_calls"][0]["function"]["name"], "glob");
        assert_eq!(
            out[0]["tool_calls"][0]["function"]["arguments"],
            "{\"pattern\":\"*.rs\"}"
        );
    }

    #[test]
    fn test_convert_multipart_user_message() {
        let msg = Message::new(
            Role::User,
            vec![
                ContentBlock::text("what is this?"),
                ContentBlock::Image {
                    media_type: "image/png".into(),
                    data: "AAAA".into(),
                },
            ],
        );
        let out = convert_message(&msg);
        assert_eq!(out[0]["content"][1]["type"], "image_url");
        assert_eq!(
            out[0]["content"][1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );

        let plain = convert_message(&Message::user("hi"));
        assert_eq!(plain[0]["content"], "hi");
    }

    #[test]
    fn test_build_request_includes_system_and_tools() {
        let provider = OpenAiProvider::new("k", "gpt-4o");
        let request = ProviderRequest::new(vec![Message::user("hi")], GenerationParams::new(""))
            .with_system("sys")
            .with_tools(vec![crate::provider::ToolDefinition {
                name: "bash".into(),
                description: "Run".into(),
                parameters: serde_json::json!({"type": "object"}),
            }]);
        let body = provider.build_request(&request);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["tools"][0]["function"]["name"], "bash");
    }

    #[test]
    fn test_translate_fragmented_tool_call() {
        let mut t = OpenAiTranslator::default();
        let mut events = Vec::new();
        for data in [
            r#"{"id":"c1","model":"gpt-4o","choices":[{"delta":{"content":"Let me look"}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_9","function":{"name":"glob","arguments":"{\"pat"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"tern\":\"*.ts\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":30,"completion_tokens":9}}"#,
            "[DONE]",
        ] {
            events.extend(t.on_event(sse(data)));
        }

        let mut asm = MessageAssembler::new();
        for e in events {
            asm.push(e);
        }
        let assembled = asm.finish();
        assert_eq!(assembled.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(assembled.usage.input_tokens, 30);
        let msg = assembled.into_message();
        assert_eq!(msg.text(), "Let me look");
        let calls = msg.tool_calls();
        assert_eq!(calls[0].id, "call_9");
        assert_eq!(calls[0].input["pattern"], "*.ts");
    }

    #[test]
    fn test_finish_closes_blocks_without_done() {
        let mut t = OpenAiTranslator::default();
        t.on_event(sse(r#"{"choices":[{"delta":{"content":"hi"}}]}"#));
        let tail = t.finish();
        assert_eq!(tail, vec![StreamEvent::ContentBlockStop { index: 0 }]);
        assert!(t.finish().is_empty());
    }

    #[test]
    fn test_inline_error_payload() {
        let mut t = OpenAiTranslator::default();
        let raw = r#"{"error":{"message":"context length exceeded"}}"#;
        assert_eq!(t.on_event(sse(raw)), vec![StreamEvent::error(None, raw)]);
    }

    #[test]
    fn test_map_finish_reason() {
        assert_eq!(map_finish_reason("stop"), "end_turn");
        assert_eq!(map_finish_reason("tool_calls"), "tool_use");
        assert_eq!(map_finish_reason("length"), "max_tokens");
        assert_eq!(map_finish_reason("content_filter"), "content_filter");
    }
}
