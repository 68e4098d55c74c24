//! Provider adapters: one canonical streaming contract over many LLM backends
//!
//! Every backend (Anthropic Messages, OpenAI Chat Completions, Bedrock
//! Converse) is decoded by its own adapter into the shared [`StreamEvent`]
//! union. The orchestrator only ever consumes that canonical form.
//!
//! Error policy:
//! - non-2xx responses become a single [`StreamEvent::Error`] carrying the raw body
//! - network failures are returned (or yielded) as [`ConverseError::Transport`]
//! - when the cancellation token fires the stream ends without further events

pub mod anthropic;
pub mod assemble;
pub mod bedrock;
pub mod openai;
pub mod retry;
pub mod sse;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{ConverseError, Result};
use crate::message::{Message, TokenUsage};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use anthropic::AnthropicProvider;
pub use assemble::{AssembledMessage, AssemblerUpdate, MessageAssembler};
pub use bedrock::BedrockProvider;
pub use openai::OpenAiProvider;
pub use retry::RetryConfig;

/// A string wrapper that redacts its value in Debug and Display output.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Access the secret value (only for request headers and signing)
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SecretString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// Request Types
// ============================================================================

/// Tool definition advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool input
    pub parameters: serde_json::Value,
}

/// Sampling parameters for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    pub max_tokens: u32,
}

/// Default max tokens for model responses
pub const DEFAULT_MAX_TOKENS: u32 = 8192;

impl GenerationParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

/// Everything a backend needs to produce one streamed response
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub messages: Vec<Message>,
    pub system: Option<String>,
    pub tools: Vec<ToolDefinition>,
    pub params: GenerationParams,
}

impl ProviderRequest {
    pub fn new(messages: Vec<Message>, params: GenerationParams) -> Self {
        Self {
            messages,
            system: None,
            tools: Vec::new(),
            params,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// System prompt with any system-role transcript messages folded in.
    ///
    /// None of the supported backends accept system messages inline, so the
    /// adapters send this combined prompt instead.
    pub fn effective_system(&self) -> Option<String> {
        let mut parts: Vec<String> = Vec::new();
        if let Some(system) = &self.system {
            if !system.is_empty() {
                parts.push(system.clone());
            }
        }
        for msg in &self.messages {
            if msg.role == crate::message::Role::System {
                parts.push(msg.text());
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}

// ============================================================================
// Canonical Stream Events
// ============================================================================

/// Kind of block being opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockStart {
    Text,
    ToolUse { id: String, name: String },
}

/// Incremental payload for an open block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Delta {
    Text(String),
    /// Raw JSON fragment of a tool call's input
    InputJson(String),
}

/// Backend-agnostic fragment of a streaming model response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        id: Option<String>,
        model: Option<String>,
        usage: Option<TokenUsage>,
    },
    ContentBlockStart {
        index: usize,
        block: BlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: Delta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: Option<String>,
        usage: Option<TokenUsage>,
    },
    Error {
        status: Option<u16>,
        message: String,
    },
}

impl StreamEvent {
    pub fn error(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Error {
            status,
            message: message.into(),
        }
    }
}

/// Lazily produced, finite, non-restartable sequence of canonical events
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Core trait for LLM backends
#[async_trait]
pub trait Provider: Send + Sync {
    /// Backend name (e.g. "anthropic", "openai", "bedrock")
    fn name(&self) -> &str;

    /// Model identifier requests default to
    fn model(&self) -> &str;

    /// Issue one streaming request.
    ///
    /// Returns `Err` only for network-level failures before the response
    /// starts; HTTP error statuses surface as a single `Error` event.
    async fn stream(&self, request: &ProviderRequest, cancel: CancellationToken)
        -> Result<EventStream>;
}

/// A stream that yields nothing (used when cancelled before the response)
pub(crate) fn empty_stream() -> EventStream {
    Box::pin(futures::stream::empty())
}

/// A stream that yields one error event and ends
pub(crate) fn error_stream(status: Option<u16>, message: impl Into<String>) -> EventStream {
    Box::pin(futures::stream::iter(vec![Ok(StreamEvent::error(
        status, message,
    ))]))
}

/// Normalize base URL by stripping trailing /v1 and slashes
pub(crate) fn normalize_base_url(base_url: &str) -> String {
    base_url
        .trim_end_matches('/')
        .trim_end_matches("/v1")
        .trim_end_matches('/')
        .to_string()
}

/// Map a request-phase failure: cancellation ends the stream quietly,
/// rejected statuses become an error event, everything else propagates.
pub(crate) fn settle_request(
    result: Result<retry::RetryOutcome<reqwest::Response>>,
) -> Result<std::result::Result<reqwest::Response, EventStream>> {
    match result {
        Ok(retry::RetryOutcome::Success(resp)) => Ok(Ok(resp)),
        Ok(retry::RetryOutcome::Rejected { status, body }) => {
            Ok(Err(error_stream(Some(status), body)))
        }
        Err(ConverseError::Cancelled) => Ok(Err(empty_stream())),
        Err(e) => Err(e),
    }
}

/// Build a provider from configuration
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    let provider: Arc<dyn Provider> = match config.kind {
        ProviderKind::Anthropic => {
            let mut p = AnthropicProvider::new(config.api_key.clone(), config.model.clone())
                .with_retry_config(config.retry.clone());
            if let Some(url) = &config.base_url {
                p = p.with_base_url(url);
            }
            Arc::new(p)
        }
        ProviderKind::OpenAi => {
            let mut p = OpenAiProvider::new(config.api_key.clone(), config.model.clone())
                .with_retry_config(config.retry.clone());
            if let Some(url) = &config.base_url {
                p = p.with_base_url(url);
            }
            Arc::new(p)
        }
        ProviderKind::Bedrock => {
            let credentials = config.aws.clone().ok_or_else(|| {
                ConverseError::Config("bedrock provider requires AWS credentials".to_string())
            })?;
            let region = config
                .region
                .clone()
                .unwrap_or_else(|| bedrock::DEFAULT_REGION.to_string());
            let mut p = BedrockProvider::new(credentials, region, config.model.clone())
                .with_retry_config(config.retry.clone());
            if let Some(url) = &config.base_url {
                p = p.with_endpoint(url);
            }
            Arc::new(p)
        }
    };
    tracing::debug!(provider = provider.name(), model = provider.model(), "Created provider");
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AwsCredentials;
    use crate::message::Role;
    use futures::StreamExt;

    #[test]
    fn test_secret_string_redacts() {
        let s = SecretString::new("sk-secret");
        assert_eq!(format!("{:?}", s), "[REDACTED]");
        assert_eq!(format!("{}", s), "[REDACTED]");
        assert_eq!(s.expose(), "sk-secret");
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("https://api.x.com/v1/"), "https://api.x.com");
        assert_eq!(normalize_base_url("https://api.x.com/"), "https://api.x.com");
        assert_eq!(normalize_base_url("http://127.0.0.1:9000"), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_effective_system_folds_system_messages() {
        let request = ProviderRequest::new(
            vec![Message::system("Be terse."), Message::user("hi")],
            GenerationParams::new("m"),
        )
        .with_system("You are a coding assistant.");
        assert_eq!(
            request.effective_system().as_deref(),
            Some("You are a coding assistant.\n\nBe terse.")
        );
        assert_eq!(request.messages[0].role, Role::System);

        let bare = ProviderRequest::new(vec![Message::user("hi")], GenerationParams::new("m"));
        assert!(bare.effective_system().is_none());
    }

    #[test]
    fn test_stream_event_serde_tagging() {
        let event = StreamEvent::ContentBlockDelta {
            index: 1,
            delta: Delta::InputJson("{\"a\"".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "content_block_delta");
        assert_eq!(json["delta"]["type"], "input_json");
    }

    #[tokio::test]
    async fn test_error_stream_yields_single_event() {
        let events: Vec<_> = error_stream(Some(529), "overloaded").collect().await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            Ok(StreamEvent::Error { status, message }) => {
                assert_eq!(*status, Some(529));
                assert_eq!(message, "overloaded");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_create_provider_by_kind() {
        let config = ProviderConfig::new(ProviderKind::Anthropic, "claude-sonnet-4");
        assert_eq!(create_provider(&config).unwrap().name(), "anthropic");

        let config = ProviderConfig::new(ProviderKind::OpenAi, "gpt-4o");
        assert_eq!(create_provider(&config).unwrap().name(), "openai");

        let config = ProviderConfig::new(ProviderKind::Bedrock, "anthropic.claude-v2");
        assert!(matches!(
            create_provider(&config),
            Err(ConverseError::Config(_))
        ));

        let mut config = ProviderConfig::new(ProviderKind::Bedrock, "anthropic.claude-v2");
        config.aws = Some(AwsCredentials::new("AKID", "secret"));
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.name(), "bedrock");
        assert_eq!(provider.model(), "anthropic.claude-v2");
    }
}
