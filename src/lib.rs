//! # a3s-converse
//!
//! Conversation orchestration engine for AI coding assistants.
//!
//! ## Overview
//!
//! `a3s-converse` runs the "model → tool call → tool result → model" loop
//! behind a coding assistant. It normalizes streaming LLM protocols into one
//! event type, gates every tool side effect through a permission policy, and
//! persists the transcript after every step.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use a3s_converse::{
//!     create_provider, FileSessionStore, Orchestrator, PermissionChecker, ProviderConfig,
//!     ProviderKind, ToolRegistry,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> a3s_converse::Result<()> {
//! let config = ProviderConfig::from_env(ProviderKind::Anthropic, "claude-sonnet-4-20250514")?;
//! let store = Arc::new(FileSessionStore::new("/tmp/a3s-sessions").await?);
//! let mut orchestrator = Orchestrator::new(
//!     create_provider(&config)?,
//!     Arc::new(ToolRegistry::with_builtins()),
//!     store,
//!     Arc::new(PermissionChecker::permissive()),
//!     ".",
//! );
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel::<a3s_converse::UiEvent>(64);
//! tokio::spawn(async move {
//!     while let Some(event) = rx.recv().await {
//!         println!("{}", event.kind());
//!     }
//! });
//!
//! let outcome = orchestrator
//!     .process("list the rust files", CancellationToken::new(), tx)
//!     .await?;
//! println!("{:?} after {} turns", outcome.status, outcome.turns);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Provider** trait: Anthropic, OpenAI-compatible and Bedrock adapters
//!   producing canonical [`StreamEvent`]s
//! - **Orchestrator**: turn loop with turn bound, doom-loop detection and cancellation
//! - **PermissionChecker**: allow/deny/ask policy over capabilities and targets
//! - **ToolRegistry**: built-in file, search, shell, web, todo and question tools
//! - **SessionStore** trait: file and in-memory transcript persistence

pub mod config;
pub mod error;
pub mod logging;
pub mod message;
pub mod orchestrator;
pub mod permissions;
pub mod prompter;
pub mod provider;
pub mod store;
pub mod tools;

// Re-export core types
pub use config::{AwsCredentials, EngineConfig, ProviderConfig, ProviderKind};
pub use error::{ConverseError, Result};
pub use message::{ContentBlock, Message, Role, Session, TokenUsage, ToolCall, ToolUseStatus};
pub use orchestrator::{
    CompletionStatus, Orchestrator, OrchestratorConfig, OrchestratorState, ProcessOutcome,
    UiEvent,
};
pub use permissions::{
    Capability, ConfirmationHandler, PermissionAction, PermissionChecker, PermissionDecision,
    PermissionPolicy, PermissionRule,
};
pub use prompter::{PromptReply, Prompter, QuestionHandler};
pub use provider::{
    create_provider, EventStream, GenerationParams, Provider, ProviderRequest, StreamEvent,
};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore, SessionSummary};
pub use tools::{Tool, ToolContext, ToolOutput, ToolRegistry, ToolResult};
