//! Conversation orchestrator
//!
//! Drives one conversation through the model/tool loop:
//!
//! ```text
//! AwaitingUserInput -> ModelTurn -> (ToolExecution -> ModelTurn)* -> AwaitingUserInput
//!                                \-> Aborted | Failed
//! ```
//!
//! Every assistant message and every batch of tool results is persisted
//! before the loop moves on, so a transcript in the store is always a valid
//! prefix of the conversation. Each `tool_use` is answered by exactly one
//! `tool_result`, including calls skipped because of cancellation.

mod doom_loop;
mod events;

pub use doom_loop::{
    DoomLoopDetector, RepeatedCall, DEFAULT_DOOM_LOOP_THRESHOLD, DEFAULT_DOOM_LOOP_WINDOW,
};
pub use events::UiEvent;

use crate::error::{ConverseError, Result};
use crate::message::{ContentBlock, Message, Session, TokenUsage, ToolCall};
use crate::permissions::PermissionChecker;
use crate::prompter::{Prompter, QuestionHandler};
use crate::provider::{
    AssembledMessage, AssemblerUpdate, GenerationParams, MessageAssembler, Provider,
    ProviderRequest,
};
use crate::store::SessionStore;
use crate::tools::{SessionToolState, ToolContext, ToolRegistry};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Default upper bound on model turns per user request
pub const DEFAULT_MAX_TURNS: usize = 50;

/// Output recorded for tool calls skipped by cancellation
pub const CANCELLED_BEFORE_EXECUTION: &str = "cancelled before execution";

/// Tunables for one orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_turns: usize,
    pub system_prompt: Option<String>,
    pub params: GenerationParams,
    pub doom_loop_window: usize,
    pub doom_loop_threshold: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            system_prompt: None,
            params: GenerationParams::new(""),
            doom_loop_window: DEFAULT_DOOM_LOOP_WINDOW,
            doom_loop_threshold: DEFAULT_DOOM_LOOP_THRESHOLD,
        }
    }
}

/// Where the orchestrator is in the turn loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    AwaitingUserInput,
    ModelTurn,
    ToolExecution,
    Aborted,
    Failed,
}

/// How a call to [`Orchestrator::process`] ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompletionStatus {
    /// The model answered without requesting more tools
    Completed,
    /// The configured turn bound was reached
    TurnLimit,
    /// The same tool call kept repeating
    DoomLoop,
    /// The caller cancelled
    Cancelled,
    /// The backend or transport failed; `message` carries its text verbatim
    Failed { message: String },
}

/// Result of one user request
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub status: CompletionStatus,
    /// Last assistant message in the transcript, synthetic warnings included
    pub message: Option<Message>,
    /// Model turns issued for this request
    pub turns: usize,
    pub usage: TokenUsage,
    pub session_id: String,
}

impl ProcessOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == CompletionStatus::Completed
    }
}

/// How one model turn's stream ended
enum TurnOutcome {
    Complete(AssembledMessage),
    Cancelled(MessageAssembler),
    Failed(String),
}

/// Drives one conversation
pub struct Orchestrator {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn SessionStore>,
    permissions: Arc<PermissionChecker>,
    prompter: Option<Arc<Prompter>>,
    config: OrchestratorConfig,
    workspace: PathBuf,
    session_id: Option<String>,
    tool_state: Arc<SessionToolState>,
    state: OrchestratorState,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn SessionStore>,
        permissions: Arc<PermissionChecker>,
        workspace: impl AsRef<Path>,
    ) -> Self {
        let mut config = OrchestratorConfig::default();
        config.params.model = provider.model().to_string();
        Self {
            provider,
            tools,
            store,
            permissions,
            prompter: None,
            config,
            workspace: workspace.as_ref().to_path_buf(),
            session_id: None,
            tool_state: Arc::new(SessionToolState::default()),
            state: OrchestratorState::AwaitingUserInput,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Route confirmations and questions through `prompter`.
    ///
    /// The permission checker must be built with the same prompter as its
    /// confirmer for permission prompts to reach the UI.
    pub fn with_prompter(mut self, prompter: Arc<Prompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    /// Continue an existing session instead of creating one on first use
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Handle one user request until the model stops calling tools or the
    /// loop is stopped.
    ///
    /// `Err` is returned only for store failures; backend problems end in
    /// [`CompletionStatus::Failed`].
    pub async fn process(
        &mut self,
        text: &str,
        cancel: CancellationToken,
        events: mpsc::Sender<UiEvent>,
    ) -> Result<ProcessOutcome> {
        let span = tracing::info_span!(
            "a3s.orchestrator.process",
            "a3s.session.id" = tracing::field::Empty,
            "a3s.orchestrator.turns" = tracing::field::Empty,
            "a3s.orchestrator.status" = tracing::field::Empty,
        );
        let result = self.run(text, cancel, events).instrument(span.clone()).await;
        if let Err(e) = &result {
            self.state = OrchestratorState::Failed;
            tracing::error!(parent: &span, "Conversation processing failed: {}", e);
        }
        result
    }

    async fn run(
        &mut self,
        text: &str,
        cancel: CancellationToken,
        events: mpsc::Sender<UiEvent>,
    ) -> Result<ProcessOutcome> {
        let (mut session, _guard) = self.open_session().await?;
        let span = tracing::Span::current();
        span.record("a3s.session.id", session.id.as_str());

        if let Some(prompter) = &self.prompter {
            prompter.attach(events.clone(), cancel.clone()).await;
        }

        session.push(Message::user(text));
        self.store.update(&mut session).await?;

        let mut base_ctx = ToolContext::new(&self.workspace, self.permissions.clone())
            .with_session_id(session.id.clone())
            .with_cancel(cancel.clone())
            .with_state(self.tool_state.clone());
        if let Some(prompter) = &self.prompter {
            base_ctx = base_ctx.with_questions(prompter.clone() as Arc<dyn QuestionHandler>);
        }

        let detector =
            DoomLoopDetector::new(self.config.doom_loop_window, self.config.doom_loop_threshold);
        let mut usage = TokenUsage::default();
        let mut turns = 0;

        let status = loop {
            if turns >= self.config.max_turns {
                tracing::warn!(max_turns = self.config.max_turns, "Turn limit reached");
                let warning = synthetic_warning(
                    "turn_limit",
                    format!(
                        "Stopped after reaching the limit of {} model turns. \
                         Send another message to continue.",
                        self.config.max_turns
                    ),
                );
                self.persist_assistant(&mut session, warning, &events).await?;
                break CompletionStatus::TurnLimit;
            }
            turns += 1;
            self.state = OrchestratorState::ModelTurn;
            emit(
                &events,
                UiEvent::MessageStart {
                    session_id: session.id.clone(),
                    turn: turns,
                },
            )
            .await;

            let turn_span = tracing::info_span!(
                "a3s.orchestrator.turn",
                "a3s.turn.number" = turns as i64,
                "a3s.llm.input_tokens" = tracing::field::Empty,
                "a3s.llm.output_tokens" = tracing::field::Empty,
                "a3s.llm.stop_reason" = tracing::field::Empty,
            );
            tracing::info!(
                parent: &turn_span,
                turn = turns,
                max_turns = self.config.max_turns,
                "Model turn started"
            );
            let request = self.build_request(&session);
            let outcome = self
                .stream_turn(&request, &cancel, &events)
                .instrument(turn_span.clone())
                .await;

            let assembled = match outcome {
                TurnOutcome::Complete(assembled) => assembled,
                TurnOutcome::Failed(message) => {
                    tracing::warn!(parent: &turn_span, "Model turn failed: {}", message);
                    emit(&events, UiEvent::Error { message: message.clone() }).await;
                    self.state = OrchestratorState::Failed;
                    return Ok(self.outcome(
                        &session,
                        CompletionStatus::Failed { message },
                        turns,
                        usage,
                    ));
                }
                TurnOutcome::Cancelled(assembler) => {
                    self.persist_partial(&mut session, assembler, &mut usage).await?;
                    self.state = OrchestratorState::Aborted;
                    emit(&events, UiEvent::Cancelled { turn: turns }).await;
                    return Ok(self.outcome(&session, CompletionStatus::Cancelled, turns, usage));
                }
            };

            turn_span.record("a3s.llm.input_tokens", assembled.usage.input_tokens as i64);
            turn_span.record("a3s.llm.output_tokens", assembled.usage.output_tokens as i64);
            if let Some(reason) = &assembled.stop_reason {
                turn_span.record("a3s.llm.stop_reason", reason.as_str());
            }
            usage.add(&assembled.usage);
            let turn_usage = assembled.usage.clone();
            let message = assembled.into_message();
            let calls = message.tool_calls();
            self.persist_assistant(&mut session, message, &events).await?;
            emit(
                &events,
                UiEvent::TurnDone {
                    turn: turns,
                    usage: Some(turn_usage),
                },
            )
            .await;

            if calls.is_empty() {
                break CompletionStatus::Completed;
            }

            self.state = OrchestratorState::ToolExecution;
            let results = self
                .run_tools(&calls, &base_ctx, &events)
                .instrument(turn_span.clone())
                .await;
            session.push(Message::tool_results(results));
            self.store.update(&mut session).await?;

            if cancel.is_cancelled() {
                self.state = OrchestratorState::Aborted;
                emit(&events, UiEvent::Cancelled { turn: turns }).await;
                return Ok(self.outcome(&session, CompletionStatus::Cancelled, turns, usage));
            }

            if let Some(repeated) = detector.check(&session.messages) {
                tracing::warn!(
                    tool = %repeated.tool_name,
                    occurrences = repeated.occurrences,
                    "Doom loop detected"
                );
                let warning = synthetic_warning(
                    "doom_loop",
                    format!(
                        "Stopped: `{}` was called {} times with the same input ({}) without \
                         making progress. Send another message to try a different approach.",
                        repeated.tool_name, repeated.occurrences, repeated.input
                    ),
                );
                self.persist_assistant(&mut session, warning, &events).await?;
                break CompletionStatus::DoomLoop;
            }
        };

        self.state = OrchestratorState::AwaitingUserInput;
        tracing::info!(
            turns,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            status = ?status,
            "Request finished"
        );
        Ok(self.outcome(&session, status, turns, usage))
    }

    /// Load or create the session and take its exclusive guard
    async fn open_session(&mut self) -> Result<(Session, crate::store::SessionGuard)> {
        match self.session_id.clone() {
            Some(id) => {
                let guard = self.store.acquire(&id).await;
                let session = self
                    .store
                    .get(&id)
                    .await?
                    .ok_or_else(|| ConverseError::NotFound(format!("session {}", id)))?;
                Ok((session, guard))
            }
            None => {
                let session = self.store.create(&self.workspace).await?;
                let guard = self.store.acquire(&session.id).await;
                self.session_id = Some(session.id.clone());
                Ok((session, guard))
            }
        }
    }

    fn build_request(&self, session: &Session) -> ProviderRequest {
        let mut request = ProviderRequest::new(session.messages.clone(), self.config.params.clone())
            .with_tools(self.tools.definitions());
        if let Some(system) = &self.config.system_prompt {
            request = request.with_system(system.clone());
        }
        request
    }

    /// Consume one provider stream, forwarding text to the UI as it arrives
    async fn stream_turn(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
        events: &mpsc::Sender<UiEvent>,
    ) -> TurnOutcome {
        let mut stream = match self.provider.stream(request, cancel.clone()).await {
            Ok(stream) => stream,
            Err(ConverseError::Cancelled) => return TurnOutcome::Cancelled(MessageAssembler::new()),
            Err(e) => return TurnOutcome::Failed(e.to_string()),
        };

        let mut assembler = MessageAssembler::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return TurnOutcome::Cancelled(assembler),
                next = stream.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => return TurnOutcome::Failed(e.to_string()),
                None => break,
            };
            match assembler.push(event) {
                Some(AssemblerUpdate::TextDelta(text)) => {
                    emit(events, UiEvent::TextDelta { text }).await;
                }
                Some(AssemblerUpdate::TextDone(text)) => {
                    emit(events, UiEvent::TextDone { text }).await;
                }
                Some(AssemblerUpdate::ToolUseDone { id, name }) => {
                    tracing::debug!(tool_id = %id, tool = %name, "Tool call received");
                }
                Some(AssemblerUpdate::Failed { status, message }) => {
                    let message = match status {
                        Some(status) => ConverseError::Provider { status, message }.to_string(),
                        None => message,
                    };
                    return TurnOutcome::Failed(message);
                }
                None => {}
            }
        }

        // Providers end their stream quietly when cancelled mid-request
        if cancel.is_cancelled() {
            return TurnOutcome::Cancelled(assembler);
        }
        TurnOutcome::Complete(assembler.finish())
    }

    /// Execute tool calls in order. Calls not started before cancellation
    /// get an error result without running.
    async fn run_tools(
        &self,
        calls: &[ToolCall],
        base_ctx: &ToolContext,
        events: &mpsc::Sender<UiEvent>,
    ) -> Vec<ContentBlock> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            if base_ctx.cancel.is_cancelled() {
                tracing::debug!(tool = %call.name, tool_id = %call.id, "Skipping tool after cancellation");
                results.push(ContentBlock::tool_result(
                    &call.id,
                    CANCELLED_BEFORE_EXECUTION,
                    true,
                ));
                continue;
            }

            emit(
                events,
                UiEvent::ToolStart {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                },
            )
            .await;
            let ctx = base_ctx.clone().with_call_id(call.id.clone());
            let result = self.tools.execute(&call.name, &call.input, &ctx).await;
            emit(
                events,
                UiEvent::ToolDone {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    output: result.output.clone(),
                    is_error: result.is_error,
                },
            )
            .await;
            results.push(result.into_block(&call.id));
        }
        results
    }

    async fn persist_assistant(
        &self,
        session: &mut Session,
        message: Message,
        events: &mpsc::Sender<UiEvent>,
    ) -> Result<()> {
        session.push(message.clone());
        self.store.update(session).await?;
        emit(events, UiEvent::MessageDone { message }).await;
        Ok(())
    }

    /// Keep whatever blocks finished before cancellation, marked incomplete
    async fn persist_partial(
        &self,
        session: &mut Session,
        assembler: MessageAssembler,
        usage: &mut TokenUsage,
    ) -> Result<()> {
        if !assembler.has_finished_blocks() {
            tracing::info!("Turn cancelled before any block finished; nothing persisted");
            return Ok(());
        }
        let partial = assembler.into_partial();
        usage.add(&partial.usage);
        let message = partial
            .into_message()
            .with_metadata("incomplete", serde_json::json!(true));
        let skipped: Vec<ContentBlock> = message
            .tool_calls()
            .iter()
            .map(|call| ContentBlock::tool_result(&call.id, CANCELLED_BEFORE_EXECUTION, true))
            .collect();
        session.push(message);
        if !skipped.is_empty() {
            session.push(Message::tool_results(skipped));
        }
        self.store.update(session).await?;
        tracing::info!("Persisted partial assistant message after cancellation");
        Ok(())
    }

    fn outcome(
        &self,
        session: &Session,
        status: CompletionStatus,
        turns: usize,
        usage: TokenUsage,
    ) -> ProcessOutcome {
        let span = tracing::Span::current();
        span.record("a3s.orchestrator.turns", turns as i64);
        span.record("a3s.orchestrator.status", format!("{:?}", status).as_str());
        ProcessOutcome {
            status,
            message: session.last_assistant().cloned(),
            turns,
            usage,
            session_id: session.id.clone(),
        }
    }
}

fn synthetic_warning(kind: &str, text: String) -> Message {
    Message::assistant(vec![ContentBlock::text(text)])
        .with_metadata("synthetic", serde_json::json!(kind))
}

/// Best-effort UI notification; a closed receiver does not stop the loop
async fn emit(events: &mpsc::Sender<UiEvent>, event: UiEvent) {
    if events.send(event).await.is_err() {
        tracing::trace!("UI event receiver dropped");
    }
}
