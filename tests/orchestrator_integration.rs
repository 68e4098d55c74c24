//! Orchestrator integration tests
//!
//! Drives full conversations against a scripted provider: tool rounds,
//! permission denials, backend failures, cancellation, doom-loop and
//! turn-limit stops, and interactive confirmation.

use a3s_converse::provider::{BlockStart, Delta};
use a3s_converse::{
    CompletionStatus, ContentBlock, EventStream, FileSessionStore, MemorySessionStore, Message,
    Orchestrator, OrchestratorConfig, OrchestratorState, PermissionChecker, PermissionPolicy,
    PromptReply, Prompter, Provider, ProviderRequest, Role, Session, SessionStore, StreamEvent,
    TokenUsage, Tool, ToolContext, ToolOutput, ToolRegistry, UiEvent,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ─── Scripted provider ───────────────────────────────────────────

enum Step {
    Event(StreamEvent),
    /// Fire the request's cancellation token
    Cancel,
    /// Never yield again
    Hang,
}

struct ScriptedProvider {
    turns: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<ProviderRequest>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(turns: Vec<Vec<Step>>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn request(&self, index: usize) -> ProviderRequest {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn stream(
        &self,
        request: &ProviderRequest,
        cancel: CancellationToken,
    ) -> a3s_converse::Result<EventStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let steps = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| text_turn("(script exhausted)"));
        Ok(Box::pin(async_stream::stream! {
            for step in steps {
                match step {
                    Step::Event(event) => yield Ok(event),
                    Step::Cancel => cancel.cancel(),
                    Step::Hang => futures::future::pending::<()>().await,
                }
            }
        }))
    }
}

fn start() -> Step {
    Step::Event(StreamEvent::MessageStart {
        id: Some("msg_1".into()),
        model: Some("scripted-model".into()),
        usage: Some(TokenUsage {
            input_tokens: 10,
            ..Default::default()
        }),
    })
}

fn finish(stop_reason: &str) -> Step {
    Step::Event(StreamEvent::MessageDelta {
        stop_reason: Some(stop_reason.into()),
        usage: Some(TokenUsage {
            output_tokens: 5,
            ..Default::default()
        }),
    })
}

fn text_block(index: usize, text: &str) -> Vec<Step> {
    vec![
        Step::Event(StreamEvent::ContentBlockStart {
            index,
            block: BlockStart::Text,
        }),
        Step::Event(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::Text(text.into()),
        }),
        Step::Event(StreamEvent::ContentBlockStop { index }),
    ]
}

fn tool_block(index: usize, id: &str, name: &str, input: serde_json::Value) -> Vec<Step> {
    let json = input.to_string();
    let (a, b) = json.split_at(json.len() / 2);
    vec![
        Step::Event(StreamEvent::ContentBlockStart {
            index,
            block: BlockStart::ToolUse {
                id: id.into(),
                name: name.into(),
            },
        }),
        Step::Event(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::InputJson(a.into()),
        }),
        Step::Event(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::InputJson(b.into()),
        }),
        Step::Event(StreamEvent::ContentBlockStop { index }),
    ]
}

fn text_turn(text: &str) -> Vec<Step> {
    let mut steps = vec![start()];
    steps.extend(text_block(0, text));
    steps.push(finish("end_turn"));
    steps
}

fn tool_turn(id: &str, name: &str, input: serde_json::Value) -> Vec<Step> {
    let mut steps = vec![start()];
    steps.extend(tool_block(0, id, name, input));
    steps.push(finish("tool_use"));
    steps
}

// ─── Fixtures ────────────────────────────────────────────────────

/// Counts invocations and echoes its input
struct CountingTool {
    runs: AtomicUsize,
}

#[async_trait]
impl Tool for CountingTool {
    fn name(&self) -> &str {
        "counter"
    }

    fn description(&self) -> &str {
        "Counts its runs"
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        _ctx: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput::success(format!("counted {}", args)))
    }
}

fn counting_registry() -> (Arc<ToolRegistry>, Arc<CountingTool>) {
    let counter = Arc::new(CountingTool {
        runs: AtomicUsize::new(0),
    });
    let registry = ToolRegistry::new();
    registry.register(counter.clone());
    (Arc::new(registry), counter)
}

fn orchestrator(
    provider: Arc<ScriptedProvider>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn SessionStore>,
    workspace: &Path,
) -> Orchestrator {
    Orchestrator::new(
        provider,
        tools,
        store,
        Arc::new(PermissionChecker::permissive()),
        workspace,
    )
}

fn drain(rx: &mut mpsc::Receiver<UiEvent>) -> Vec<UiEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn kinds(events: &[UiEvent]) -> Vec<&'static str> {
    events.iter().map(UiEvent::kind).collect()
}

/// Every tool_use is answered by exactly one later tool_result
fn assert_paired(session: &Session) {
    let mut open: HashMap<String, usize> = HashMap::new();
    for (i, message) in session.messages.iter().enumerate() {
        for block in &message.content {
            match block {
                ContentBlock::ToolUse { id, .. } => {
                    assert!(open.insert(id.clone(), i).is_none(), "duplicate tool_use {}", id);
                }
                ContentBlock::ToolResult { tool_use_id, .. } => {
                    let at = open
                        .remove(tool_use_id)
                        .unwrap_or_else(|| panic!("unmatched tool_result {}", tool_use_id));
                    assert!(at < i);
                }
                _ => {}
            }
        }
    }
    assert!(open.is_empty(), "unanswered tool_use: {:?}", open.keys());
}

fn tool_results(message: &Message) -> Vec<(String, String, bool)> {
    message
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                output,
                is_error,
            } => Some((tool_use_id.clone(), output.clone(), *is_error)),
            _ => None,
        })
        .collect()
}

// ─── Scenarios ───────────────────────────────────────────────────

#[tokio::test]
async fn test_glob_round_then_text_answer() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["a.ts", "b.ts", "c.ts", "notes.md"] {
        std::fs::write(dir.path().join(name), "").unwrap();
    }
    let provider = ScriptedProvider::new(vec![
        tool_turn("toolu_1", "glob", serde_json::json!({"pattern": "*.ts"})),
        text_turn("There are three TypeScript files."),
    ]);
    let store = Arc::new(MemorySessionStore::new());
    let mut orch = orchestrator(
        provider.clone(),
        Arc::new(ToolRegistry::with_builtins()),
        store.clone(),
        dir.path(),
    );
    let (tx, mut rx) = mpsc::channel(256);

    let outcome = orch
        .process("list files", CancellationToken::new(), tx)
        .await
        .unwrap();

    assert_eq!(outcome.status, CompletionStatus::Completed);
    assert_eq!(outcome.turns, 2);
    assert_eq!(provider.calls(), 2);
    assert_eq!(outcome.message.unwrap().text(), "There are three TypeScript files.");
    assert_eq!(outcome.usage.input_tokens, 20);
    assert_eq!(outcome.usage.output_tokens, 10);
    assert_eq!(orch.state(), OrchestratorState::AwaitingUserInput);

    let session = store.get(&outcome.session_id).await.unwrap().unwrap();
    let roles: Vec<Role> = session.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
    let results = tool_results(&session.messages[2]);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1, "a.ts\nb.ts\nc.ts");
    assert!(!results[0].2);
    assert_paired(&session);

    // The second request carried the tool result back to the model
    let second = provider.request(1);
    assert_eq!(second.messages.len(), 3);
    assert!(second.tools.iter().any(|t| t.name == "glob"));

    let events = drain(&mut rx);
    let kinds = kinds(&events);
    assert_eq!(kinds.iter().filter(|k| **k == "message:start").count(), 2);
    assert!(kinds.contains(&"tool:start"));
    assert!(kinds.contains(&"tool:done"));
    assert!(kinds.contains(&"text:delta"));
    assert_eq!(kinds.last(), Some(&"turn:done"));
}

#[tokio::test]
async fn test_denied_bash_command_is_not_run() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![
        tool_turn("toolu_rm", "bash", serde_json::json!({"command": "rm -rf /"})),
        text_turn("I will not do that."),
    ]);
    let store = Arc::new(MemorySessionStore::new());
    let mut orch = orchestrator(
        provider,
        Arc::new(ToolRegistry::with_builtins()),
        store.clone(),
        dir.path(),
    );
    let (tx, mut rx) = mpsc::channel(256);

    let outcome = orch
        .process("clean up everything", CancellationToken::new(), tx)
        .await
        .unwrap();

    assert!(outcome.is_completed());
    let session = store.get(&outcome.session_id).await.unwrap().unwrap();
    let results = tool_results(&session.messages[2]);
    assert!(results[0].1.starts_with("Permission denied"));
    assert!(!results[0].2, "a denial is ordinary feedback, not an error");

    let done = drain(&mut rx)
        .into_iter()
        .find(|e| matches!(e, UiEvent::ToolDone { .. }))
        .unwrap();
    assert!(matches!(done, UiEvent::ToolDone { is_error: false, .. }));
}

#[tokio::test]
async fn test_overloaded_backend_leaves_store_intact() {
    let dir = tempfile::tempdir().unwrap();
    let sessions = dir.path().join("sessions");
    let store = Arc::new(FileSessionStore::new(&sessions).await.unwrap());
    let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
    let provider = ScriptedProvider::new(vec![vec![Step::Event(StreamEvent::error(
        Some(529),
        body,
    ))]]);
    let (tools, _) = counting_registry();
    let mut orch = orchestrator(provider, tools, store, dir.path());
    let (tx, mut rx) = mpsc::channel(64);

    let outcome = orch
        .process("hello there", CancellationToken::new(), tx)
        .await
        .unwrap();

    let message = match &outcome.status {
        CompletionStatus::Failed { message } => message.clone(),
        other => panic!("expected failure, got {:?}", other),
    };
    assert!(message.contains("529"));
    assert!(message.contains("overloaded_error"));
    assert_eq!(orch.state(), OrchestratorState::Failed);
    assert!(outcome.message.is_none());

    let errors: Vec<String> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            UiEvent::Error { message } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec![message]);

    // A fresh store over the same directory sees a valid transcript
    let reopened = FileSessionStore::new(&sessions).await.unwrap();
    let session = reopened.get(&outcome.session_id).await.unwrap().unwrap();
    assert_eq!(session.messages.len(), 1);
    assert_eq!(session.messages[0].role, Role::User);
    assert_eq!(session.messages[0].text(), "hello there");
}

#[tokio::test]
async fn test_cancel_mid_stream_keeps_finished_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let mut steps = vec![start()];
    steps.extend(text_block(0, "First paragraph."));
    steps.push(Step::Event(StreamEvent::ContentBlockStart {
        index: 1,
        block: BlockStart::Text,
    }));
    steps.push(Step::Event(StreamEvent::ContentBlockDelta {
        index: 1,
        delta: Delta::Text("Second para".into()),
    }));
    steps.push(Step::Cancel);
    steps.push(Step::Hang);
    let provider = ScriptedProvider::new(vec![steps]);
    let store = Arc::new(MemorySessionStore::new());
    let (tools, counter) = counting_registry();
    let mut orch = orchestrator(provider, tools, store.clone(), dir.path());
    let (tx, mut rx) = mpsc::channel(64);

    let outcome = orch
        .process("write two paragraphs", CancellationToken::new(), tx)
        .await
        .unwrap();

    assert_eq!(outcome.status, CompletionStatus::Cancelled);
    assert_eq!(orch.state(), OrchestratorState::Aborted);
    assert_eq!(counter.runs.load(Ordering::SeqCst), 0);

    let session = store.get(&outcome.session_id).await.unwrap().unwrap();
    assert_eq!(session.messages.len(), 2);
    let partial = &session.messages[1];
    assert!(partial.is_incomplete());
    assert_eq!(partial.text(), "First paragraph.");

    let events = drain(&mut rx);
    let deltas = events
        .iter()
        .filter(|e| matches!(e, UiEvent::TextDelta { .. }))
        .count();
    assert_eq!(deltas, 2);
    assert_eq!(events.last(), Some(&UiEvent::Cancelled { turn: 1 }));
}

#[tokio::test]
async fn test_cancel_before_any_block_persists_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![vec![
        start(),
        Step::Event(StreamEvent::ContentBlockStart {
            index: 0,
            block: BlockStart::Text,
        }),
        Step::Event(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: Delta::Text("Hel".into()),
        }),
        Step::Event(StreamEvent::ContentBlockDelta {
            index: 0,
            delta: Delta::Text("lo".into()),
        }),
        Step::Cancel,
        Step::Hang,
    ]]);
    let store = Arc::new(MemorySessionStore::new());
    let (tools, _) = counting_registry();
    let mut orch = orchestrator(provider, tools, store.clone(), dir.path());
    let (tx, _rx) = mpsc::channel(64);

    let outcome = orch
        .process("say hello", CancellationToken::new(), tx)
        .await
        .unwrap();

    assert_eq!(outcome.status, CompletionStatus::Cancelled);
    let session = store.get(&outcome.session_id).await.unwrap().unwrap();
    assert_eq!(session.messages.len(), 1);
    assert_eq!(session.last_message().unwrap().role, Role::User);
}

#[tokio::test]
async fn test_cancel_skips_finished_tool_calls() {
    let dir = tempfile::tempdir().unwrap();
    let mut steps = vec![start()];
    steps.extend(tool_block(0, "toolu_a", "counter", serde_json::json!({"n": 1})));
    steps.extend(tool_block(1, "toolu_b", "counter", serde_json::json!({"n": 2})));
    steps.push(Step::Cancel);
    steps.push(Step::Hang);
    let provider = ScriptedProvider::new(vec![steps]);
    let store = Arc::new(MemorySessionStore::new());
    let (tools, counter) = counting_registry();
    let mut orch = orchestrator(provider, tools, store.clone(), dir.path());
    let (tx, mut rx) = mpsc::channel(64);

    let outcome = orch
        .process("count twice", CancellationToken::new(), tx)
        .await
        .unwrap();

    assert_eq!(outcome.status, CompletionStatus::Cancelled);
    assert_eq!(counter.runs.load(Ordering::SeqCst), 0);
    let cancelled = drain(&mut rx)
        .into_iter()
        .filter(|e| e.kind() == "cancelled")
        .count();
    assert_eq!(cancelled, 1);
    let session = store.get(&outcome.session_id).await.unwrap().unwrap();
    assert_eq!(session.messages.len(), 3);
    assert!(session.messages[1].is_incomplete());
    for (_, output, is_error) in tool_results(&session.messages[2]) {
        assert_eq!(output, "cancelled before execution");
        assert!(is_error);
    }
    assert_paired(&session);
}

// ─── Loop bounds ─────────────────────────────────────────────────

#[tokio::test]
async fn test_doom_loop_stops_on_third_repeat() {
    let dir = tempfile::tempdir().unwrap();
    let input = serde_json::json!({"target": "same"});
    let provider = ScriptedProvider::new(
        (0..6)
            .map(|i| tool_turn(&format!("toolu_{}", i), "counter", input.clone()))
            .collect(),
    );
    let store = Arc::new(MemorySessionStore::new());
    let (tools, counter) = counting_registry();
    let mut orch = orchestrator(provider.clone(), tools, store.clone(), dir.path());
    let (tx, _rx) = mpsc::channel(256);

    let outcome = orch
        .process("keep probing", CancellationToken::new(), tx)
        .await
        .unwrap();

    assert_eq!(outcome.status, CompletionStatus::DoomLoop);
    assert_eq!(outcome.turns, 3);
    assert_eq!(provider.calls(), 3);
    assert_eq!(counter.runs.load(Ordering::SeqCst), 3);

    let warning = outcome.message.unwrap();
    assert_eq!(warning.metadata_value("synthetic"), Some(&serde_json::json!("doom_loop")));
    assert!(warning.text().contains("counter"));

    let session = store.get(&outcome.session_id).await.unwrap().unwrap();
    assert_eq!(session.last_message().unwrap().id, warning.id);
    assert_paired(&session);
}

#[tokio::test]
async fn test_turn_limit_is_never_exceeded() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(
        (0..10)
            .map(|i| tool_turn(&format!("toolu_{}", i), "counter", serde_json::json!({"step": i})))
            .collect(),
    );
    let store = Arc::new(MemorySessionStore::new());
    let (tools, counter) = counting_registry();
    let mut orch = orchestrator(provider.clone(), tools, store.clone(), dir.path()).with_config(
        OrchestratorConfig {
            max_turns: 4,
            ..Default::default()
        },
    );
    let (tx, _rx) = mpsc::channel(256);

    let outcome = orch
        .process("walk forever", CancellationToken::new(), tx)
        .await
        .unwrap();

    assert_eq!(outcome.status, CompletionStatus::TurnLimit);
    assert_eq!(outcome.turns, 4);
    assert_eq!(provider.calls(), 4);
    assert_eq!(counter.runs.load(Ordering::SeqCst), 4);
    let warning = outcome.message.unwrap();
    assert_eq!(warning.metadata_value("synthetic"), Some(&serde_json::json!("turn_limit")));

    let session = store.get(&outcome.session_id).await.unwrap().unwrap();
    assert_paired(&session);
}

#[tokio::test]
async fn test_unknown_tool_gets_error_result() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![
        tool_turn("toolu_x", "teleport", serde_json::json!({})),
        text_turn("That tool does not exist."),
    ]);
    let store = Arc::new(MemorySessionStore::new());
    let (tools, counter) = counting_registry();
    let mut orch = orchestrator(provider, tools, store.clone(), dir.path());
    let (tx, _rx) = mpsc::channel(64);

    let outcome = orch
        .process("beam me up", CancellationToken::new(), tx)
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(counter.runs.load(Ordering::SeqCst), 0);
    let session = store.get(&outcome.session_id).await.unwrap().unwrap();
    let results = tool_results(&session.messages[2]);
    assert_eq!(results[0].1, "unknown tool: teleport");
    assert!(results[0].2);
}

#[tokio::test]
async fn test_tools_run_in_received_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut steps = vec![start()];
    steps.extend(tool_block(0, "toolu_first", "counter", serde_json::json!({"n": 1})));
    steps.extend(tool_block(1, "toolu_second", "counter", serde_json::json!({"n": 2})));
    steps.push(finish("tool_use"));
    let provider = ScriptedProvider::new(vec![steps, text_turn("done")]);
    let store = Arc::new(MemorySessionStore::new());
    let (tools, counter) = counting_registry();
    let mut orch = orchestrator(provider, tools, store.clone(), dir.path());
    let (tx, _rx) = mpsc::channel(64);

    let outcome = orch
        .process("count both", CancellationToken::new(), tx)
        .await
        .unwrap();

    assert_eq!(counter.runs.load(Ordering::SeqCst), 2);
    let session = store.get(&outcome.session_id).await.unwrap().unwrap();
    let ids: Vec<String> = tool_results(&session.messages[2])
        .into_iter()
        .map(|(id, _, _)| id)
        .collect();
    assert_eq!(ids, vec!["toolu_first", "toolu_second"]);
}

// ─── Sessions ────────────────────────────────────────────────────

#[tokio::test]
async fn test_second_request_continues_session() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![text_turn("Hi!"), text_turn("Still here.")]);
    let store = Arc::new(MemorySessionStore::new());
    let (tools, _) = counting_registry();
    let mut orch = orchestrator(provider.clone(), tools, store.clone(), dir.path());

    let (tx, _rx) = mpsc::channel(64);
    let first = orch.process("hello", CancellationToken::new(), tx).await.unwrap();
    let (tx, _rx) = mpsc::channel(64);
    let second = orch.process("you there?", CancellationToken::new(), tx).await.unwrap();

    assert_eq!(first.session_id, second.session_id);
    assert_eq!(orch.session_id(), Some(first.session_id.as_str()));
    assert_eq!(provider.request(1).messages.len(), 3);
    let summaries = store.list(None).await.unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].message_count, 4);
    assert_eq!(summaries[0].title, "hello");
}

#[tokio::test]
async fn test_resume_missing_session_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![]);
    let (tools, _) = counting_registry();
    let mut orch = orchestrator(
        provider.clone(),
        tools,
        Arc::new(MemorySessionStore::new()),
        dir.path(),
    )
    .with_session("no-such-session");
    let (tx, _rx) = mpsc::channel(8);

    let err = orch
        .process("hi", CancellationToken::new(), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, a3s_converse::ConverseError::NotFound(_)));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_empty_response_is_persisted_as_empty_text() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![vec![start(), finish("end_turn")]]);
    let store = Arc::new(MemorySessionStore::new());
    let (tools, _) = counting_registry();
    let mut orch = orchestrator(provider, tools, store.clone(), dir.path());
    let (tx, _rx) = mpsc::channel(64);

    let outcome = orch.process("...", CancellationToken::new(), tx).await.unwrap();

    assert!(outcome.is_completed());
    let message = outcome.message.unwrap();
    assert_eq!(message.content, vec![ContentBlock::text("")]);
}

// ─── Interactive confirmation ────────────────────────────────────

#[tokio::test]
async fn test_write_confirmed_through_prompter() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![
        tool_turn(
            "toolu_w",
            "write",
            serde_json::json!({"file_path": "out.txt", "content": "approved"}),
        ),
        text_turn("Written."),
    ]);
    let prompter = Arc::new(Prompter::default());
    let permissions = Arc::new(
        PermissionChecker::new(PermissionPolicy::default()).with_confirmer(prompter.clone()),
    );
    let mut orch = Orchestrator::new(
        provider,
        Arc::new(ToolRegistry::with_builtins()),
        Arc::new(MemorySessionStore::new()),
        permissions,
        dir.path(),
    )
    .with_prompter(prompter.clone());

    let (tx, mut rx) = mpsc::channel(64);
    let responder = {
        let prompter = prompter.clone();
        tokio::spawn(async move {
            let mut asked = Vec::new();
            while let Some(event) = rx.recv().await {
                if let UiEvent::PermissionRequest {
                    request_id, target, ..
                } = event
                {
                    asked.push(target);
                    prompter.respond(&request_id, PromptReply::Confirm(true)).await;
                }
            }
            asked
        })
    };

    let outcome = orch
        .process("write the file", CancellationToken::new(), tx)
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
        "approved"
    );
    assert_eq!(prompter.pending_count().await, 0);
    responder.abort();
}

#[tokio::test]
async fn test_ask_without_confirmer_denies() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedProvider::new(vec![
        tool_turn(
            "toolu_w",
            "write",
            serde_json::json!({"file_path": "out.txt", "content": "nope"}),
        ),
        text_turn("Could not write."),
    ]);
    let store = Arc::new(MemorySessionStore::new());
    let mut orch = Orchestrator::new(
        provider,
        Arc::new(ToolRegistry::with_builtins()),
        store.clone(),
        Arc::new(PermissionChecker::new(PermissionPolicy::default())),
        dir.path(),
    );
    let (tx, _rx) = mpsc::channel(64);

    let outcome = orch
        .process("write the file", CancellationToken::new(), tx)
        .await
        .unwrap();

    assert!(!dir.path().join("out.txt").exists());
    let session = store.get(&outcome.session_id).await.unwrap().unwrap();
    let results = tool_results(&session.messages[2]);
    assert!(results[0].1.starts_with("Permission denied"));
    assert!(!results[0].2);
}
