//! Interactive confirmations and questions over the UI event channel
//!
//! A request is emitted as a [`UiEvent`] and the caller suspends on a
//! oneshot until the host answers with [`Prompter::respond`]. A timeout or
//! cancellation resolves the request as a refusal.

use crate::orchestrator::UiEvent;
use crate::permissions::{ConfirmationHandler, PermissionRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

/// Default wait before an unanswered prompt is refused
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Asks the user a free-form question
#[async_trait]
pub trait QuestionHandler: Send + Sync {
    /// `None` when no answer arrived (timeout, cancellation, no listener)
    async fn ask(&self, question: &str, options: &[String]) -> Option<String>;
}

/// The host's answer to a pending prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PromptReply {
    Confirm(bool),
    Answer(String),
}

struct Channel {
    events: mpsc::Sender<UiEvent>,
    cancel: CancellationToken,
}

/// Bridges permission and question prompts to the UI
pub struct Prompter {
    timeout: Duration,
    channel: RwLock<Option<Channel>>,
    pending: Arc<RwLock<HashMap<String, oneshot::Sender<PromptReply>>>>,
}

impl Default for Prompter {
    fn default() -> Self {
        Self::new(DEFAULT_PROMPT_TIMEOUT)
    }
}

impl Prompter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            channel: RwLock::new(None),
            pending: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Route prompts to `events` until the next attach; `cancel` refuses
    /// anything still waiting.
    pub async fn attach(&self, events: mpsc::Sender<UiEvent>, cancel: CancellationToken) {
        *self.channel.write().await = Some(Channel { events, cancel });
    }

    /// Deliver the host's reply. Returns `false` if nothing was waiting on `request_id`.
    pub async fn respond(&self, request_id: &str, reply: PromptReply) -> bool {
        let sender = self.pending.write().await.remove(request_id);
        match sender {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                tracing::debug!(request_id, "No pending prompt");
                false
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Emit `event` (built from a fresh request id) and wait for the reply
    async fn request<F>(&self, build: F) -> Option<PromptReply>
    where
        F: FnOnce(String) -> UiEvent + Send,
    {
        let (events, cancel) = {
            let channel = self.channel.read().await;
            let channel = channel.as_ref()?;
            (channel.events.clone(), channel.cancel.clone())
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(request_id.clone(), tx);

        if events.send(build(request_id.clone())).await.is_err() {
            tracing::warn!(request_id = %request_id, "UI event channel closed; refusing prompt");
            self.pending.write().await.remove(&request_id);
            return None;
        }

        let reply = tokio::select! {
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(self.timeout, rx) => match result {
                Ok(Ok(reply)) => Some(reply),
                Ok(Err(_)) => None,
                Err(_) => {
                    tracing::warn!(request_id = %request_id, timeout_ms = self.timeout.as_millis() as u64, "Prompt timed out");
                    None
                }
            },
        };
        self.pending.write().await.remove(&request_id);
        reply
    }
}

#[async_trait]
impl ConfirmationHandler for Prompter {
    async fn confirm(&self, request: PermissionRequest) -> bool {
        let reply = self
            .request(|request_id| UiEvent::PermissionRequest {
                request_id,
                capability: request.capability,
                target: request.target.clone(),
                reason: request.reason.clone(),
            })
            .await;
        matches!(reply, Some(PromptReply::Confirm(true)))
    }
}

#[async_trait]
impl QuestionHandler for Prompter {
    async fn ask(&self, question: &str, options: &[String]) -> Option<String> {
        let reply = self
            .request(|request_id| UiEvent::QuestionRequest {
                request_id,
                question: question.to_string(),
                options: options.to_vec(),
            })
            .await;
        match reply {
            Some(PromptReply::Answer(answer)) => Some(answer),
            Some(PromptReply::Confirm(yes)) => Some(if yes { "yes" } else { "no" }.to_string()),
            None => None,
        }
    }
}
