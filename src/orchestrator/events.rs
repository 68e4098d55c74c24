//! Events streamed to the UI while a request is processed

use crate::message::{Message, TokenUsage};
use crate::permissions::Capability;
use serde::{Deserialize, Serialize};

/// Live rendering events, tagged by `type` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UiEvent {
    #[serde(rename = "message:start")]
    MessageStart { session_id: String, turn: usize },

    #[serde(rename = "text:delta")]
    TextDelta { text: String },

    /// A text block finished; carries the whole block
    #[serde(rename = "text:done")]
    TextDone { text: String },

    #[serde(rename = "tool:start")]
    ToolStart {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool:done")]
    ToolDone {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },

    /// The assistant message as persisted
    #[serde(rename = "message:done")]
    MessageDone { message: Message },

    #[serde(rename = "turn:done")]
    TurnDone {
        turn: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },

    /// The request stopped on cancellation; nothing further follows
    #[serde(rename = "cancelled")]
    Cancelled { turn: usize },

    /// Verbatim backend or engine error text
    #[serde(rename = "error")]
    Error { message: String },

    /// Waiting on [`crate::prompter::Prompter::respond`]
    #[serde(rename = "permission:request")]
    PermissionRequest {
        request_id: String,
        capability: Capability,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        reason: String,
    },

    /// Waiting on [`crate::prompter::Prompter::respond`]
    #[serde(rename = "question:request")]
    QuestionRequest {
        request_id: String,
        question: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<String>,
    },
}

impl UiEvent {
    /// Wire name of this event
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageStart { .. } => "message:start",
            Self::TextDelta { .. } => "text:delta",
            Self::TextDone { .. } => "text:done",
            Self::ToolStart { .. } => "tool:start",
            Self::ToolDone { .. } => "tool:done",
            Self::MessageDone { .. } => "message:done",
            Self::TurnDone { .. } => "turn:done",
            Self::Cancelled { .. } => "cancelled",
            Self::Error { .. } => "error",
            Self::PermissionRequest { .. } => "permission:request",
            Self::QuestionRequest { .. } => "question:request",
        }
    }
}
