//! Folding canonical stream events into one assistant message
//!
//! Tool-call input arrives as raw JSON fragments. Fragments are accumulated
//! per block and parsed only at `ContentBlockStop`; a parse failure degrades
//! the input to `{}`, logs a warning, and is recorded on the message under
//! `malformed_tool_input`.

use super::{BlockStart, Delta, StreamEvent};
use crate::message::{ContentBlock, Message, TokenUsage, ToolUseStatus};
use std::collections::BTreeMap;

#[derive(Debug)]
enum PartialBlock {
    Text(String),
    ToolUse { id: String, name: String, json: String },
}

/// What the consumer should react to after feeding one event
#[derive(Debug, Clone, PartialEq)]
pub enum AssemblerUpdate {
    TextDelta(String),
    /// A text block finished; carries its full text
    TextDone(String),
    /// A tool call finished streaming its input
    ToolUseDone { id: String, name: String },
    /// The backend reported an error
    Failed { status: Option<u16>, message: String },
}

/// Result of a fully consumed stream
#[derive(Debug, Clone, Default)]
pub struct AssembledMessage {
    pub content: Vec<ContentBlock>,
    pub usage: TokenUsage,
    pub stop_reason: Option<String>,
    /// Tool-use ids whose input could not be parsed
    pub malformed_tool_input: Vec<String>,
}

impl AssembledMessage {
    pub fn into_message(self) -> Message {
        let mut message = Message::assistant(self.content).with_usage(self.usage);
        if let Some(reason) = self.stop_reason {
            message = message.with_metadata("stop_reason", serde_json::json!(reason));
        }
        if !self.malformed_tool_input.is_empty() {
            message = message.with_metadata(
                "malformed_tool_input",
                serde_json::json!(self.malformed_tool_input),
            );
        }
        message
    }
}

/// Accumulates canonical events into content blocks
#[derive(Debug, Default)]
pub struct MessageAssembler {
    open: BTreeMap<usize, PartialBlock>,
    finished: BTreeMap<usize, ContentBlock>,
    usage: TokenUsage,
    stop_reason: Option<String>,
    malformed: Vec<String>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: StreamEvent) -> Option<AssemblerUpdate> {
        match event {
            StreamEvent::MessageStart { usage, .. } => {
                if let Some(usage) = usage {
                    self.merge_usage(&usage);
                }
                None
            }
            StreamEvent::ContentBlockStart { index, block } => {
                let partial = match block {
                    BlockStart::Text => PartialBlock::Text(String::new()),
                    BlockStart::ToolUse { id, name } => PartialBlock::ToolUse {
                        id,
                        name,
                        json: String::new(),
                    },
                };
                self.open.insert(index, partial);
                None
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::Text(text) => {
                    match self
                        .open
                        .entry(index)
                        .or_insert_with(|| PartialBlock::Text(String::new()))
                    {
                        PartialBlock::Text(buf) => buf.push_str(&text),
                        PartialBlock::ToolUse { name, .. } => {
                            tracing::debug!(index, tool = %name, "Text delta for tool block ignored");
                            return None;
                        }
                    }
                    Some(AssemblerUpdate::TextDelta(text))
                }
                Delta::InputJson(fragment) => {
                    match self.open.get_mut(&index) {
                        Some(PartialBlock::ToolUse { json, .. }) => json.push_str(&fragment),
                        _ => tracing::warn!(index, "Input JSON fragment without an open tool block"),
                    }
                    None
                }
            },
            StreamEvent::ContentBlockStop { index } => {
                let partial = self.open.remove(&index)?;
                let (block, update) = self.finalize(partial);
                self.finished.insert(index, block);
                Some(update)
            }
            StreamEvent::MessageDelta { stop_reason, usage } => {
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
                if let Some(usage) = usage {
                    self.merge_usage(&usage);
                }
                None
            }
            StreamEvent::Error { status, message } => {
                Some(AssemblerUpdate::Failed { status, message })
            }
        }
    }

    /// Whether any block has reached `ContentBlockStop`
    pub fn has_finished_blocks(&self) -> bool {
        !self.finished.is_empty()
    }

    /// Blocks that completed before the stream was interrupted
    pub fn into_partial(self) -> AssembledMessage {
        AssembledMessage {
            content: self.finished.into_values().collect(),
            usage: self.usage,
            stop_reason: None,
            malformed_tool_input: self.malformed,
        }
    }

    /// Close any blocks still open and return the full message
    pub fn finish(mut self) -> AssembledMessage {
        let open = std::mem::take(&mut self.open);
        for (index, partial) in open {
            let (block, _) = self.finalize(partial);
            self.finished.insert(index, block);
        }
        AssembledMessage {
            content: self.finished.into_values().collect(),
            usage: self.usage,
            stop_reason: self.stop_reason,
            malformed_tool_input: self.malformed,
        }
    }

    fn finalize(&mut self, partial: PartialBlock) -> (ContentBlock, AssemblerUpdate) {
        match partial {
            PartialBlock::Text(text) => (
                ContentBlock::Text { text: text.clone() },
                AssemblerUpdate::TextDone(text),
            ),
            PartialBlock::ToolUse { id, name, json } => {
                let input = parse_tool_input(&json).unwrap_or_else(|e| {
                    tracing::warn!(
                        "Failed to parse tool input JSON for tool '{}' ({}): {}",
                        name,
                        id,
                        e
                    );
                    self.malformed.push(id.clone());
                    serde_json::json!({})
                });
                (
                    ContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input,
                        status: ToolUseStatus::Complete,
                    },
                    AssemblerUpdate::ToolUseDone { id, name },
                )
            }
        }
    }

    fn merge_usage(&mut self, usage: &TokenUsage) {
        if usage.input_tokens > 0 {
            self.usage.input_tokens = usage.input_tokens;
        }
        if usage.output_tokens > 0 {
            self.usage.output_tokens = usage.output_tokens;
        }
        if usage.cache_read_tokens.is_some() {
            self.usage.cache_read_tokens = usage.cache_read_tokens;
        }
        if usage.cache_write_tokens.is_some() {
            self.usage.cache_write_tokens = usage.cache_write_tokens;
        }
    }
}

/// Parse accumulated tool input; empty input means "no arguments"
fn parse_tool_input(raw: &str) -> std::result::Result<serde_json::Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    let value: serde_json::Value = serde_json::from_str(raw)?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(serde::de::Error::custom(format!(
            "tool input must be a JSON object, got {}",
            value
        )))
    }
}
