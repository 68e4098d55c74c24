//! Tool system
//!
//! Tools implement [`Tool`] and are looked up by name in a [`ToolRegistry`].
//! Each tool checks permissions itself before any side effect; a denial is
//! reported as ordinary output so the model can adjust.

pub mod builtin;
mod registry;
mod types;

pub use registry::ToolRegistry;
pub use types::{
    truncate_output, SessionToolState, Tool, ToolContext, ToolOutput, MAX_OUTPUT_BYTES,
};

use crate::message::ContentBlock;
use serde::{Deserialize, Serialize};

/// Outcome of one tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: String,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
            title: None,
            metadata: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            output: message.into(),
            is_error: true,
            title: None,
            metadata: None,
        }
    }

    /// The `tool_result` block answering `tool_use_id`
    pub fn into_block(self, tool_use_id: impl Into<String>) -> ContentBlock {
        ContentBlock::tool_result(tool_use_id, self.output, self.is_error)
    }
}
