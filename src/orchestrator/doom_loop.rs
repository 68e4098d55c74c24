//! Detection of a model repeating the same tool call

use crate::message::{ContentBlock, Message};

pub const DEFAULT_DOOM_LOOP_WINDOW: usize = 10;
pub const DEFAULT_DOOM_LOOP_THRESHOLD: usize = 3;

/// A tool call that keeps coming back unchanged
#[derive(Debug, Clone, PartialEq)]
pub struct RepeatedCall {
    pub tool_name: String,
    pub input: String,
    pub occurrences: usize,
}

/// Counts how often the latest tool call recurs in the tail of a transcript
#[derive(Debug, Clone, Copy)]
pub struct DoomLoopDetector {
    window: usize,
    threshold: usize,
}

impl Default for DoomLoopDetector {
    fn default() -> Self {
        Self::new(DEFAULT_DOOM_LOOP_WINDOW, DEFAULT_DOOM_LOOP_THRESHOLD)
    }
}

impl DoomLoopDetector {
    pub fn new(window: usize, threshold: usize) -> Self {
        Self {
            window,
            threshold: threshold.max(1),
        }
    }

    /// Returns the repeated call when the most recent `tool_use` in the last
    /// `window` messages appears at least `threshold` times in that window.
    pub fn check(&self, messages: &[Message]) -> Option<RepeatedCall> {
        let start = messages.len().saturating_sub(self.window);
        let calls: Vec<(&str, String)> = messages[start..]
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|block| match block {
                ContentBlock::ToolUse { name, input, .. } => {
                    Some((name.as_str(), input.to_string()))
                }
                _ => None,
            })
            .collect();

        let latest = calls.last()?;
        let occurrences = calls.iter().filter(|call| *call == latest).count();
        if occurrences < self.threshold {
            return None;
        }
        Some(RepeatedCall {
            tool_name: latest.0.to_string(),
            input: latest.1.clone(),
            occurrences,
        })
    }
}
