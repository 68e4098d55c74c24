//! Session-scoped todo list
//!
//! The list lives in [`SessionToolState`](crate::tools::SessionToolState), so
//! it is shared by every tool call of one conversation and nothing else.

use crate::tools::{Tool, ToolContext, ToolOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TodoStatus {
    /// Still pending or in progress
    pub fn is_active(&self) -> bool {
        matches!(self, TodoStatus::Pending | TodoStatus::InProgress)
    }
}

impl fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TodoStatus::Pending => write!(f, "pending"),
            TodoStatus::InProgress => write!(f, "in_progress"),
            TodoStatus::Completed => write!(f, "completed"),
            TodoStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TodoPriority {
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub status: TodoStatus,
    #[serde(default)]
    pub priority: TodoPriority,
}

fn render(todos: &[TodoItem]) -> String {
    if todos.is_empty() {
        return "No todos.".to_string();
    }
    let mut out = String::new();
    for item in todos {
        let mark = match item.status {
            TodoStatus::Completed => "[x]",
            TodoStatus::InProgress => "[~]",
            TodoStatus::Cancelled => "[-]",
            TodoStatus::Pending => "[ ]",
        };
        out.push_str(&format!("{} {} ({})\n", mark, item.content, item.id));
    }
    let active = todos.iter().filter(|t| t.status.is_active()).count();
    out.push_str(&format!("{} of {} remaining", active, todos.len()));
    out
}

/// Replace the todo list
pub struct TodoWriteTool;

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> &str {
        "Replace the session todo list. Use it to plan and track multi-step work."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "string"},
                            "content": {"type": "string"},
                            "status": {"type": "string", "enum": ["pending", "in_progress", "completed", "cancelled"]},
                            "priority": {"type": "string", "enum": ["high", "medium", "low"]}
                        },
                        "required": ["id", "content"]
                    }
                }
            },
            "required": ["todos"]
        })
    }

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let todos = args
            .get("todos")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Missing required parameter: todos"))?;
        let todos: Vec<TodoItem> =
            serde_json::from_value(todos).context("Invalid todos parameter")?;

        let text = render(&todos);
        let active = todos.iter().filter(|t| t.status.is_active()).count();
        *ctx.state.todos.write().await = todos;
        ctx.log(format!("todo list updated, {} active", active));

        Ok(ToolOutput::success(text)
            .with_title(format!("{} todos", active))
            .with_metadata(serde_json::json!({ "active": active })))
    }
}

/// Show the todo list
pub struct TodoReadTool;

#[async_trait]
impl Tool for TodoReadTool {
    fn name(&self) -> &str {
        "todo_read"
    }

    fn description(&self) -> &str {
        "Read the current session todo list."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let todos = ctx.state.todos.read().await;
        Ok(ToolOutput::success(render(&todos)))
    }
}
