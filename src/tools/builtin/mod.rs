//! Built-in tools

pub mod bash;
pub mod fs;
pub mod question;
pub mod search;
pub mod todo;
pub mod web;

use super::ToolRegistry;
use std::sync::Arc;
use std::time::Duration;

/// Register every built-in tool
pub fn register_builtins(registry: &ToolRegistry, bash_timeout: Duration) {
    registry.register(Arc::new(fs::ReadTool));
    registry.register(Arc::new(fs::WriteTool));
    registry.register(Arc::new(fs::EditTool));
    registry.register(Arc::new(search::GlobTool));
    registry.register(Arc::new(search::GrepTool));
    registry.register(Arc::new(bash::BashTool::new(bash_timeout)));
    registry.register(Arc::new(web::WebFetchTool::new()));
    registry.register(Arc::new(todo::TodoWriteTool));
    registry.register(Arc::new(todo::TodoReadTool));
    registry.register(Arc::new(question::QuestionTool));
}
