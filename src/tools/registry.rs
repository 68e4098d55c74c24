//! Tool Registry
//!
//! Name-indexed tools with thread-safe registration and a failure boundary:
//! whatever a tool does, `execute` returns a [`ToolResult`].

use super::types::{truncate_output, Tool, ToolContext};
use super::ToolResult;
use crate::provider::ToolDefinition;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::Instrument;

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with every built-in tool
    pub fn with_builtins() -> Self {
        Self::with_builtins_and_timeout(Duration::from_secs(
            super::builtin::bash::DEFAULT_TIMEOUT_SECS,
        ))
    }

    /// Built-ins, with a custom default shell timeout
    pub fn with_builtins_and_timeout(bash_timeout: Duration) -> Self {
        let registry = Self::new();
        super::builtin::register_builtins(&registry, bash_timeout);
        registry
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn Tool>>> {
        self.tools.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn Tool>>> {
        self.tools.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a tool, replacing any tool of the same name
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::debug!("Registering tool: {}", name);
        if self.write().insert(name.clone(), tool).is_some() {
            tracing::warn!("Tool '{}' replaced an existing registration", name);
        }
    }

    /// Returns true if the tool was found and removed
    pub fn unregister(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Tool definitions for the model, sorted by name
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .read()
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Sorted tool names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run a tool. Unknown names and tool failures become error results.
    pub async fn execute(
        &self,
        name: &str,
        args: &serde_json::Value,
        ctx: &ToolContext,
    ) -> ToolResult {
        let span = tracing::info_span!(
            "a3s.tool.execute",
            "a3s.tool.name" = %name,
            "a3s.tool.call_id" = %ctx.call_id,
            "a3s.tool.session_id" = %ctx.session_id,
            "a3s.tool.success" = tracing::field::Empty,
            "a3s.tool.duration_ms" = tracing::field::Empty,
        );

        async {
            let start = std::time::Instant::now();
            let result = match self.get(name) {
                Some(tool) => match tool.execute(args, ctx).await {
                    Ok(output) => ToolResult {
                        output: truncate_output(output.content),
                        is_error: output.is_error,
                        title: output.title,
                        metadata: output.metadata,
                    },
                    Err(e) => {
                        tracing::warn!("Tool '{}' failed: {:#}", name, e);
                        ToolResult::error(format!("{:#}", e))
                    }
                },
                None => {
                    tracing::warn!("Model requested unknown tool '{}'", name);
                    ToolResult::error(format!("unknown tool: {}", name))
                }
            };

            let span = tracing::Span::current();
            span.record("a3s.tool.success", !result.is_error);
            span.record("a3s.tool.duration_ms", start.elapsed().as_millis() as u64);
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{PermissionChecker, PermissionPolicy};
    use crate::tools::ToolOutput;
    use async_trait::async_trait;

    struct MockTool {
        name: String,
        fail: bool,
    }

    #[async_trait]
    impl Tool for MockTool {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "A mock tool for testing"
        }

        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }

        async fn execute(
            &self,
            _args: &serde_json::Value,
            _ctx: &ToolContext,
        ) -> anyhow::Result<ToolOutput> {
            if self.fail {
                Err(anyhow::anyhow!("disk on fire").context("mock failed"))
            } else {
                Ok(ToolOutput::success("mock output").with_title("mock"))
            }
        }
    }

    fn mock(name: &str, fail: bool) -> Arc<dyn Tool> {
        Arc::new(MockTool {
            name: name.to_string(),
            fail,
        })
    }

    fn ctx() -> ToolContext {
        ToolContext::new(
            std::env::temp_dir(),
            Arc::new(PermissionChecker::new(PermissionPolicy::default())),
        )
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ToolRegistry::new();
        assert!(registry.is_empty());
        registry.register(mock("b", false));
        registry.register(mock("a", false));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("a"));
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
    }

    #[test]
    fn test_definitions_sorted() {
        let registry = ToolRegistry::new();
        registry.register(mock("zeta", false));
        registry.register(mock("alpha", false));
        let names: Vec<_> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ToolRegistry::with_builtins();
        for name in [
            "bash",
            "edit",
            "glob",
            "grep",
            "question",
            "read",
            "todo_read",
            "todo_write",
            "web_fetch",
            "write",
        ] {
            assert!(registry.contains(name), "missing builtin {}", name);
        }
    }

    #[tokio::test]
    async fn test_execute_success() {
        let registry = ToolRegistry::new();
        registry.register(mock("ok", false));
        let result = registry.execute("ok", &serde_json::json!({}), &ctx()).await;
        assert!(!result.is_error);
        assert_eq!(result.output, "mock output");
        assert_eq!(result.title.as_deref(), Some("mock"));
    }

    #[tokio::test]
    async fn test_execute_error_is_caught() {
        let registry = ToolRegistry::new();
        registry.register(mock("bad", true));
        let result = registry.execute("bad", &serde_json::json!({}), &ctx()).await;
        assert!(result.is_error);
        assert!(result.output.contains("mock failed"));
        assert!(result.output.contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let registry = ToolRegistry::new();
        let result = registry.execute("nope", &serde_json::json!({}), &ctx()).await;
        assert!(result.is_error);
        assert_eq!(result.output, "unknown tool: nope");
    }
}
