//! Core types for tool execution

use super::builtin::todo::TodoItem;
use crate::permissions::PermissionChecker;
use crate::prompter::QuestionHandler;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Tool output is cut at this many bytes
pub const MAX_OUTPUT_BYTES: usize = 100 * 1024;

/// Truncate on a char boundary and note how much was dropped
pub fn truncate_output(mut output: String) -> String {
    if output.len() <= MAX_OUTPUT_BYTES {
        return output;
    }
    let total = output.len();
    let mut cut = MAX_OUTPUT_BYTES;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str(&format!("\n\n[output truncated: {} of {} bytes shown]", cut, total));
    output
}

/// Ephemeral per-conversation state shared by tools
#[derive(Debug, Default)]
pub struct SessionToolState {
    pub todos: RwLock<Vec<TodoItem>>,
}

/// Everything a tool may touch while it runs
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    /// The `tool_use` id being executed
    pub call_id: String,
    /// Workspace root (sandbox boundary), canonicalized
    pub workspace: PathBuf,
    pub cancel: CancellationToken,
    pub permissions: Arc<PermissionChecker>,
    pub questions: Option<Arc<dyn QuestionHandler>>,
    pub state: Arc<SessionToolState>,
}

impl ToolContext {
    pub fn new(workspace: impl AsRef<Path>, permissions: Arc<PermissionChecker>) -> Self {
        let workspace = workspace.as_ref();
        // Canonicalize to handle symlinks (e.g., /var -> /private/var on macOS)
        let workspace = workspace
            .canonicalize()
            .unwrap_or_else(|_| workspace.to_path_buf());
        Self {
            session_id: String::new(),
            call_id: String::new(),
            workspace,
            cancel: CancellationToken::new(),
            permissions,
            questions: None,
            state: Arc::new(SessionToolState::default()),
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = call_id.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_questions(mut self, questions: Arc<dyn QuestionHandler>) -> Self {
        self.questions = Some(questions);
        self
    }

    pub fn with_state(mut self, state: Arc<SessionToolState>) -> Self {
        self.state = state;
        self
    }

    /// Progress line tagged with session and call ids
    pub fn log(&self, message: impl AsRef<str>) {
        tracing::info!(
            session_id = %self.session_id,
            call_id = %self.call_id,
            "{}",
            message.as_ref()
        );
    }

    /// Resolve `path` inside the workspace.
    ///
    /// The target itself need not exist, but its nearest existing ancestor is
    /// canonicalized so symlinks cannot escape the sandbox.
    pub fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let joined = if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.workspace.join(path)
        };
        let normalized = normalize(&joined);

        let mut existing = normalized.as_path();
        let mut tail = Vec::new();
        while !existing.exists() {
            match (existing.file_name(), existing.parent()) {
                (Some(name), Some(parent)) => {
                    tail.push(name.to_os_string());
                    existing = parent;
                }
                _ => break,
            }
        }
        let mut resolved = existing
            .canonicalize()
            .unwrap_or_else(|_| existing.to_path_buf());
        for part in tail.iter().rev() {
            resolved.push(part);
        }

        if !resolved.starts_with(&self.workspace) {
            anyhow::bail!("Path escapes workspace: {}", path);
        }
        Ok(resolved)
    }

    /// Workspace-relative form used in permission checks and titles
    pub fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.workspace)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| path.to_string_lossy().into_owned())
    }
}

/// Lexically resolve `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// What a tool produced
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
    /// Short human label (e.g. the file touched)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            is_error: true,
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A capability the model can invoke
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique within a registry
    fn name(&self) -> &str;

    /// Human-readable description for the model
    fn description(&self) -> &str;

    /// JSON Schema for the input
    fn parameters(&self) -> serde_json::Value;

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// Fetch a required string argument
pub(crate) fn required_str<'a>(args: &'a serde_json::Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("Missing required parameter: {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::PermissionPolicy;

    fn ctx(dir: &Path) -> ToolContext {
        ToolContext::new(dir, Arc::new(PermissionChecker::new(PermissionPolicy::default())))
    }

    #[test]
    fn test_truncate_output() {
        let short = "abc".to_string();
        assert_eq!(truncate_output(short.clone()), short);

        let long = "é".repeat(MAX_OUTPUT_BYTES);
        let cut = truncate_output(long);
        assert!(cut.contains("[output truncated"));
        assert!(cut.len() < MAX_OUTPUT_BYTES + 100);
    }

    #[test]
    fn test_resolve_path_inside_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        let ctx = ctx(dir.path());

        let p = ctx.resolve_path("src/main.rs").unwrap();
        assert!(p.starts_with(&ctx.workspace));
        assert!(p.ends_with("src/main.rs"));

        let nested = ctx.resolve_path("new/dir/file.txt").unwrap();
        assert!(nested.ends_with("new/dir/file.txt"));

        let dotted = ctx.resolve_path("src/../src/./lib.rs").unwrap();
        assert!(dotted.ends_with("src/lib.rs"));
    }

    #[test]
    fn test_resolve_path_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        assert!(ctx.resolve_path("../outside.txt").is_err());
        assert!(ctx.resolve_path("/etc/passwd").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_path_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        let ctx = ctx(dir.path());
        assert!(ctx.resolve_path("link/secret.txt").is_err());
    }

    #[test]
    fn test_display_path() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let p = ctx.workspace.join("a/b.txt");
        assert_eq!(ctx.display_path(&p), "a/b.txt");
    }
}
