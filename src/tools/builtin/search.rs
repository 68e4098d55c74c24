//! Search tools: glob and grep

use crate::permissions::{Capability, PermissionAction, PermissionPolicy};
use crate::tools::types::required_str;
use crate::tools::{Tool, ToolContext, ToolOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Cap on paths returned by glob
pub const MAX_GLOB_RESULTS: usize = 100;
/// Cap on matching lines returned by grep
pub const MAX_GREP_MATCHES: usize = 100;
const MAX_MATCH_LINE_CHARS: usize = 2000;

/// Resolve the optional `path` argument and check read permission on it
async fn search_root(args: &serde_json::Value, ctx: &ToolContext) -> Result<Result<PathBuf, ToolOutput>> {
    let root = match args.get("path").and_then(|v| v.as_str()) {
        Some(p) if !p.is_empty() => ctx.resolve_path(p)?,
        _ => ctx.workspace.clone(),
    };
    let display = ctx.display_path(&root);
    let target = if display.is_empty() { "." } else { display.as_str() };
    let decision = ctx.permissions.check(Capability::Read, Some(target)).await;
    if !decision.allowed {
        return Ok(Err(ToolOutput::success(decision.denial_message())));
    }
    Ok(Ok(root))
}

/// Per-file filter applied to search results.
///
/// Only explicit denials drop a file; `ask` defers to the decision already made
/// for the search root so a search never prompts once per file.
fn readable(policy: &PermissionPolicy, display: &str) -> bool {
    policy.evaluate(Capability::Read, Some(display)).0 != PermissionAction::Deny
}

fn has_parent_component(pattern: &str) -> bool {
    Path::new(pattern)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
}

pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files by glob pattern (e.g. \"src/**/*.rs\") relative to the workspace \
         or the given path."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string"},
                "path": {"type": "string", "description": "Directory to search from"}
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let pattern = required_str(args, "pattern")?.to_string();
        if Path::new(&pattern).is_absolute() || has_parent_component(&pattern) {
            anyhow::bail!("Glob pattern must stay inside the workspace: {}", pattern);
        }
        let root = match search_root(args, ctx).await? {
            Ok(root) => root,
            Err(denied) => return Ok(denied),
        };

        let workspace = ctx.workspace.clone();
        let policy = ctx.permissions.policy().clone();
        let full = root.join(&pattern).to_string_lossy().into_owned();
        let paths = tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
            let mut paths: Vec<PathBuf> = glob::glob(&full)
                .with_context(|| format!("Invalid glob pattern: {}", pattern))?
                .filter_map(|entry| entry.ok())
                .filter(|p| p.is_file())
                // Symlinked matches must land inside the workspace too
                .filter(|p| {
                    p.canonicalize()
                        .map(|real| real.starts_with(&workspace))
                        .unwrap_or(false)
                })
                .filter(|p| {
                    let display = p.strip_prefix(&workspace).unwrap_or(p).to_string_lossy();
                    readable(&policy, &display)
                })
                .collect();
            paths.sort();
            Ok(paths)
        })
        .await
        .context("glob task failed")??;

        if paths.is_empty() {
            return Ok(ToolOutput::success("No files found"));
        }
        let total = paths.len();
        let mut out: Vec<String> = paths
            .iter()
            .take(MAX_GLOB_RESULTS)
            .map(|p| ctx.display_path(p))
            .collect();
        if total > MAX_GLOB_RESULTS {
            out.push(format!("\n({} more files not shown)", total - MAX_GLOB_RESULTS));
        }
        Ok(ToolOutput::success(out.join("\n"))
            .with_metadata(serde_json::json!({ "count": total })))
    }
}

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search file contents with a regular expression. Honors .gitignore. \
         Use include to restrict file names (e.g. \"*.rs\")."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Regular expression"},
                "path": {"type": "string"},
                "include": {"type": "string", "description": "File name glob"}
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let pattern = required_str(args, "pattern")?;
        let regex = regex::Regex::new(pattern)
            .with_context(|| format!("Invalid regex: {}", pattern))?;
        let include = match args.get("include").and_then(|v| v.as_str()) {
            Some(glob) => Some(
                glob::Pattern::new(glob).with_context(|| format!("Invalid include glob: {}", glob))?,
            ),
            None => None,
        };
        let root = match search_root(args, ctx).await? {
            Ok(root) => root,
            Err(denied) => return Ok(denied),
        };

        let workspace = ctx.workspace.clone();
        let policy = ctx.permissions.policy().clone();
        let cancel = ctx.cancel.clone();
        let (matches, truncated) = tokio::task::spawn_blocking(move || {
            grep_files(&root, &workspace, &policy, &regex, include.as_ref(), &cancel)
        })
        .await
        .context("grep task failed")?;

        if matches.is_empty() {
            return Ok(ToolOutput::success("No matches found"));
        }
        let count = matches.len();
        let mut out = matches.join("\n");
        if truncated {
            out.push_str(&format!(
                "\n\n(Results truncated at {} matches. Narrow the pattern or path.)",
                MAX_GREP_MATCHES
            ));
        }
        Ok(ToolOutput::success(out)
            .with_metadata(serde_json::json!({ "matches": count, "truncated": truncated })))
    }
}

fn grep_files(
    root: &Path,
    workspace: &Path,
    policy: &PermissionPolicy,
    regex: &regex::Regex,
    include: Option<&glob::Pattern>,
    cancel: &tokio_util::sync::CancellationToken,
) -> (Vec<String>, bool) {
    let mut matches = Vec::new();
    for entry in ignore::WalkBuilder::new(root).build() {
        if cancel.is_cancelled() {
            break;
        }
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!("grep walk error: {}", e);
                continue;
            }
        };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if let Some(include) = include {
            let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            if !include.matches(&name) {
                continue;
            }
        }
        let display = path
            .strip_prefix(workspace)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        if !readable(policy, &display) {
            let denied_path = display.as_str();
            tracing::debug!(path = %denied_path, "grep skipped denied file");
            continue;
        }
        // Unreadable or non-UTF-8 files are skipped
        let Ok(text) = std::fs::read_to_string(path) else {
            continue;
        };
        for (i, line) in text.lines().enumerate() {
            if regex.is_match(line) {
                if matches.len() == MAX_GREP_MATCHES {
                    return (matches, true);
                }
                let line: String = line.chars().take(MAX_MATCH_LINE_CHARS).collect();
                matches.push(format!("{}:{}: {}", display, i + 1, line));
            }
        }
    }
    (matches, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::PermissionChecker;
    use std::sync::Arc;

    fn ctx(dir: &Path) -> ToolContext {
        ToolContext::new(dir, Arc::new(PermissionChecker::permissive()))
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn alpha() {}\n").unwrap();
        std::fs::write(dir.path().join("src/nested/mod.rs"), "fn beta() {}\nfn alpha_two() {}\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "alpha docs\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_glob_recursive() {
        let dir = fixture();
        let out = GlobTool
            .execute(&serde_json::json!({"pattern": "src/**/*.rs"}), &ctx(dir.path()))
            .await
            .unwrap();
        let lines: Vec<&str> = out.content.lines().collect();
        assert_eq!(lines, vec!["src/lib.rs", "src/nested/mod.rs"]);
    }

    #[tokio::test]
    async fn test_glob_with_path() {
        let dir = fixture();
        let out = GlobTool
            .execute(&serde_json::json!({"pattern": "*.rs", "path": "src/nested"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(out.content, "src/nested/mod.rs");
    }

    #[tokio::test]
    async fn test_glob_no_match() {
        let dir = fixture();
        let out = GlobTool
            .execute(&serde_json::json!({"pattern": "*.py"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(out.content, "No files found");
    }

    #[tokio::test]
    async fn test_grep_with_include() {
        let dir = fixture();
        let out = GrepTool
            .execute(
                &serde_json::json!({"pattern": "fn alpha", "include": "*.rs"}),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        assert!(out.content.contains("src/lib.rs:1: pub fn alpha() {}"));
        assert!(out.content.contains("src/nested/mod.rs:2: fn alpha_two() {}"));
        assert!(!out.content.contains("README"));
    }

    #[tokio::test]
    async fn test_grep_caps_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("many.txt"), "hit\n".repeat(150)).unwrap();
        let out = GrepTool
            .execute(&serde_json::json!({"pattern": "hit"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert_eq!(out.metadata.as_ref().unwrap()["matches"], MAX_GREP_MATCHES);
        assert!(out.content.contains("Results truncated"));
    }

    #[tokio::test]
    async fn test_grep_invalid_regex() {
        let dir = fixture();
        assert!(GrepTool
            .execute(&serde_json::json!({"pattern": "("}), &ctx(dir.path()))
            .await
            .is_err());
    }

    fn secrets_fixture() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("secrets")).unwrap();
        std::fs::write(dir.path().join("secrets/key.txt"), "API_KEY=topsecret\n").unwrap();
        std::fs::write(dir.path().join("config.txt"), "API_KEY=placeholder\n").unwrap();
        let policy = PermissionPolicy::new().deny_path("secrets/**").rule(
            Capability::Read,
            None,
            PermissionAction::Allow,
        );
        let ctx = ToolContext::new(dir.path(), Arc::new(PermissionChecker::new(policy)));
        (dir, ctx)
    }

    #[tokio::test]
    async fn test_grep_skips_denied_files() {
        let (_dir, ctx) = secrets_fixture();
        assert!(!ctx.permissions.check(Capability::Read, Some("secrets/key.txt")).await.allowed);

        let out = GrepTool
            .execute(&serde_json::json!({"pattern": "API_KEY"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.content, "config.txt:1: API_KEY=placeholder");
        assert!(!out.content.contains("topsecret"));
    }

    #[tokio::test]
    async fn test_glob_hides_denied_files() {
        let (_dir, ctx) = secrets_fixture();
        let out = GlobTool
            .execute(&serde_json::json!({"pattern": "**/*.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.content, "config.txt");
    }

    #[tokio::test]
    async fn test_glob_rejects_parent_segments() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(ws.join("inside.txt"), "in").unwrap();
        std::fs::write(tmp.path().join("outside.txt"), "out").unwrap();

        let result = GlobTool
            .execute(&serde_json::json!({"pattern": "../*.txt"}), &ctx(&ws))
            .await;
        assert!(result.is_err());

        let out = GlobTool
            .execute(&serde_json::json!({"pattern": "sub/../../*.txt"}), &ctx(&ws))
            .await;
        assert!(out.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_glob_drops_symlinks_leaving_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = tmp.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(tmp.path().join("outside.txt"), "out").unwrap();
        std::fs::write(ws.join("inside.txt"), "in").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("outside.txt"), ws.join("link.txt")).unwrap();

        let out = GlobTool
            .execute(&serde_json::json!({"pattern": "*.txt"}), &ctx(&ws))
            .await
            .unwrap();
        assert_eq!(out.content, "inside.txt");
    }
}
