//! File tools: read, write, edit

use crate::permissions::Capability;
use crate::tools::types::required_str;
use crate::tools::{Tool, ToolContext, ToolOutput};
use anyhow::{Context, Result};
use async_trait::async_trait;
use similar::TextDiff;

/// Default and maximum lines returned by one read
pub const MAX_READ_LINES: usize = 2000;
/// Longer lines are cut
pub const MAX_LINE_CHARS: usize = 2000;

fn cut_line(line: &str) -> String {
    match line.char_indices().nth(MAX_LINE_CHARS) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}

fn looks_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(8192).any(|b| *b == 0)
}

fn usize_arg(args: &serde_json::Value, key: &str) -> Option<usize> {
    args.get(key).and_then(|v| v.as_u64()).map(|v| v as usize)
}

pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace. Returns numbered lines. \
         Use offset (1-based) and limit to page through large files."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": {"type": "string", "description": "Path relative to the workspace"},
                "offset": {"type": "integer", "description": "First line to read (1-based)"},
                "limit": {"type": "integer", "description": "Maximum lines to read (default 2000)"}
            },
            "required": ["file_path"]
        })
    }

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let file_path = required_str(args, "file_path")?;
        let path = ctx.resolve_path(file_path)?;
        let display = ctx.display_path(&path);

        let decision = ctx.permissions.check(Capability::Read, Some(&display)).await;
        if !decision.allowed {
            return Ok(ToolOutput::success(decision.denial_message()));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", display))?;
        if looks_binary(&bytes) {
            anyhow::bail!("{} appears to be a binary file", display);
        }
        let text = String::from_utf8_lossy(&bytes);

        let offset = usize_arg(args, "offset").unwrap_or(1).max(1);
        let limit = usize_arg(args, "limit")
            .unwrap_or(MAX_READ_LINES)
            .clamp(1, MAX_READ_LINES);

        let total = text.lines().count();
        let mut out = String::new();
        for (i, line) in text.lines().enumerate().skip(offset - 1).take(limit) {
            out.push_str(&format!("{:>6}\t{}\n", i + 1, cut_line(line)));
        }
        let last = (offset - 1 + limit).min(total);
        if last < total {
            out.push_str(&format!(
                "\n(File has {} lines. Use offset {} to read beyond line {})",
                total,
                last + 1,
                last
            ));
        }
        if total == 0 {
            out.push_str("(empty file)");
        }

        ctx.log(format!("read {} ({} lines)", display, total));
        Ok(ToolOutput::success(out)
            .with_title(display)
            .with_metadata(serde_json::json!({ "lines": total })))
    }
}

pub struct WriteTool;

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write a file in the workspace, creating parent directories and \
         overwriting any existing content."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["file_path", "content"]
        })
    }

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let file_path = required_str(args, "file_path")?;
        let content = required_str(args, "content")?;
        let path = ctx.resolve_path(file_path)?;
        let display = ctx.display_path(&path);

        let decision = ctx.permissions.check(Capability::Write, Some(&display)).await;
        if !decision.allowed {
            return Ok(ToolOutput::success(decision.denial_message()));
        }

        let existed = tokio::fs::try_exists(&path).await.unwrap_or(false);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory for {}", display))?;
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write {}", display))?;

        ctx.log(format!("wrote {} bytes to {}", content.len(), display));
        Ok(ToolOutput::success(format!(
            "{} {} ({} bytes)",
            if existed { "Overwrote" } else { "Created" },
            display,
            content.len()
        ))
        .with_title(display)
        .with_metadata(serde_json::json!({ "bytes": content.len(), "created": !existed })))
    }
}

pub struct EditTool;

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> &str {
        "Replace an exact string in a file. old_string must be unique unless \
         replace_all is set. An empty old_string creates a new file."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": {"type": "string"},
                "old_string": {"type": "string"},
                "new_string": {"type": "string"},
                "replace_all": {"type": "boolean", "default": false}
            },
            "required": ["file_path", "old_string", "new_string"]
        })
    }

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let file_path = required_str(args, "file_path")?;
        let old_string = required_str(args, "old_string")?;
        let new_string = required_str(args, "new_string")?;
        let replace_all = args
            .get("replace_all")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if old_string == new_string {
            anyhow::bail!("old_string and new_string are identical");
        }

        let path = ctx.resolve_path(file_path)?;
        let display = ctx.display_path(&path);

        let decision = ctx.permissions.check(Capability::Edit, Some(&display)).await;
        if !decision.allowed {
            return Ok(ToolOutput::success(decision.denial_message()));
        }

        let exists = tokio::fs::try_exists(&path).await.unwrap_or(false);
        let (before, after, replacements) = if old_string.is_empty() {
            if exists {
                anyhow::bail!("{} already exists; old_string must not be empty", display);
            }
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            (String::new(), new_string.to_string(), 1)
        } else {
            let before = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", display))?;
            let count = before.matches(old_string).count();
            match count {
                0 => anyhow::bail!("old_string not found in {}", display),
                n if n > 1 && !replace_all => anyhow::bail!(
                    "old_string appears {} times in {}; add surrounding context or set replace_all",
                    n,
                    display
                ),
                _ => {}
            }
            let after = if replace_all {
                before.replace(old_string, new_string)
            } else {
                before.replacen(old_string, new_string, 1)
            };
            let replacements = if replace_all { count } else { 1 };
            (before, after, replacements)
        };

        tokio::fs::write(&path, &after)
            .await
            .with_context(|| format!("Failed to write {}", display))?;

        let diff = TextDiff::from_lines(before.as_str(), after.as_str())
            .unified_diff()
            .context_radius(3)
            .header(&display, &display)
            .to_string();

        ctx.log(format!("edited {} ({} replacements)", display, replacements));
        Ok(ToolOutput::success(format!(
            "Edited {} ({} replacement{})",
            display,
            replacements,
            if replacements == 1 { "" } else { "s" }
        ))
        .with_title(display)
        .with_metadata(serde_json::json!({ "diff": diff, "replacements": replacements })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{PermissionAction, PermissionChecker, PermissionPolicy};
    use std::path::Path;
    use std::sync::Arc;

    fn ctx(dir: &Path) -> ToolContext {
        ToolContext::new(dir, Arc::new(PermissionChecker::permissive()))
    }

    #[tokio::test]
    async fn test_read_numbered_with_offset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\nfour\n").unwrap();
        let out = ReadTool
            .execute(
                &serde_json::json!({"file_path": "a.txt", "offset": 2, "limit": 2}),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        assert!(out.content.starts_with("     2\ttwo\n     3\tthree\n"));
        assert!(out.content.contains("Use offset 4"));
        assert_eq!(out.title.as_deref(), Some("a.txt"));
    }

    #[tokio::test]
    async fn test_read_cuts_long_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("long.txt"), "x".repeat(MAX_LINE_CHARS + 10)).unwrap();
        let out = ReadTool
            .execute(&serde_json::json!({"file_path": "long.txt"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert!(out.content.contains(&format!("{}...", "x".repeat(MAX_LINE_CHARS))));
    }

    #[tokio::test]
    async fn test_read_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReadTool
            .execute(&serde_json::json!({"file_path": "nope.txt"}), &ctx(dir.path()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read nope.txt"));
    }

    #[tokio::test]
    async fn test_read_binary_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.bin"), [0u8, 1, 2]).unwrap();
        assert!(ReadTool
            .execute(&serde_json::json!({"file_path": "b.bin"}), &ctx(dir.path()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let out = WriteTool
            .execute(
                &serde_json::json!({"file_path": "x/y/z.txt", "content": "hello"}),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        assert!(out.content.starts_with("Created x/y/z.txt"));
        assert_eq!(std::fs::read_to_string(dir.path().join("x/y/z.txt")).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_write_denied_is_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let checker = PermissionChecker::new(PermissionPolicy::new().rule(
            Capability::Write,
            None,
            PermissionAction::Deny,
        ));
        let ctx = ToolContext::new(dir.path(), Arc::new(checker));
        let out = WriteTool
            .execute(&serde_json::json!({"file_path": "a.txt", "content": "x"}), &ctx)
            .await
            .unwrap();
        assert!(!out.is_error);
        assert!(out.content.starts_with("Permission denied"));
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_edit_unique_replacement() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.rs"), "fn a() {}\nfn b() {}\n").unwrap();
        let out = EditTool
            .execute(
                &serde_json::json!({"file_path": "f.rs", "old_string": "fn b", "new_string": "fn c"}),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(out.content, "Edited f.rs (1 replacement)");
        let diff = out.metadata.unwrap()["diff"].as_str().unwrap().to_string();
        assert!(diff.contains("-fn b() {}"));
        assert!(diff.contains("+fn c() {}"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.rs")).unwrap(),
            "fn a() {}\nfn c() {}\n"
        );
    }

    #[tokio::test]
    async fn test_edit_ambiguous_requires_replace_all() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a a a").unwrap();
        let ctx = ctx(dir.path());
        let err = EditTool
            .execute(
                &serde_json::json!({"file_path": "f.txt", "old_string": "a", "new_string": "b"}),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("appears 3 times"));

        let out = EditTool
            .execute(
                &serde_json::json!({"file_path": "f.txt", "old_string": "a", "new_string": "b", "replace_all": true}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(out.content.contains("3 replacements"));
        assert_eq!(std::fs::read_to_string(dir.path().join("f.txt")).unwrap(), "b b b");
    }

    #[tokio::test]
    async fn test_edit_not_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "abc").unwrap();
        let err = EditTool
            .execute(
                &serde_json::json!({"file_path": "f.txt", "old_string": "zzz", "new_string": "y"}),
                &ctx(dir.path()),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_edit_empty_old_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        EditTool
            .execute(
                &serde_json::json!({"file_path": "new.txt", "old_string": "", "new_string": "hi"}),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("new.txt")).unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_path_escape_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(WriteTool
            .execute(
                &serde_json::json!({"file_path": "../evil.txt", "content": "x"}),
                &ctx(dir.path()),
            )
            .await
            .is_err());
    }
}
