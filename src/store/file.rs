//! File-backed session store

use super::{finish_listing, prune_cutoff, SessionGuard, SessionLocks, SessionStore, SessionSummary};
use crate::error::{ConverseError, Result};
use crate::message::Session;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Stores each session as `<dir>/<id>.json`
pub struct FileSessionStore {
    dir: PathBuf,
    writes: SessionLocks,
    owners: SessionLocks,
}

impl FileSessionStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| {
            ConverseError::Store(format!(
                "Failed to create session directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir,
            writes: SessionLocks::new(),
            owners: SessionLocks::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path for a session ID, with separators and `..` neutralized
    fn session_path(&self, id: &str) -> PathBuf {
        let safe_id = id.replace(['/', '\\'], "_").replace("..", "_");
        self.dir.join(format!("{}.json", safe_id))
    }

    async fn write(&self, session: &Session) -> Result<()> {
        let _write = self.writes.lock(&session.id).await;
        let path = self.session_path(&session.id);
        let json = serde_json::to_string_pretty(session)?;

        let temp_path = path.with_extension("json.tmp");
        let store_err = |what: &str, e: std::io::Error| {
            ConverseError::Store(format!("Failed to {} session {}: {}", what, session.id, e))
        };
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| store_err("create temp file for", e))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| store_err("write", e))?;
        file.sync_all().await.map_err(|e| store_err("sync", e))?;
        drop(file);
        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| store_err("rename", e))?;

        tracing::debug!("Saved session {} to {}", session.id, path.display());
        Ok(())
    }

    async fn remove_file(&self, id: &str) -> Result<bool> {
        let _write = self.writes.lock(id).await;
        let path = self.session_path(id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("Deleted session {} from {}", id, path.display());
                drop(_write);
                self.writes.forget(id);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ConverseError::Store(format!(
                "Failed to delete session file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn read(&self, path: &Path) -> Result<Option<Session>> {
        let json = match fs::read_to_string(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConverseError::Store(format!(
                    "Failed to read session file {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let session = serde_json::from_str(&json).map_err(|e| {
            ConverseError::Store(format!(
                "Failed to parse session file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Some(session))
    }

    async fn load_all(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await.map_err(|e| {
            ConverseError::Store(format!(
                "Failed to read session directory {}: {}",
                self.dir.display(),
                e
            ))
        })?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            match self.read(&path).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable session file: {}", e),
            }
        }
        Ok(sessions)
    }
}

#[async_trait::async_trait]
impl SessionStore for FileSessionStore {
    async fn create(&self, path: &Path) -> Result<Session> {
        let session = Session::new(path);
        self.write(&session).await?;
        tracing::info!(session_id = %session.id, "Created session");
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        self.read(&self.session_path(id)).await
    }

    async fn update(&self, session: &mut Session) -> Result<()> {
        session.updated_at = Utc::now();
        self.write(session).await
    }

    async fn list(&self, path: Option<&Path>) -> Result<Vec<SessionSummary>> {
        let summaries = self
            .load_all()
            .await?
            .iter()
            .map(SessionSummary::from)
            .collect();
        Ok(finish_listing(summaries, path))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let Some(owner) = self.owners.try_lock(id) else {
            return Err(ConverseError::Store(format!("Session {} is in use", id)));
        };
        let deleted = self.remove_file(id).await;
        drop(owner);
        self.owners.forget(id);
        deleted
    }

    async fn prune(&self, max_age: Duration) -> Result<usize> {
        let cutoff = prune_cutoff(max_age);
        let mut removed = 0;
        for session in self.load_all().await? {
            if session.updated_at >= cutoff {
                continue;
            }
            // Held sessions belong to a running conversation
            let Some(owner) = self.owners.try_lock(&session.id) else {
                continue;
            };
            let deleted = self.remove_file(&session.id).await;
            drop(owner);
            self.owners.forget(&session.id);
            if deleted? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Pruned stale sessions");
        }
        Ok(removed)
    }

    async fn acquire(&self, id: &str) -> SessionGuard {
        self.owners.acquire(id).await
    }

    fn backend_name(&self) -> &str {
        "file"
    }
}
