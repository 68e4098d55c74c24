//! Session persistence
//!
//! A [`SessionStore`] owns complete conversation snapshots. Two backends ship
//! with the crate:
//!
//! - [`FileSessionStore`]: one pretty-printed JSON file per session
//! - [`MemorySessionStore`]: in-process map for tests and embedding
//!
//! Every store hands out a [`SessionGuard`] through [`SessionStore::acquire`]
//! so that at most one orchestrator drives a given session at a time.

mod file;
mod memory;

pub use file::FileSessionStore;
pub use memory::MemorySessionStore;

use crate::error::Result;
use crate::message::Session;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

/// Lightweight listing entry for a stored session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub path: PathBuf,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            path: session.path.clone(),
            title: session.display_title(),
            created_at: session.created_at,
            updated_at: session.updated_at,
            message_count: session.messages.len(),
        }
    }
}

/// Session storage backend
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Create and persist an empty session rooted at `path`
    async fn create(&self, path: &Path) -> Result<Session>;

    /// Load a session; `None` if it does not exist
    async fn get(&self, id: &str) -> Result<Option<Session>>;

    /// Bump `updated_at` and persist the full snapshot
    async fn update(&self, session: &mut Session) -> Result<()>;

    /// Summaries, most recently updated first, optionally limited to one working directory
    async fn list(&self, path: Option<&Path>) -> Result<Vec<SessionSummary>>;

    /// Remove a session. Returns whether anything was deleted.
    ///
    /// Fails with [`crate::ConverseError::Store`] while the session is held
    /// through [`SessionStore::acquire`], so a running conversation cannot
    /// recreate it on its next update.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Delete sessions not updated within `max_age`. Sessions currently
    /// held through [`SessionStore::acquire`] are kept; ownership is taken
    /// for the duration of each removal.
    async fn prune(&self, max_age: Duration) -> Result<usize>;

    /// Wait for exclusive ownership of a session
    async fn acquire(&self, id: &str) -> SessionGuard;

    /// Backend name for logging
    fn backend_name(&self) -> &str;
}

/// Exclusive hold on one session; released on drop
#[derive(Debug)]
pub struct SessionGuard {
    id: String,
    _guard: OwnedMutexGuard<()>,
}

impl SessionGuard {
    pub fn session_id(&self) -> &str {
        &self.id
    }
}

/// Map of per-ID async mutexes
#[derive(Debug, Default)]
pub(crate) struct SessionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(id.to_string()).or_default().clone()
    }

    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(id).lock_owned().await
    }

    pub async fn acquire(&self, id: &str) -> SessionGuard {
        SessionGuard {
            id: id.to_string(),
            _guard: self.lock(id).await,
        }
    }

    /// Take the lock for `id` only if nobody holds it
    pub fn try_lock(&self, id: &str) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(id).try_lock_owned().ok()
    }

    /// Whether someone currently holds the lock for `id`
    #[cfg(test)]
    pub fn is_held(&self, id: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .get(id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Drop the entry for a deleted session unless it is in use
    pub fn forget(&self, id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if locks
            .get(id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1 && lock.try_lock().is_ok())
        {
            locks.remove(id);
        }
    }
}

/// Oldest `updated_at` that survives a prune with the given age
pub(crate) fn prune_cutoff(max_age: Duration) -> DateTime<Utc> {
    let age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(age)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Sort newest first, then filter by working directory
pub(crate) fn finish_listing(
    mut summaries: Vec<SessionSummary>,
    path: Option<&Path>,
) -> Vec<SessionSummary> {
    if let Some(path) = path {
        summaries.retain(|s| s.path == path);
    }
    summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
    summaries
}
