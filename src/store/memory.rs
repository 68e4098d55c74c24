//! In-memory session store

use super::{finish_listing, prune_cutoff, SessionGuard, SessionLocks, SessionStore, SessionSummary};
use crate::error::{ConverseError, Result};
use crate::message::Session;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::RwLock;

/// Keeps sessions in a process-local map. Nothing survives a restart.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    owners: SessionLocks,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            owners: SessionLocks::new(),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, path: &Path) -> Result<Session> {
        let session = Session::new(path);
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn update(&self, session: &mut Session) -> Result<()> {
        session.updated_at = Utc::now();
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn list(&self, path: Option<&Path>) -> Result<Vec<SessionSummary>> {
        let summaries = self
            .sessions
            .read()
            .await
            .values()
            .map(SessionSummary::from)
            .collect();
        Ok(finish_listing(summaries, path))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let Some(owner) = self.owners.try_lock(id) else {
            return Err(ConverseError::Store(format!("Session {} is in use", id)));
        };
        let deleted = self.sessions.write().await.remove(id).is_some();
        drop(owner);
        self.owners.forget(id);
        Ok(deleted)
    }

    async fn prune(&self, max_age: Duration) -> Result<usize> {
        let cutoff = prune_cutoff(max_age);
        let mut taken = Vec::new();
        {
            let mut sessions = self.sessions.write().await;
            sessions.retain(|id, s| {
                if s.updated_at >= cutoff {
                    return true;
                }
                match self.owners.try_lock(id) {
                    Some(owner) => {
                        taken.push((id.clone(), owner));
                        false
                    }
                    None => true,
                }
            });
        }
        let removed = taken.len();
        for (id, owner) in taken {
            drop(owner);
            self.owners.forget(&id);
        }
        Ok(removed)
    }

    async fn acquire(&self, id: &str) -> SessionGuard {
        self.owners.acquire(id).await
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}
