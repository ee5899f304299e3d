use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::Session;
use crate::error::{Error, Result};

struct Entry {
    session: Arc<Session>,
    last_activity: Instant,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, Entry>,
    /// Ids ended on request, with the time they were ended. A retired id is
    /// not implicitly recreated.
    retired: HashMap<String, Instant>,
}

/// Point-in-time view of one registry entry.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: Instant,
}

/// Shared map from conversation id to session.
///
/// Every mutation happens under one write lock. Operations that take a
/// session out hand back the `Arc` so teardown runs after the lock is
/// released.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `id`, inserting the one built by `make` if
    /// there is none. Concurrent callers for a new id all receive the same
    /// session; `make` runs at most once. Retired ids are not recreated.
    pub async fn get_or_create(
        &self,
        id: &str,
        make: impl FnOnce() -> Session,
    ) -> Result<(Arc<Session>, bool)> {
        let mut inner = self.inner.write().await;
        if inner.retired.contains_key(id) {
            return Err(Error::not_found(id));
        }
        let now = Instant::now();
        if let Some(entry) = inner.sessions.get_mut(id) {
            entry.last_activity = now;
            return Ok((entry.session.clone(), false));
        }
        let session = Arc::new(make());
        inner.sessions.insert(
            id.to_string(),
            Entry {
                session: session.clone(),
                last_activity: now,
            },
        );
        debug!(conversation_id = %id, "Registered new session");
        Ok((session, true))
    }

    /// Look up `id` and bump its activity.
    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().await;
        let entry = inner.sessions.get_mut(id)?;
        entry.last_activity = Instant::now();
        Some(entry.session.clone())
    }

    pub async fn touch(&self, id: &str) {
        if let Some(entry) = self.inner.write().await.sessions.get_mut(id) {
            entry.last_activity = Instant::now();
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.sessions.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Detach and return the session for `id`.
    pub async fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.inner
            .write()
            .await
            .sessions
            .remove(id)
            .map(|entry| entry.session)
    }

    /// Detach `id` and remember it as ended, in one step.
    pub async fn retire(&self, id: &str) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().await;
        let entry = inner.sessions.remove(id)?;
        inner.retired.insert(id.to_string(), Instant::now());
        Some(entry.session)
    }

    /// Remove `id` only if it still maps to `session`. Returns whether an
    /// entry was removed.
    pub async fn remove_exact(&self, id: &str, session: &Arc<Session>) -> bool {
        let mut inner = self.inner.write().await;
        let matches = inner
            .sessions
            .get(id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.session, session));
        if matches {
            inner.sessions.remove(id);
        }
        matches
    }

    /// Remove `id` if, at `now`, it has been idle strictly longer than
    /// `threshold`. Activity since the caller's snapshot keeps it alive, and
    /// so does a call still holding the kernel.
    pub async fn remove_if_idle(
        &self,
        id: &str,
        now: Instant,
        threshold: Duration,
    ) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().await;
        let entry = inner.sessions.get(id)?;
        let idle = now.saturating_duration_since(entry.last_activity);
        if idle > threshold && !entry.session.is_busy() {
            inner.sessions.remove(id).map(|entry| entry.session)
        } else {
            None
        }
    }

    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.inner
            .read()
            .await
            .sessions
            .iter()
            .map(|(id, entry)| SessionSnapshot {
                conversation_id: id.clone(),
                created_at: entry.session.created_at(),
                last_activity: entry.last_activity,
            })
            .collect()
    }

    /// Forget ended ids older than `ttl`. Returns how many were dropped.
    pub async fn prune_retired(&self, now: Instant, ttl: Duration) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.retired.len();
        inner
            .retired
            .retain(|_, ended| now.saturating_duration_since(*ended) <= ttl);
        before - inner.retired.len()
    }

    /// Detach every session.
    pub async fn drain(&self) -> Vec<Arc<Session>> {
        self.inner
            .write()
            .await
            .sessions
            .drain()
            .map(|(_, entry)| entry.session)
            .collect()
    }
}
