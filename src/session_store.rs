//! In-memory session registry (§4.1), grounded on the teacher's
//! `DashMap`-backed agent registry in `orchestrator/mod.rs`
//! (`DashMap<String, ClaudeCodeAgent>`), generalized to the two-map
//! session/issue index this component needs and backed by a persistence
//! queue per session instead of a single global one.

use crate::contracts::SessionStorage;
use crate::error::{ResultExt, StorageError};
use crate::model::Session;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};
use tracing::{error, warn};

const PERSIST_RETRY_BACKOFFS_MS: [u64; 3] = [100, 400, 1600];

/// One ordered, per-session persistence queue. Writes are enqueued here so
/// `SessionStore` operations never block on storage I/O (§4.1).
struct PersistWorker {
    tx: mpsc::UnboundedSender<Session>,
}

impl PersistWorker {
    fn spawn(session_id: String, storage: Arc<dyn SessionStorage>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Session>();
        tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                if let Err(e) = persist_with_retry(&storage, &snapshot).await {
                    error!(session_id = %session_id, error = %e, "persistence exhausted retries");
                }
            }
        });
        Self { tx }
    }

    fn enqueue(&self, session: Session) {
        // The worker task owns the receiver; a closed channel means the
        // owning session was already removed, so a failed send is fine to
        // ignore.
        let _ = self.tx.send(session);
    }
}

async fn persist_with_retry(storage: &Arc<dyn SessionStorage>, session: &Session) -> Result<(), StorageError> {
    let mut last_err = None;
    for (attempt, backoff_ms) in PERSIST_RETRY_BACKOFFS_MS.iter().enumerate() {
        match storage.persist(session).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(attempt = attempt + 1, session_id = %session.id, error = %e, "persist attempt failed");
                last_err = Some(e);
                sleep(Duration::from_millis(*backoff_ms)).await;
            }
        }
    }
    match storage.persist(session).await {
        Ok(()) => Ok(()),
        Err(e) => {
            last_err = Some(e);
            Err(StorageError::Unavailable {
                attempts: PERSIST_RETRY_BACKOFFS_MS.len() as u32 + 1,
                source: last_err.unwrap(),
            })
        }
    }
}

/// Registry of live sessions, keyed by session id and by issue id (§3, §4.1,
/// P1). One logical lock for the maps; per-session data is mutated only by
/// the owning supervisor, enforced by convention (the store hands out owned
/// clones, never references into the map).
pub struct SessionStore {
    by_id: DashMap<String, Session>,
    by_issue: DashMap<String, String>,
    persist_workers: DashMap<String, PersistWorker>,
    storage: Arc<dyn SessionStorage>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self {
            by_id: DashMap::new(),
            by_issue: DashMap::new(),
            persist_workers: DashMap::new(),
            storage,
        }
    }

    /// Atomically inserts `session` unless a session already exists for its
    /// id or its issue already has a live session (P1).
    pub fn insert_if_absent(&self, session: Session) -> anyhow::Result<()> {
        if self.by_id.contains_key(&session.id) {
            anyhow::bail!(crate::error::CoreError::SessionAlreadyExists(session.id.clone()));
        }
        if self.by_issue.contains_key(&session.issue_id) {
            anyhow::bail!(crate::error::CoreError::IssueAlreadyHasSession(
                session.issue_id.clone()
            ));
        }

        self.by_issue.insert(session.issue_id.clone(), session.id.clone());
        let worker = PersistWorker::spawn(session.id.clone(), self.storage.clone());
        worker.enqueue(session.clone());
        self.persist_workers.insert(session.id.clone(), worker);
        self.by_id.insert(session.id.clone(), session);
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.by_id.get(session_id).map(|r| r.value().clone())
    }

    pub fn get_by_issue(&self, issue_id: &str) -> Option<Session> {
        let session_id = self.by_issue.get(issue_id)?.value().clone();
        self.get(&session_id)
    }

    /// Copy-on-write update: reads the current snapshot, applies `f`, writes
    /// the result back, and enqueues a persistence flush for the new
    /// snapshot.
    pub fn update<F>(&self, session_id: &str, f: F) -> anyhow::Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let mut entry = self
            .by_id
            .get_mut(session_id)
            .ok_or_else(|| crate::error::CoreError::SessionNotFound(session_id.to_string()))?;
        f(&mut entry);
        let updated = entry.clone();
        drop(entry);

        if let Some(worker) = self.persist_workers.get(session_id) {
            worker.enqueue(updated.clone());
        }
        Ok(updated)
    }

    pub fn remove(&self, session_id: &str) -> Option<Session> {
        let removed = self.by_id.remove(session_id).map(|(_, s)| s);
        if let Some(session) = &removed {
            self.by_issue.remove(&session.issue_id);
        }
        self.persist_workers.remove(session_id);
        removed
    }

    /// Deep-copied view of every live session, for external readers (§5).
    pub fn snapshot(&self) -> Vec<Session> {
        self.by_id.iter().map(|r| r.value().clone()).collect()
    }

    /// Live-session count for one repository (§4.8's "default 1 per
    /// repository" admission cap is enforced per repository, not globally).
    pub fn count_non_terminal(&self, repository_id: &str) -> usize {
        self.by_id
            .iter()
            .filter(|r| r.value().repository_id == repository_id && r.value().state.is_non_terminal_active())
            .count()
    }

    /// Process-wide live-session count, for status reporting only — never
    /// use this for an admission check (§4.8's cap is per repository).
    pub fn count_non_terminal_all(&self) -> usize {
        self.by_id
            .iter()
            .filter(|r| r.value().state.is_non_terminal_active())
            .count()
    }

    pub async fn restore(&self) -> anyhow::Result<usize> {
        let ids = self
            .storage
            .list()
            .await
            .context_op("list persisted sessions")?;
        let mut restored = 0;
        for id in ids {
            if let Some(session) = self
                .storage
                .load(&id)
                .await
                .context_op("load persisted session")?
            {
                if !session.state.is_terminal() {
                    self.by_issue.insert(session.issue_id.clone(), session.id.clone());
                    let worker = PersistWorker::spawn(session.id.clone(), self.storage.clone());
                    self.persist_workers.insert(session.id.clone(), worker);
                    self.by_id.insert(session.id.clone(), session);
                    restored += 1;
                }
            }
        }
        Ok(restored)
    }
}
