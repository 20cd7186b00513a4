//! Crash-recoverable session store over a single JSON document.
//!
//! All writes take the store-wide advisory lock, recompute the full document
//! in memory, write it to a temporary file in the same directory, and
//! atomically rename it over the live document. External readers (a UI
//! polling the file) therefore always observe either the previous or the
//! next complete version, never a torn write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::session::{Session, SessionPatch};
use crate::store::lock::StoreLock;
use crate::{AppError, Result};

/// Current on-disk schema version.
const SCHEMA_VERSION: u32 = 1;

/// The backing document: schema header plus the session map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
struct StoreDocument {
    schema_version: u32,
    updated_at: DateTime<Utc>,
    sessions: HashMap<String, Session>,
}

impl StoreDocument {
    fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            updated_at: Utc::now(),
            sessions: HashMap::new(),
        }
    }
}

/// Durable session records for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    lock: StoreLock,
    lock_deadline: Duration,
}

impl SessionStore {
    /// Create a store over the document at `path`.
    ///
    /// Nothing is touched on disk until the first write; a missing document
    /// reads as "no sessions recorded".
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock = StoreLock::for_document(&path);
        Self {
            path,
            lock,
            lock_deadline: Duration::from_secs(5),
        }
    }

    /// Override the per-write lock acquisition deadline.
    #[must_use]
    pub fn with_lock_deadline(mut self, deadline: Duration) -> Self {
        self.lock_deadline = deadline;
        self
    }

    /// Override the lock staleness TTL (crashed-holder takeover).
    #[must_use]
    pub fn with_lock_stale_ttl(mut self, ttl: Duration) -> Self {
        self.lock = self.lock.with_stale_ttl(ttl);
        self
    }

    /// Path of the backing document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merge `patch` into the session under `session_id`, creating the
    /// record when absent, and return the stored result.
    ///
    /// Unspecified patch fields keep their previous value; `updated_at` is
    /// always refreshed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LockTimeout` (retryable) when the store lock cannot
    /// be acquired, or `AppError::Store`/`AppError::Io` on write failures.
    pub async fn upsert(&self, session_id: &str, patch: SessionPatch) -> Result<Session> {
        let guard = self.lock.acquire(self.lock_deadline).await?;

        let mut doc = self.read_document().await;
        let merged = match doc.sessions.remove(session_id) {
            Some(existing) => patch.apply_to(existing),
            None => patch.into_new_session(session_id),
        };
        doc.sessions.insert(session_id.to_owned(), merged.clone());
        self.write_document(&mut doc).await?;

        guard.release().await?;
        Ok(merged)
    }

    /// Move the record under `old_id` to `new_id`.
    ///
    /// Used when the supervised process announces its own session identifier
    /// and the provisional id must be corrected. A no-op when the ids match.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` when no record exists under `old_id`,
    /// or the usual lock/write errors.
    pub async fn rebind(&self, old_id: &str, new_id: &str) -> Result<Session> {
        if old_id == new_id {
            return self.read(old_id).await;
        }

        let guard = self.lock.acquire(self.lock_deadline).await?;

        let mut doc = self.read_document().await;
        let Some(mut session) = doc.sessions.remove(old_id) else {
            guard.release().await?;
            return Err(AppError::NotFound(format!("session {old_id} not found")));
        };
        session.session_id = new_id.to_owned();
        session.updated_at = Utc::now();
        doc.sessions.insert(new_id.to_owned(), session.clone());
        self.write_document(&mut doc).await?;

        guard.release().await?;
        debug!(old_id, new_id, "session rebound to announced id");
        Ok(session)
    }

    /// Read one session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` when no record exists under `session_id`.
    pub async fn read(&self, session_id: &str) -> Result<Session> {
        self.read_document()
            .await
            .sessions
            .remove(session_id)
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))
    }

    /// Read the full session map.
    pub async fn read_all(&self) -> HashMap<String, Session> {
        self.read_document().await.sessions
    }

    /// Load the document; corruption or absence reads as empty.
    async fn read_document(&self) -> StoreDocument {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<StoreDocument>(&bytes) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        %err,
                        "session store document corrupted; treating as empty"
                    );
                    StoreDocument::empty()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreDocument::empty(),
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    %err,
                    "session store document unreadable; treating as empty"
                );
                StoreDocument::empty()
            }
        }
    }

    /// Serialize the full document and atomically replace the live file.
    async fn write_document(&self, doc: &mut StoreDocument) -> Result<()> {
        doc.schema_version = SCHEMA_VERSION;
        doc.updated_at = Utc::now();

        let parent = self
            .path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|err| AppError::Io(format!("create store directory: {err}")))?;

        let body = serde_json::to_vec_pretty(doc)
            .map_err(|err| AppError::Store(format!("serialize store document: {err}")))?;

        // tempfile::persist is a rename on the same filesystem, so the live
        // document flips from old to new in one step.
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            use std::io::Write;
            let mut tmp = tempfile::NamedTempFile::new_in(&parent)
                .map_err(|err| AppError::Io(format!("create temp store file: {err}")))?;
            tmp.write_all(&body)
                .map_err(|err| AppError::Io(format!("write temp store file: {err}")))?;
            tmp.flush()
                .map_err(|err| AppError::Io(format!("flush temp store file: {err}")))?;
            tmp.persist(&path)
                .map_err(|err| AppError::Io(format!("replace store document: {err}")))?;
            Ok(())
        })
        .await
        .map_err(|err| AppError::Store(format!("store writer task panicked: {err}")))?
    }
}
