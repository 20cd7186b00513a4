//! Advisory file lock scoped to one session store.
//!
//! Acquisition creates a lock file that must not already exist, so exactly
//! one holder wins; losers retry with exponential backoff and jitter until a
//! bounded deadline elapses. The lock file records its holder and an expiry
//! time so a lock left behind by a crashed process can be taken over once
//! stale instead of wedging the store forever.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{AppError, Result};

/// Base backoff between acquisition attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(25);

/// Ceiling on the backoff between acquisition attempts.
const BACKOFF_MAX: Duration = Duration::from_millis(400);

/// Lock file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LockInfo {
    /// Unique holder id for this acquisition.
    pub holder_id: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock becomes stale and may be taken over.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    fn new(holder_id: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            holder_id: holder_id.to_owned(),
            acquired_at: now,
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30)),
        }
    }

    /// Whether this lock has outlived its TTL.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Advisory lock guarding one store's backing document.
#[derive(Debug, Clone)]
pub struct StoreLock {
    lock_path: PathBuf,
    holder_id: String,
    stale_ttl: Duration,
}

impl StoreLock {
    /// Create a lock handle for the document at `document_path`.
    ///
    /// The lock file lives next to the document (`<document>.lock`); each
    /// handle gets a unique holder id.
    #[must_use]
    pub fn for_document(document_path: &Path) -> Self {
        let mut lock_path = document_path.as_os_str().to_owned();
        lock_path.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_path),
            holder_id: Uuid::new_v4().to_string(),
            stale_ttl: Duration::from_secs(30),
        }
    }

    /// Override the staleness TTL after which a leftover lock is taken over.
    #[must_use]
    pub fn with_stale_ttl(mut self, ttl: Duration) -> Self {
        self.stale_ttl = ttl;
        self
    }

    /// The holder id this handle acquires under.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Acquire the lock, retrying with backoff until `deadline` elapses.
    ///
    /// # Errors
    ///
    /// Returns `AppError::LockTimeout` (retryable) when the lock is still
    /// held by a live holder at the deadline, or `AppError::Io` on
    /// filesystem failures other than contention.
    pub async fn acquire(&self, deadline: Duration) -> Result<LockGuard> {
        let give_up = Instant::now() + deadline;
        let mut backoff = BACKOFF_BASE;

        loop {
            match self.try_acquire().await? {
                Some(guard) => return Ok(guard),
                None => {
                    if Instant::now() >= give_up {
                        return Err(AppError::LockTimeout(format!(
                            "store lock {} still held after {deadline:?}",
                            self.lock_path.display()
                        )));
                    }
                    let delay = backoff.min(BACKOFF_MAX) + Duration::from_millis(clock_jitter());
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    /// One acquisition attempt; `None` means the lock is held and live.
    async fn try_acquire(&self) -> Result<Option<LockGuard>> {
        if let Some(parent) = self.lock_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| AppError::Io(format!("create store directory: {err}")))?;
        }

        let info = LockInfo::new(&self.holder_id, self.stale_ttl);
        let body = serde_json::to_vec(&info)
            .map_err(|err| AppError::Store(format!("serialize lock info: {err}")))?;

        // create_new is the atomicity point: exactly one creator wins.
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => {
                write_lock_body(file, &body).await?;
                debug!(lock = %self.lock_path.display(), holder = %self.holder_id, "store lock acquired");
                Ok(Some(LockGuard {
                    lock_path: self.lock_path.clone(),
                    holder_id: self.holder_id.clone(),
                    released: false,
                }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                self.reap_if_stale().await?;
                Ok(None)
            }
            Err(err) => Err(AppError::Io(format!(
                "create lock {}: {err}",
                self.lock_path.display()
            ))),
        }
    }

    /// Remove the lock file when its recorded expiry has passed.
    ///
    /// An unreadable or unparseable lock file is treated as stale too: it can
    /// only result from a holder that died mid-write.
    async fn reap_if_stale(&self) -> Result<()> {
        let stale = match tokio::fs::read(&self.lock_path).await {
            Ok(bytes) => serde_json::from_slice::<LockInfo>(&bytes)
                .map_or(true, |info| info.is_stale()),
            // Racing holder released between our create_new and this read.
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(_) => true,
        };

        if stale {
            warn!(lock = %self.lock_path.display(), "removing stale store lock");
            match tokio::fs::remove_file(&self.lock_path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(AppError::Io(format!(
                        "remove stale lock {}: {err}",
                        self.lock_path.display()
                    )))
                }
            }
        }
        Ok(())
    }
}

async fn write_lock_body(mut file: tokio::fs::File, body: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    file.write_all(body)
        .await
        .map_err(|err| AppError::Io(format!("write lock body: {err}")))?;
    file.flush()
        .await
        .map_err(|err| AppError::Io(format!("flush lock body: {err}")))
}

/// Held lock; releases the lock file when dropped or via [`release`].
///
/// [`release`]: LockGuard::release
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    holder_id: String,
    released: bool,
}

impl LockGuard {
    /// The holder id this guard was acquired under.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Explicitly release the lock, surfacing removal errors.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the lock file exists but cannot be removed.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match tokio::fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Io(format!(
                "release lock {}: {err}",
                self.lock_path.display()
            ))),
        }
    }
}

impl Drop for LockGuard {
    /// Best-effort release on drop; the TTL covers the cases this cannot.
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

/// Cheap sub-10ms jitter derived from the clock, avoiding a rand dependency.
fn clock_jitter() -> u64 {
    use std::time::SystemTime;
    let seed = u64::from(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 10
}
