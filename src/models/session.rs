//! Session model and merge-update helpers.
//!
//! A session is the durable identity of one conversation lineage. It may span
//! several process attempts (retries, resumes); the session store owns every
//! mutation and callers describe changes as a [`SessionPatch`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state for a supervised session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// A process attempt is alive and producing output.
    Running,
    /// A process attempt is alive but silent past the idle window, or was
    /// soft-stopped at the caller's request.
    Idle,
    /// Lineage ended with exit code 0.
    Done,
    /// Lineage ended in spawn failure, timeout, or exhausted retries.
    Failed,
}

/// Truncation ceiling for `task_summary`.
const SUMMARY_MAX_CHARS: usize = 240;

/// Session record persisted in the store's backing document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Stable identifier across retries and resumes of one lineage.
    pub session_id: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Truncated free-text description of the work.
    pub task_summary: String,
    /// Completion or error text; `None` while in flight.
    pub message: Option<String>,
    /// Exit code of the most recent finished attempt.
    pub exit_code: Option<i32>,
    /// Wall-clock duration of the most recent finished attempt.
    pub elapsed_seconds: Option<f64>,
    /// OS process id; present only while a process is actually alive.
    pub pid: Option<u32>,
    /// First-spawn timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp; refreshed on every upsert.
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Construct a fresh running session for a newly spawned attempt.
    #[must_use]
    pub fn started(session_id: String, task_summary: &str, pid: Option<u32>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            state: SessionState::Running,
            task_summary: truncate_summary(task_summary),
            message: None,
            exit_code: None,
            elapsed_seconds: None,
            pid,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the pid/state invariant holds: `pid` is set iff `running`.
    #[must_use]
    pub fn pid_state_consistent(&self) -> bool {
        match self.state {
            // An idle session still has a live process unless it was stopped,
            // so both forms are permitted.
            SessionState::Idle => true,
            SessionState::Running => self.pid.is_some(),
            SessionState::Done | SessionState::Failed => self.pid.is_none(),
        }
    }
}

/// Partial update merged into a session by [`SessionStore::upsert`].
///
/// `None` leaves the existing value untouched; the double-`Option` fields
/// distinguish "leave as is" from "clear to null".
///
/// [`SessionStore::upsert`]: crate::store::session_store::SessionStore::upsert
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    /// New lifecycle state.
    pub state: Option<SessionState>,
    /// New task summary (will be truncated).
    pub task_summary: Option<String>,
    /// Completion/error text; `Some(None)` clears it.
    pub message: Option<Option<String>>,
    /// Exit code; `Some(None)` clears it.
    pub exit_code: Option<Option<i32>>,
    /// Elapsed wall-clock seconds; `Some(None)` clears it.
    pub elapsed_seconds: Option<Option<f64>>,
    /// Process id; `Some(None)` clears it.
    pub pid: Option<Option<u32>>,
}

impl SessionPatch {
    /// Patch that only transitions the lifecycle state.
    #[must_use]
    pub fn state(state: SessionState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Apply this patch on top of an existing session, refreshing `updated_at`.
    #[must_use]
    pub fn apply_to(&self, mut session: Session) -> Session {
        if let Some(state) = self.state {
            session.state = state;
        }
        if let Some(ref summary) = self.task_summary {
            session.task_summary = truncate_summary(summary);
        }
        if let Some(ref message) = self.message {
            session.message.clone_from(message);
        }
        if let Some(exit_code) = self.exit_code {
            session.exit_code = exit_code;
        }
        if let Some(elapsed) = self.elapsed_seconds {
            session.elapsed_seconds = elapsed;
        }
        if let Some(pid) = self.pid {
            session.pid = pid;
        }
        session.updated_at = Utc::now();
        session
    }

    /// Materialize a brand-new session from this patch alone.
    ///
    /// Used when an upsert targets a session id with no existing record
    /// (e.g., a spawn failure recorded before any process ran).
    #[must_use]
    pub fn into_new_session(self, session_id: &str) -> Session {
        let base = Session::started(session_id.to_owned(), "", None);
        self.apply_to(base)
    }
}

/// Truncate a summary to [`SUMMARY_MAX_CHARS`] characters.
fn truncate_summary(summary: &str) -> String {
    if summary.chars().count() <= SUMMARY_MAX_CHARS {
        summary.to_owned()
    } else {
        let mut truncated: String = summary.chars().take(SUMMARY_MAX_CHARS).collect();
        truncated.push('…');
        truncated
    }
}
