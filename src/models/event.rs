//! Event envelope and wire shapes for the hub.
//!
//! Producers (in-process supervisors or remote processes posting to the HTTP
//! ingest endpoint) submit a [`RawEvent`]. The hub alone assigns `event_id`,
//! `timestamp`, and the per-run `seq`, producing the [`EventEnvelope`] that
//! subscribers observe. Payload shapes are a tagged union so consumers
//! pattern-match exhaustively instead of poking at untyped maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Which child stream a `stream` event line was read from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamChannel {
    /// Child stdout.
    Primary,
    /// Child stderr.
    Diagnostic,
}

/// Typed payload variants, discriminated by the wire `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A new attempt began.
    Started {
        /// Truncated description of the work.
        task_summary: String,
        /// Summary of the prior attempt when resuming an existing session.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resumed_from: Option<String>,
    },
    /// One verbatim output line from the supervised process.
    Stream {
        /// Decoded line content.
        line: String,
        /// Originating child stream.
        channel: StreamChannel,
    },
    /// Attempt lineage finished successfully.
    Completed {
        /// Process exit code.
        exit_code: i32,
        /// Attempt wall-clock duration.
        elapsed_seconds: f64,
        /// Human-readable completion note.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Attempt failed; terminal for the lineage unless `will_retry`.
    Error {
        /// What went wrong.
        message: String,
        /// Whether the supervisor will spawn another attempt.
        #[serde(default)]
        will_retry: bool,
    },
    /// Periodic liveness signal for an active run.
    Heartbeat,
}

impl EventKind {
    /// Wire name of the `type` discriminant (also the SSE event name).
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Stream { .. } => "stream",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Whether this kind ends an attempt (completed or error).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }
}

/// Producer-side event, before the hub stamps ordering metadata.
///
/// Any `seq` or `event_id` a producer includes in its JSON is ignored: the
/// hub is the sole ordering authority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RawEvent {
    /// Session lineage the event belongs to.
    pub session_id: String,
    /// Attempt the event belongs to; the `seq` ordering scope.
    pub run_id: String,
    /// Typed payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

impl RawEvent {
    /// Construct a producer event.
    #[must_use]
    pub fn new(session_id: impl Into<String>, run_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            session_id: session_id.into(),
            run_id: run_id.into(),
            kind,
        }
    }

    /// Boundary validation applied to untrusted (network) producers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ingest` when `session_id` or `run_id` is empty.
    pub fn validate(&self) -> Result<()> {
        if self.session_id.trim().is_empty() {
            return Err(AppError::Ingest("session_id must not be empty".into()));
        }
        if self.run_id.trim().is_empty() {
            return Err(AppError::Ingest("run_id must not be empty".into()));
        }
        Ok(())
    }
}

/// The unit broadcast by the hub and replayed from history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct EventEnvelope {
    /// Unique id for subscriber-side de-duplication.
    pub event_id: String,
    /// Hub-side ingest timestamp.
    pub timestamp: DateTime<Utc>,
    /// Session lineage.
    pub session_id: String,
    /// Attempt; the `seq` ordering scope.
    pub run_id: String,
    /// Strictly increasing, gapless position within `run_id`, from 1.
    pub seq: u64,
    /// Typed payload.
    #[serde(flatten)]
    pub kind: EventKind,
}
