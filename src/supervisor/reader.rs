//! Stream reader tasks for supervised processes.
//!
//! One reader per child stream (stdout = primary, stderr = diagnostic)
//! drives a [`FramedRead`] over the lossy line codec and forwards each
//! decoded line through a tokio [`mpsc`] channel.
//!
//! Line classification is deliberately minimal: a JSON line of the form
//! `{"type":"session_started","session_id":"..."}` rebinds the attempt's
//! session association; every other line — JSON or not — is forwarded
//! verbatim for the hub to wrap into a `stream` event.

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::event::StreamChannel;
use crate::supervisor::codec::StreamLineCodec;
use crate::AppError;

/// Events emitted by a reader task toward the attempt driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// The process announced its own session/thread identifier.
    SessionAnnounced {
        /// Identifier carried by the marker line.
        session_id: String,
    },
    /// One decoded output line, forwarded verbatim.
    Line {
        /// Originating child stream.
        channel: StreamChannel,
        /// Decoded content.
        line: String,
    },
    /// The stream reached EOF or an unrecoverable I/O error.
    Closed {
        /// Which stream closed.
        channel: StreamChannel,
    },
}

/// Structured marker emitted by the supervised program on startup.
#[derive(Debug, Deserialize)]
struct SessionMarker {
    #[serde(rename = "type")]
    kind: String,
    session_id: Option<String>,
    thread_id: Option<String>,
}

/// Classify one decoded line.
///
/// Returns the announced session id when the line is a recognized
/// `session_started` marker, `None` for everything else.
#[must_use]
pub fn parse_session_marker(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let marker: SessionMarker = serde_json::from_str(trimmed).ok()?;
    if marker.kind != "session_started" {
        return None;
    }
    marker
        .session_id
        .or(marker.thread_id)
        .filter(|id| !id.is_empty())
}

/// Reader task — frames `stream` into lines and emits [`ReaderEvent`]s.
///
/// Malformed or oversized lines are logged and skipped; they never
/// terminate the reader. On EOF or I/O error a final
/// [`ReaderEvent::Closed`] is sent.
///
/// # Cancellation
///
/// Respects `cancel`: when the token fires the reader exits without
/// emitting `Closed` (the driver is shutting the attempt down itself).
pub async fn run_reader<R>(
    channel: StreamChannel,
    stream: R,
    event_tx: mpsc::Sender<ReaderEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stream, StreamLineCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(?channel, "reader: cancellation received, stopping");
                return;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(?channel, "reader: EOF");
                        let _ = event_tx.send(ReaderEvent::Closed { channel }).await;
                        return;
                    }

                    Some(Err(AppError::Supervise(ref msg))) => {
                        // Oversized line; framing already resynchronized.
                        warn!(?channel, error = msg.as_str(), "reader: skipping oversized line");
                    }

                    Some(Err(err)) => {
                        warn!(?channel, %err, "reader: stream error, stopping");
                        let _ = event_tx.send(ReaderEvent::Closed { channel }).await;
                        return;
                    }

                    Some(Ok(line)) => {
                        let event = parse_session_marker(&line).map_or(
                            ReaderEvent::Line { channel, line },
                            |session_id| ReaderEvent::SessionAnnounced { session_id },
                        );
                        if event_tx.send(event).await.is_err() {
                            debug!(?channel, "reader: event channel closed, stopping");
                            return;
                        }
                    }
                }
            }
        }
    }
}
