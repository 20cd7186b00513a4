//! Per-attempt idle timer.
//!
//! The timer fires after a configurable silence window with no output from
//! the supervised process. Firing marks the session idle — it is a signal,
//! not a failure, and the process is left running so the caller can decide
//! whether to wait, nudge, or stop it. Any subsequent line resets the timer
//! and reports recovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Events emitted by the idle timer toward the attempt driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdleEvent {
    /// No output for the configured window; the process is still alive.
    Idle {
        /// Seconds of silence when the event was generated.
        idle_seconds: u64,
    },
    /// Output resumed after an idle period.
    Recovered,
}

/// Builder for a per-attempt idle timer.
///
/// Call [`spawn`](Self::spawn) to start the background timer task.
pub struct IdleTimer {
    session_id: String,
    window: Duration,
    event_tx: mpsc::Sender<IdleEvent>,
    cancel: CancellationToken,
}

impl IdleTimer {
    /// Construct a new timer (does not start it yet).
    #[must_use]
    pub fn new(
        session_id: String,
        window: Duration,
        event_tx: mpsc::Sender<IdleEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            window,
            event_tx,
            cancel,
        }
    }

    /// Spawn the background timer task and return a handle for resetting it.
    #[must_use]
    pub fn spawn(self) -> IdleTimerHandle {
        let reset_notify = Arc::new(Notify::new());
        let idle = Arc::new(AtomicBool::new(false));
        let cancel_for_handle = self.cancel.clone();

        let task_handle = tokio::spawn(Self::run(
            self.session_id,
            self.window,
            self.event_tx,
            self.cancel,
            Arc::clone(&reset_notify),
            Arc::clone(&idle),
        ));

        IdleTimerHandle {
            reset_notify,
            idle,
            join_handle: Some(task_handle),
            cancel: cancel_for_handle,
        }
    }

    /// Core timer loop.
    async fn run(
        session_id: String,
        window: Duration,
        event_tx: mpsc::Sender<IdleEvent>,
        cancel: CancellationToken,
        reset_notify: Arc<Notify>,
        idle: Arc<AtomicBool>,
    ) {
        loop {
            let fired = tokio::select! {
                () = cancel.cancelled() => {
                    debug!(session_id, "idle timer cancelled");
                    return;
                }
                () = tokio::time::sleep(window) => true,
                () = reset_notify.notified() => false,
            };

            if !fired {
                // Activity before the window elapsed; report recovery if we
                // were idle.
                if idle.swap(false, Ordering::SeqCst) {
                    info!(session_id, "session recovered from idle");
                    let _ = event_tx.send(IdleEvent::Recovered).await;
                }
                continue;
            }

            idle.store(true, Ordering::SeqCst);
            let idle_seconds = window.as_secs();
            info!(session_id, idle_seconds, "session idle");
            let _ = event_tx.send(IdleEvent::Idle { idle_seconds }).await;

            // Stay idle until activity or shutdown; no escalation — the
            // caller owns the wait/nudge/stop decision.
            tokio::select! {
                () = cancel.cancelled() => return,
                () = reset_notify.notified() => {
                    if idle.swap(false, Ordering::SeqCst) {
                        info!(session_id, "session recovered from idle");
                        let _ = event_tx.send(IdleEvent::Recovered).await;
                    }
                }
            }
        }
    }
}

/// Handle returned from [`IdleTimer::spawn`].
pub struct IdleTimerHandle {
    reset_notify: Arc<Notify>,
    idle: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl IdleTimerHandle {
    /// Reset the silence window (call on every received line).
    pub fn reset(&self) {
        self.reset_notify.notify_one();
    }

    /// Whether the timer currently considers the attempt idle.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    /// Stop the timer and wait for the background task to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for IdleTimerHandle {
    /// Cancel the background timer task when the handle is dropped.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
