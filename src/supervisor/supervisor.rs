//! Attempt driver: spawn, stream, stop, retry, resume.
//!
//! One [`Supervisor`] instance is shared by all schedulable work. Each
//! `start`/`resume` call runs an *attempt lineage* on a background task: a
//! sequence of OS-process attempts sharing one session id, ending in exactly
//! one lineage-terminal event (`completed`, or `error` with
//! `will_retry: false`). Every session state transition writes through to
//! the session store and emits the corresponding hub event.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::hub::EventHub;
use crate::models::event::{EventKind, RawEvent, StreamChannel};
use crate::models::session::{SessionPatch, SessionState};
use crate::models::task::TaskSpec;
use crate::store::session_store::SessionStore;
use crate::supervisor::idle::{IdleEvent, IdleTimer};
use crate::supervisor::reader::{run_reader, ReaderEvent};
use crate::supervisor::signal;
use crate::{AppError, Result};

/// Bounded retries for write-through store updates hitting lock contention.
const STORE_RETRIES: u32 = 3;

/// How a lineage ended, as reported to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// Exit code 0.
    Done,
    /// Spawn failure, timeout, or exhausted retries.
    Failed,
    /// Caller-requested stop; never retried.
    Stopped,
}

/// Terminal report for one attempt lineage.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Final session id (the announced id when the process rebound itself).
    pub session_id: String,
    /// Terminal classification.
    pub status: OutcomeStatus,
    /// Exit code of the final attempt, when a process ran and exited.
    pub exit_code: Option<i32>,
    /// Completion or error text.
    pub message: Option<String>,
}

/// Handle to a running attempt lineage.
pub struct SupervisorHandle {
    /// Provisional session id assigned at start (may be rebound later).
    pub session_id: String,
    outcome_rx: oneshot::Receiver<SessionOutcome>,
    _driver: JoinHandle<()>,
}

impl std::fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl SupervisorHandle {
    /// Wait for the lineage to reach its terminal state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Supervise` if the driver task ended without
    /// reporting an outcome (it panicked or was aborted).
    pub async fn wait(self) -> Result<SessionOutcome> {
        self.outcome_rx
            .await
            .map_err(|_| AppError::Supervise("attempt driver ended without an outcome".into()))
    }
}

/// Shared stop flags for one lineage, reachable by id from `soft_stop`.
#[derive(Clone, Default)]
struct StopControl {
    requested: Arc<AtomicBool>,
    force: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

/// Everything one lineage needs, resolved once at start.
struct LineageContext {
    payload: String,
    summary: String,
    project_root: PathBuf,
    max_retries: u32,
    resumed_from: Option<String>,
}

/// Owns the lifecycle of supervised processes.
#[derive(Clone)]
pub struct Supervisor {
    config: Arc<GlobalConfig>,
    store: Arc<SessionStore>,
    hub: Arc<EventHub>,
    active: Arc<Mutex<HashMap<String, StopControl>>>,
}

impl Supervisor {
    /// Create a supervisor writing through to `store` and publishing to `hub`.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>, store: Arc<SessionStore>, hub: Arc<EventHub>) -> Self {
        Self {
            config,
            store,
            hub,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a new attempt lineage for `task`.
    ///
    /// Returns immediately; the lineage runs on a background task and its
    /// terminal state is reported through [`SupervisorHandle::wait`].
    #[must_use]
    pub fn start(&self, task: &TaskSpec) -> SupervisorHandle {
        let ctx = LineageContext {
            payload: task.payload.clone(),
            summary: first_line(&task.payload),
            project_root: task
                .project_root
                .clone()
                .unwrap_or_else(|| self.config.workspace_root.clone()),
            max_retries: task.max_retries,
            resumed_from: None,
        };
        self.launch(Uuid::new_v4().to_string(), ctx)
    }

    /// Start a new attempt against an existing session id.
    ///
    /// The session id is reused for conversational continuity; the attempt
    /// gets a fresh run id and its `started` event carries the previous
    /// session's summary.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` when no session exists under `session_id`.
    pub async fn resume(&self, session_id: &str, new_payload: &str) -> Result<SupervisorHandle> {
        let previous = self.store.read(session_id).await?;
        let ctx = LineageContext {
            payload: new_payload.to_owned(),
            summary: first_line(new_payload),
            project_root: self.config.workspace_root.clone(),
            max_retries: 0,
            resumed_from: Some(previous.task_summary),
        };
        Ok(self.launch(session_id.to_owned(), ctx))
    }

    /// Request a cooperative stop of the lineage owning `session_id`.
    ///
    /// The stop is asynchronous: the caller observes the result through the
    /// lineage's terminal event. A soft-stopped session ends `idle` and is
    /// never retried.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` when no live lineage owns the id.
    pub fn soft_stop(&self, session_id: &str) -> Result<()> {
        let control = self.control_for(session_id)?;
        control.requested.store(true, Ordering::SeqCst);
        control.notify.notify_one();
        info!(session_id, "soft stop requested");
        Ok(())
    }

    /// Kill the lineage owning `session_id` without a grace period.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` when no live lineage owns the id.
    pub fn force_kill(&self, session_id: &str) -> Result<()> {
        let control = self.control_for(session_id)?;
        control.requested.store(true, Ordering::SeqCst);
        control.force.store(true, Ordering::SeqCst);
        control.notify.notify_one();
        info!(session_id, "force kill requested");
        Ok(())
    }

    fn control_for(&self, session_id: &str) -> Result<StopControl> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("no active session {session_id}")))
    }

    /// Register a lineage and spawn its driver task.
    fn launch(&self, session_id: String, ctx: LineageContext) -> SupervisorHandle {
        let stop = StopControl::default();
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), stop.clone());

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let supervisor = self.clone();
        let provisional = session_id.clone();
        let handle_id = session_id.clone();
        let driver = tokio::spawn(async move {
            let outcome = supervisor.run_lineage(session_id, &ctx, &stop).await;

            // Deregister every id the lineage was reachable under.
            {
                let mut active = supervisor
                    .active
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                active.remove(&provisional);
                active.remove(&outcome.session_id);
            }
            let _ = outcome_tx.send(outcome);
        });

        SupervisorHandle {
            session_id: handle_id,
            outcome_rx,
            _driver: driver,
        }
    }

    /// Run one attempt lineage to its terminal state.
    async fn run_lineage(
        &self,
        mut session_id: String,
        ctx: &LineageContext,
        stop: &StopControl,
    ) -> SessionOutcome {
        let total_attempts = ctx.max_retries.saturating_add(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let run_id = Uuid::new_v4().to_string();

            let end = self
                .run_attempt(&mut session_id, &run_id, ctx, attempt, stop)
                .await;

            match end {
                AttemptEnd::SpawnFailed { message } => {
                    // Not retried: respawning an unresolvable executable
                    // wastes the retry budget.
                    self.write_terminal(
                        &session_id,
                        SessionState::Failed,
                        None,
                        None,
                        Some(message.clone()),
                    )
                    .await;
                    self.hub.publish(RawEvent::new(
                        &session_id,
                        &run_id,
                        EventKind::Error {
                            message: message.clone(),
                            will_retry: false,
                        },
                    ));
                    return SessionOutcome {
                        session_id,
                        status: OutcomeStatus::Failed,
                        exit_code: None,
                        message: Some(message),
                    };
                }

                AttemptEnd::Completed { exit_code, elapsed } => {
                    self.write_terminal(
                        &session_id,
                        SessionState::Done,
                        Some(exit_code),
                        Some(elapsed),
                        Some("completed".into()),
                    )
                    .await;
                    self.hub.publish(RawEvent::new(
                        &session_id,
                        &run_id,
                        EventKind::Completed {
                            exit_code,
                            elapsed_seconds: elapsed,
                            message: None,
                        },
                    ));
                    return SessionOutcome {
                        session_id,
                        status: OutcomeStatus::Done,
                        exit_code: Some(exit_code),
                        message: None,
                    };
                }

                AttemptEnd::Stopped { exit_code, elapsed } => {
                    let message = "stopped by request".to_owned();
                    self.write_terminal(
                        &session_id,
                        SessionState::Idle,
                        exit_code,
                        Some(elapsed),
                        Some(message.clone()),
                    )
                    .await;
                    self.hub.publish(RawEvent::new(
                        &session_id,
                        &run_id,
                        EventKind::Completed {
                            exit_code: exit_code.unwrap_or_default(),
                            elapsed_seconds: elapsed,
                            message: Some(message.clone()),
                        },
                    ));
                    return SessionOutcome {
                        session_id,
                        status: OutcomeStatus::Stopped,
                        exit_code,
                        message: Some(message),
                    };
                }

                AttemptEnd::TimedOut { elapsed } => {
                    // Distinct from a crash: "took too long", not "broke".
                    let message = format!(
                        "wall-clock timeout after {}s",
                        self.config.supervisor.timeout_seconds
                    );
                    self.write_terminal(
                        &session_id,
                        SessionState::Failed,
                        None,
                        Some(elapsed),
                        Some(message.clone()),
                    )
                    .await;
                    self.hub.publish(RawEvent::new(
                        &session_id,
                        &run_id,
                        EventKind::Error {
                            message: message.clone(),
                            will_retry: false,
                        },
                    ));
                    return SessionOutcome {
                        session_id,
                        status: OutcomeStatus::Failed,
                        exit_code: None,
                        message: Some(message),
                    };
                }

                AttemptEnd::Crashed { exit_code, elapsed } => {
                    let describe = exit_code.map_or_else(
                        || "terminated by signal".to_owned(),
                        |c| format!("exited with code {c}"),
                    );

                    if attempt < total_attempts {
                        let message =
                            format!("{describe} (attempt {attempt} of {total_attempts})");
                        warn!(session_id, run_id, %message, "attempt crashed; retrying");
                        self.hub.publish(RawEvent::new(
                            &session_id,
                            &run_id,
                            EventKind::Error {
                                message,
                                will_retry: true,
                            },
                        ));
                        self.upsert_logged(
                            &session_id,
                            SessionPatch {
                                state: Some(SessionState::Idle),
                                pid: Some(None),
                                exit_code: Some(exit_code),
                                elapsed_seconds: Some(Some(elapsed)),
                                message: Some(Some(format!("retrying after {describe}"))),
                                ..SessionPatch::default()
                            },
                        )
                        .await;

                        let delay = self.config.supervisor.backoff.delay_for_attempt(attempt);
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = stop.notify.notified() => {
                                // Stop requested during backoff: end the
                                // lineage without another attempt.
                                let message = "stopped by request".to_owned();
                                self.write_terminal(
                                    &session_id,
                                    SessionState::Idle,
                                    exit_code,
                                    Some(elapsed),
                                    Some(message.clone()),
                                )
                                .await;
                                return SessionOutcome {
                                    session_id,
                                    status: OutcomeStatus::Stopped,
                                    exit_code,
                                    message: Some(message),
                                };
                            }
                        }
                        continue;
                    }

                    let message = format!("{describe}; retries exhausted");
                    self.write_terminal(
                        &session_id,
                        SessionState::Failed,
                        exit_code,
                        Some(elapsed),
                        Some(message.clone()),
                    )
                    .await;
                    self.hub.publish(RawEvent::new(
                        &session_id,
                        &run_id,
                        EventKind::Error {
                            message: message.clone(),
                            will_retry: false,
                        },
                    ));
                    return SessionOutcome {
                        session_id,
                        status: OutcomeStatus::Failed,
                        exit_code,
                        message: Some(message),
                    };
                }
            }
        }
    }

    /// Run a single OS-process attempt.
    #[allow(clippy::too_many_lines)]
    async fn run_attempt(
        &self,
        session_id: &mut String,
        run_id: &str,
        ctx: &LineageContext,
        attempt: u32,
        stop: &StopControl,
    ) -> AttemptEnd {
        let mut child = match self.spawn_process(session_id, run_id, ctx) {
            Ok(child) => child,
            Err(err) => {
                return AttemptEnd::SpawnFailed {
                    message: err.to_string(),
                }
            }
        };
        let pid = child.id();
        let started_at = Instant::now();

        info!(
            session_id = session_id.as_str(),
            run_id,
            pid = pid.unwrap_or(0),
            attempt,
            "agent process spawned"
        );

        // Session record: created on first spawn, refreshed on every attempt.
        self.upsert_logged(
            session_id,
            SessionPatch {
                state: Some(SessionState::Running),
                task_summary: Some(ctx.summary.clone()),
                pid: Some(pid),
                message: Some(None),
                exit_code: Some(None),
                elapsed_seconds: Some(None),
            },
        )
        .await;

        self.hub.publish(RawEvent::new(
            session_id.as_str(),
            run_id,
            EventKind::Started {
                task_summary: ctx.summary.clone(),
                resumed_from: if attempt == 1 {
                    ctx.resumed_from.clone()
                } else {
                    None
                },
            },
        ));

        // Deliver the payload, then close stdin so the agent sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(ctx.payload.as_bytes()).await {
                warn!(session_id = session_id.as_str(), %err, "failed to write payload to stdin");
            }
            let _ = stdin.shutdown().await;
        }

        // Reader tasks for both streams plus the idle timer.
        let attempt_cancel = tokio_util::sync::CancellationToken::new();
        let (reader_tx, mut reader_rx) = mpsc::channel::<ReaderEvent>(256);
        let mut open_streams = 0_u8;

        if let Some(stdout) = child.stdout.take() {
            open_streams += 1;
            tokio::spawn(run_reader(
                StreamChannel::Primary,
                stdout,
                reader_tx.clone(),
                attempt_cancel.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            open_streams += 1;
            tokio::spawn(run_reader(
                StreamChannel::Diagnostic,
                stderr,
                reader_tx.clone(),
                attempt_cancel.clone(),
            ));
        }
        drop(reader_tx);

        let (idle_tx, mut idle_rx) = mpsc::channel::<IdleEvent>(8);
        let idle_handle = IdleTimer::new(
            session_id.clone(),
            self.config.idle_window(),
            idle_tx,
            attempt_cancel.child_token(),
        )
        .spawn();

        let deadline = tokio::time::sleep(self.config.attempt_timeout());
        tokio::pin!(deadline);

        let grace = self.config.stop_grace();
        let mut timed_out = false;
        let mut readers_done = false;
        let mut idle_done = false;
        let exit_status;

        loop {
            tokio::select! {
                status = child.wait() => {
                    exit_status = status.ok();
                    break;
                }

                () = &mut deadline => {
                    timed_out = true;
                    warn!(session_id = session_id.as_str(), run_id, "attempt hit wall-clock ceiling");
                    exit_status = stop_child(&mut child, grace, false).await;
                    break;
                }

                () = stop.notify.notified() => {
                    let force = stop.force.load(Ordering::SeqCst);
                    exit_status = stop_child(&mut child, grace, force).await;
                    break;
                }

                event = reader_rx.recv(), if !readers_done => {
                    match event {
                        Some(ReaderEvent::Line { channel, line }) => {
                            idle_handle.reset();
                            self.hub.publish(RawEvent::new(
                                session_id.as_str(),
                                run_id,
                                EventKind::Stream { line, channel },
                            ));
                        }
                        Some(ReaderEvent::SessionAnnounced { session_id: announced }) => {
                            idle_handle.reset();
                            self.adopt_announced_id(session_id, &announced).await;
                        }
                        Some(ReaderEvent::Closed { .. }) => {
                            open_streams = open_streams.saturating_sub(1);
                        }
                        None => {
                            // Both readers gone; keep waiting for exit.
                            readers_done = true;
                        }
                    }
                }

                event = idle_rx.recv(), if !idle_done => {
                    match event {
                        Some(IdleEvent::Idle { .. }) => {
                            // Not a failure; the process stays alive and
                            // `pid` stays set while it does.
                            self.upsert_logged(
                                session_id,
                                SessionPatch::state(SessionState::Idle),
                            )
                            .await;
                        }
                        Some(IdleEvent::Recovered) => {
                            self.upsert_logged(
                                session_id,
                                SessionPatch::state(SessionState::Running),
                            )
                            .await;
                        }
                        None => {
                            idle_done = true;
                        }
                    }
                }
            }
        }

        // Flush lines that were in flight when the process exited.
        if open_streams > 0 {
            self.drain_readers(session_id, run_id, &mut reader_rx).await;
        }
        idle_handle.shutdown().await;
        attempt_cancel.cancel();

        let elapsed = started_at.elapsed().as_secs_f64();
        let exit_code = exit_status.and_then(|s| s.code());

        if timed_out {
            AttemptEnd::TimedOut { elapsed }
        } else if stop.requested.load(Ordering::SeqCst) {
            AttemptEnd::Stopped { exit_code, elapsed }
        } else if exit_code == Some(0) {
            AttemptEnd::Completed {
                exit_code: 0,
                elapsed,
            }
        } else {
            AttemptEnd::Crashed { exit_code, elapsed }
        }
    }

    /// Build and spawn the agent command for one attempt.
    fn spawn_process(
        &self,
        session_id: &str,
        run_id: &str,
        ctx: &LineageContext,
    ) -> Result<Child> {
        let mut cmd = Command::new(&self.config.agent_cli);
        cmd.args(&self.config.agent_cli_args)
            .env("FOREMAN_SESSION_ID", session_id)
            .env("FOREMAN_RUN_ID", run_id)
            .current_dir(&ctx.project_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.config.env_overrides {
            cmd.env(key, value);
        }

        cmd.spawn().map_err(|err| {
            AppError::Spawn(format!(
                "failed to spawn {}: {err}",
                self.config.agent_cli
            ))
        })
    }

    /// Rebind the lineage to the id the process announced for itself.
    async fn adopt_announced_id(&self, session_id: &mut String, announced: &str) {
        if announced == session_id.as_str() {
            return;
        }

        match self.store.rebind(session_id, announced).await {
            Ok(_) => {
                // Keep the lineage reachable under both ids for stop calls.
                let control = {
                    let active = self
                        .active
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    active.get(session_id.as_str()).cloned()
                };
                if let Some(control) = control {
                    self.active
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(announced.to_owned(), control);
                }
                info!(
                    provisional = session_id.as_str(),
                    announced, "session rebound to announced id"
                );
                *session_id = announced.to_owned();
            }
            Err(err) => {
                warn!(
                    session_id = session_id.as_str(),
                    announced,
                    %err,
                    "failed to rebind session to announced id"
                );
            }
        }
    }

    /// Forward lines still buffered after process exit, bounded in time.
    async fn drain_readers(
        &self,
        session_id: &str,
        run_id: &str,
        reader_rx: &mut mpsc::Receiver<ReaderEvent>,
    ) {
        let drain_deadline = Duration::from_millis(500);
        loop {
            match tokio::time::timeout(drain_deadline, reader_rx.recv()).await {
                Ok(Some(ReaderEvent::Line { channel, line })) => {
                    self.hub.publish(RawEvent::new(
                        session_id,
                        run_id,
                        EventKind::Stream { line, channel },
                    ));
                }
                Ok(Some(ReaderEvent::SessionAnnounced { .. } | ReaderEvent::Closed { .. })) => {}
                Ok(None) | Err(_) => break,
            }
        }
    }

    /// Terminal write-through: state, pid cleared, bookkeeping fields set.
    async fn write_terminal(
        &self,
        session_id: &str,
        state: SessionState,
        exit_code: Option<i32>,
        elapsed: Option<f64>,
        message: Option<String>,
    ) {
        self.upsert_logged(
            session_id,
            SessionPatch {
                state: Some(state),
                pid: Some(None),
                exit_code: Some(exit_code),
                elapsed_seconds: Some(elapsed),
                message: Some(message),
                ..SessionPatch::default()
            },
        )
        .await;
    }

    /// Upsert with bounded retries on lock contention; failures are logged,
    /// never allowed to take down the attempt.
    async fn upsert_logged(&self, session_id: &str, patch: SessionPatch) {
        for attempt in 1..=STORE_RETRIES {
            match self.store.upsert(session_id, patch.clone()).await {
                Ok(_) => return,
                Err(err) if err.is_retryable() && attempt < STORE_RETRIES => {
                    warn!(session_id, %err, attempt, "store contended; retrying write");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
                Err(err) => {
                    warn!(session_id, %err, "session store write failed");
                    return;
                }
            }
        }
    }
}

/// One attempt's end state, before lineage-level classification.
#[derive(Debug)]
enum AttemptEnd {
    Completed { exit_code: i32, elapsed: f64 },
    Crashed { exit_code: Option<i32>, elapsed: f64 },
    Stopped { exit_code: Option<i32>, elapsed: f64 },
    TimedOut { elapsed: f64 },
    SpawnFailed { message: String },
}

/// Cooperative stop, escalating to a hard kill after `grace`.
async fn stop_child(
    child: &mut Child,
    grace: Duration,
    force: bool,
) -> Option<std::process::ExitStatus> {
    if !force {
        match signal::soft_interrupt(child) {
            Ok(true) => {
                if let Ok(Ok(status)) = tokio::time::timeout(grace, child.wait()).await {
                    return Some(status);
                }
                warn!("child ignored interrupt; escalating to kill");
            }
            Ok(false) => {
                // No cooperative interrupt on this platform.
            }
            Err(err) => {
                warn!(%err, "interrupt delivery failed; escalating to kill");
            }
        }
    }

    if let Err(err) = signal::force_kill(child).await {
        warn!(%err, "force kill failed");
    }
    child.wait().await.ok()
}

/// First line of the payload, used as the session's task summary.
fn first_line(payload: &str) -> String {
    payload.lines().next().unwrap_or_default().to_owned()
}
