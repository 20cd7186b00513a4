//! Event hub: per-run ordering authority and broadcast fan-out.
//!
//! Producers hand the hub a [`RawEvent`]; the hub stamps `event_id`,
//! `timestamp`, and the per-run `seq` (monotonic from 1, gapless), buffers
//! the envelope in a bounded per-run history for replay, and broadcasts it.
//! Delivery is non-blocking per subscriber: a receiver that falls behind its
//! buffer observes a lag error from the broadcast channel, is cut off, and
//! must re-subscribe with replay.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::event::{EventEnvelope, EventKind, RawEvent};
use crate::Result;

/// Per-run ordering state and replay buffer.
struct RunLog {
    next_seq: u64,
    history: VecDeque<EventEnvelope>,
}

impl RunLog {
    fn new() -> Self {
        Self {
            next_seq: 1,
            history: VecDeque::new(),
        }
    }
}

/// Registry state behind one synchronization boundary.
struct HubState {
    runs: HashMap<String, RunLog>,
    /// Runs per session, in first-seen order, for history replay.
    session_runs: HashMap<String, Vec<String>>,
    /// Runs with a `started` event and no terminal event yet.
    active_runs: HashMap<String, String>,
}

/// Shared event hub; cheap to clone behind an `Arc` by callers.
pub struct EventHub {
    state: Mutex<HubState>,
    tx: broadcast::Sender<EventEnvelope>,
    history_capacity: usize,
}

impl EventHub {
    /// Create a hub with the given per-run history and broadcast capacities.
    #[must_use]
    pub fn new(history_capacity: usize, broadcast_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            state: Mutex::new(HubState {
                runs: HashMap::new(),
                session_runs: HashMap::new(),
                active_runs: HashMap::new(),
            }),
            tx,
            history_capacity: history_capacity.max(1),
        }
    }

    /// Trusted in-process publish: stamp ordering metadata and broadcast.
    ///
    /// Returns the envelope as subscribers will observe it.
    pub fn publish(&self, raw: RawEvent) -> EventEnvelope {
        let envelope = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

            let run = state
                .runs
                .entry(raw.run_id.clone())
                .or_insert_with(RunLog::new);
            let seq = run.next_seq;
            run.next_seq += 1;

            let envelope = EventEnvelope {
                event_id: Uuid::new_v4().to_string(),
                timestamp: Utc::now(),
                session_id: raw.session_id.clone(),
                run_id: raw.run_id.clone(),
                seq,
                kind: raw.kind,
            };

            run.history.push_back(envelope.clone());
            while run.history.len() > self.history_capacity {
                run.history.pop_front();
            }

            if seq == 1 {
                state
                    .session_runs
                    .entry(raw.session_id.clone())
                    .or_default()
                    .push(raw.run_id.clone());
            }

            // Heartbeat bookkeeping: a run is active from its `started`
            // event until its terminal event.
            match envelope.kind {
                EventKind::Started { .. } => {
                    state
                        .active_runs
                        .insert(raw.run_id.clone(), raw.session_id.clone());
                }
                ref kind if kind.is_terminal() => {
                    state.active_runs.remove(&raw.run_id);
                }
                _ => {}
            }

            envelope
        };

        // A send with no receivers is not an error; history remains the
        // replay source for late subscribers.
        let _ = self.tx.send(envelope.clone());
        envelope
    }

    /// Untrusted ingest boundary for network producers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ingest` when the event fails schema validation;
    /// rejected events never reach subscribers.
    pub fn ingest(&self, raw: RawEvent) -> Result<EventEnvelope> {
        raw.validate()?;
        Ok(self.publish(raw))
    }

    /// Subscribe to the live event stream.
    ///
    /// The receiver observes every event published after this call, in
    /// per-run `seq` order, until it lags past the broadcast capacity.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Replay buffered events for `session_id` with `seq > since_seq`.
    ///
    /// Events are returned grouped by run in first-seen order, ordered by
    /// `seq` within each run. Events evicted from the bounded buffer are
    /// gone; pass `since_seq = 0` for everything still buffered.
    #[must_use]
    pub fn history(&self, session_id: &str, since_seq: u64) -> Vec<EventEnvelope> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(run_ids) = state.session_runs.get(session_id) else {
            return Vec::new();
        };

        let mut replay = Vec::new();
        for run_id in run_ids {
            if let Some(run) = state.runs.get(run_id) {
                replay.extend(
                    run.history
                        .iter()
                        .filter(|event| event.seq > since_seq)
                        .cloned(),
                );
            }
        }
        replay
    }

    /// Runs currently considered active (started, not yet terminal).
    #[must_use]
    pub fn active_runs(&self) -> Vec<(String, String)> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .active_runs
            .iter()
            .map(|(run, session)| (run.clone(), session.clone()))
            .collect()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Spawn the heartbeat task: one `heartbeat` event per active run on a
/// fixed interval, so subscribers can tell "alive but idle" from
/// "connection dropped".
///
/// The task runs until the `CancellationToken` fires.
#[must_use]
pub fn spawn_heartbeat(
    hub: std::sync::Arc<EventHub>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("heartbeat task shutting down");
                    break;
                }
                () = tokio::time::sleep(interval) => {}
            }

            for (run_id, session_id) in hub.active_runs() {
                debug!(run_id, session_id, "heartbeat");
                hub.publish(RawEvent::new(session_id, run_id, EventKind::Heartbeat));
            }
        }
    })
}
