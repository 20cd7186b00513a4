//! Wave-ordered task scheduling over the admission controller.
//!
//! The scheduler releases all tasks of wave *N* whose dependencies are
//! satisfied; wave *N+1* tasks are not even offered to the admission
//! controller until every wave-*N* task has reached a terminal state. A
//! task therefore never starts before all of its dependencies have
//! materially finished.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::WavePolicy;
use crate::models::task::{TaskGraph, TaskSpec, TaskStatus};
use crate::scheduler::admission::{AdmissionController, CategoryStatus};
use crate::supervisor::{OutcomeStatus, Supervisor};
use crate::{AppError, Result};

/// Final report for one scheduled run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Last observed status per task id.
    pub statuses: HashMap<String, TaskStatus>,
    /// Failed task ids — the caller-visible "needs rework" signal.
    pub needs_rework: Vec<String>,
}

impl RunReport {
    fn from_statuses(statuses: HashMap<String, TaskStatus>) -> Self {
        let mut needs_rework: Vec<String> = statuses
            .iter()
            .filter(|(_, status)| **status == TaskStatus::Failed)
            .map(|(id, _)| id.clone())
            .collect();
        needs_rework.sort();
        Self {
            statuses,
            needs_rework,
        }
    }

    /// Whether every task ended `done`.
    #[must_use]
    pub fn all_done(&self) -> bool {
        self.statuses
            .values()
            .all(|status| *status == TaskStatus::Done)
    }
}

/// Shared mutable scheduling state, one synchronization boundary per map.
struct SchedulerState {
    statuses: Mutex<HashMap<String, TaskStatus>>,
    cancelled: Mutex<HashSet<String>>,
    /// task id → provisional session id, while the task is running.
    sessions: Mutex<HashMap<String, String>>,
}

/// Consumes a validated task graph and drives it to completion.
pub struct TaskScheduler {
    graph: TaskGraph,
    admission: Arc<AdmissionController>,
    supervisor: Supervisor,
    policy: WavePolicy,
    state: Arc<SchedulerState>,
}

impl TaskScheduler {
    /// Create a scheduler for `graph`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Graph` when the graph fails validation; a graph
    /// is accepted wholesale or not at all.
    pub fn new(
        graph: TaskGraph,
        admission: Arc<AdmissionController>,
        supervisor: Supervisor,
        policy: WavePolicy,
    ) -> Result<Self> {
        graph.validate()?;
        let statuses = graph
            .tasks
            .iter()
            .map(|task| (task.id.clone(), TaskStatus::Pending))
            .collect();
        Ok(Self {
            graph,
            admission,
            supervisor,
            policy,
            state: Arc::new(SchedulerState {
                statuses: Mutex::new(statuses),
                cancelled: Mutex::new(HashSet::new()),
                sessions: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Drive every wave to a terminal state and report the outcome.
    ///
    /// Waves run strictly in order; a wave with a failed task halts the run
    /// under [`WavePolicy::Halt`] and lets later waves proceed under
    /// [`WavePolicy::Continue`].
    pub async fn run(&self, cancel: CancellationToken) -> RunReport {
        for wave in self.graph.waves() {
            if cancel.is_cancelled() {
                info!(wave, "run cancelled before wave release");
                break;
            }

            info!(wave, "releasing wave");
            let mut drivers = JoinSet::new();
            for task in self.graph.tasks_in_wave(wave) {
                let task = task.clone();
                let admission = Arc::clone(&self.admission);
                let supervisor = self.supervisor.clone();
                let state = Arc::clone(&self.state);
                drivers.spawn(async move {
                    drive_task(&task, &admission, &supervisor, &state).await;
                });
            }

            // Wave barrier: nothing from a later wave is offered to the
            // admission controller until this resolves.
            while drivers.join_next().await.is_some() {}

            let wave_failed = {
                let statuses = self
                    .state
                    .statuses
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                self.graph
                    .tasks_in_wave(wave)
                    .iter()
                    .any(|task| statuses.get(&task.id) == Some(&TaskStatus::Failed))
            };

            if wave_failed && self.policy == WavePolicy::Halt {
                warn!(wave, "wave contains failed tasks; halting run");
                break;
            }
        }

        let statuses = self
            .state
            .statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        RunReport::from_statuses(statuses)
    }

    /// Cancel one task.
    ///
    /// A still-queued task is removed from its FIFO queue synchronously,
    /// without ever involving the process supervisor. A running task is
    /// soft-stopped; its terminal event notifies the caller.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` when the id names no task in the graph.
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        if self.graph.get(task_id).is_none() {
            return Err(AppError::NotFound(format!("task {task_id} not found")));
        }

        self.state
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.to_owned());

        if self.admission.cancel_queued(task_id) {
            set_status(&self.state, task_id, TaskStatus::Cancelled);
            info!(task_id, "cancelled queued task");
            return Ok(());
        }

        let session_id = self
            .state
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned();
        if let Some(session_id) = session_id {
            info!(task_id, session_id, "cancelling running task via soft stop");
            self.supervisor.soft_stop(&session_id)?;
        }
        Ok(())
    }

    /// Snapshot of every task's status.
    #[must_use]
    pub fn statuses(&self) -> HashMap<String, TaskStatus> {
        self.state
            .statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Per-category admission counters.
    #[must_use]
    pub fn admission_status(&self) -> Vec<CategoryStatus> {
        self.admission.status()
    }
}

/// Set one task's status.
fn set_status(state: &SchedulerState, task_id: &str, status: TaskStatus) {
    state
        .statuses
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(task_id.to_owned(), status);
}

fn is_cancelled(state: &SchedulerState, task_id: &str) -> bool {
    state
        .cancelled
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(task_id)
}

/// Drive one task from release to terminal status.
async fn drive_task(
    task: &TaskSpec,
    admission: &Arc<AdmissionController>,
    supervisor: &Supervisor,
    state: &Arc<SchedulerState>,
) {
    if is_cancelled(state, &task.id) {
        set_status(state, &task.id, TaskStatus::Cancelled);
        return;
    }

    // Dependencies live in strictly lower waves, so they are terminal by
    // now; anything short of `done` fails the dependent without a spawn.
    let unmet = {
        let statuses = state
            .statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        task.dependencies
            .iter()
            .find(|dep| statuses.get(dep.as_str()) != Some(&TaskStatus::Done))
            .cloned()
    };
    if let Some(dep) = unmet {
        warn!(task_id = task.id, dependency = dep, "dependency not satisfied; failing task");
        set_status(state, &task.id, TaskStatus::Failed);
        return;
    }

    set_status(state, &task.id, TaskStatus::Queued);
    let permit = match admission.acquire(task.category, &task.id, None).await {
        Ok(permit) => permit,
        Err(err) => {
            // The wait resolves with an error when the queued task was
            // cancelled out from under it.
            if is_cancelled(state, &task.id) {
                set_status(state, &task.id, TaskStatus::Cancelled);
            } else {
                warn!(task_id = task.id, %err, "admission wait failed");
                set_status(state, &task.id, TaskStatus::Failed);
            }
            return;
        }
    };

    if is_cancelled(state, &task.id) {
        set_status(state, &task.id, TaskStatus::Cancelled);
        permit.release();
        return;
    }

    set_status(state, &task.id, TaskStatus::Running);
    let handle = supervisor.start(task);
    state
        .sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(task.id.clone(), handle.session_id.clone());

    let outcome = handle.wait().await;
    state
        .sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&task.id);
    permit.release();

    let status = match outcome {
        Ok(outcome) => match outcome.status {
            OutcomeStatus::Done => TaskStatus::Done,
            OutcomeStatus::Failed => TaskStatus::Failed,
            OutcomeStatus::Stopped => TaskStatus::Cancelled,
        },
        Err(err) => {
            warn!(task_id = task.id, %err, "attempt lineage lost");
            TaskStatus::Failed
        }
    };
    info!(task_id = task.id, ?status, "task terminal");
    set_status(state, &task.id, status);
}
