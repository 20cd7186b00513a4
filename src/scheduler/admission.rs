//! Per-category admission control with FIFO queueing.
//!
//! Each category has a configured maximum concurrent count. A task whose
//! category is at capacity queues behind a oneshot waker — the wait is a
//! channel wait, not a poll — and is granted capacity in FIFO order as
//! permits release. Cancelling a queued task removes its waker
//! synchronously without ever involving a process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use crate::models::task::TaskCategory;
use crate::{AppError, Result};

/// One queued acquisition; dropping the sender cancels the grant.
struct Waiter {
    task_id: String,
    grant_tx: oneshot::Sender<()>,
}

/// Capacity state for one category.
struct CategoryState {
    ceiling: u32,
    running: u32,
    queue: VecDeque<Waiter>,
}

impl CategoryState {
    fn new(ceiling: u32) -> Self {
        Self {
            ceiling: ceiling.max(1),
            running: 0,
            queue: VecDeque::new(),
        }
    }
}

/// Point-in-time counters for one category, for capacity/backpressure UIs.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CategoryStatus {
    /// Which category.
    pub category: TaskCategory,
    /// Currently admitted tasks.
    pub running: u32,
    /// Tasks waiting for capacity.
    pub queued: u32,
    /// Configured maximum concurrent count.
    pub ceiling: u32,
}

/// Tracks running/queued counts per category against configured ceilings.
pub struct AdmissionController {
    inner: Mutex<HashMap<TaskCategory, CategoryState>>,
}

impl AdmissionController {
    /// Create a controller with the given per-category ceilings.
    ///
    /// Categories absent from the map get a ceiling of 1 on first use.
    #[must_use]
    pub fn new(ceilings: &HashMap<TaskCategory, u32>) -> Self {
        let inner = ceilings
            .iter()
            .map(|(category, ceiling)| (*category, CategoryState::new(*ceiling)))
            .collect();
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Acquire a permit for `category`, queueing FIFO when at capacity.
    ///
    /// With a `deadline`, the queue wait is bounded; on expiry the waiter is
    /// removed and an error returned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Supervise` when the wait is cancelled (the task
    /// was removed from the queue) or the deadline expired.
    pub async fn acquire(
        self: &Arc<Self>,
        category: TaskCategory,
        task_id: &str,
        deadline: Option<Duration>,
    ) -> Result<AdmissionPermit> {
        let grant_rx = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let state = inner
                .entry(category)
                .or_insert_with(|| CategoryState::new(1));

            if state.running < state.ceiling {
                state.running += 1;
                None
            } else {
                let (grant_tx, grant_rx) = oneshot::channel();
                state.queue.push_back(Waiter {
                    task_id: task_id.to_owned(),
                    grant_tx,
                });
                debug!(task_id, ?category, depth = state.queue.len(), "queued for capacity");
                Some(grant_rx)
            }
        };

        if let Some(grant_rx) = grant_rx {
            let granted = match deadline {
                Some(deadline) => match tokio::time::timeout(deadline, grant_rx).await {
                    Ok(result) => result,
                    Err(_) => {
                        // Deadline expired while queued; withdraw the waiter.
                        self.cancel_queued(task_id);
                        return Err(AppError::Supervise(format!(
                            "admission wait for task {task_id} timed out after {deadline:?}"
                        )));
                    }
                },
                None => grant_rx.await,
            };
            granted.map_err(|_| {
                AppError::Supervise(format!("admission wait cancelled for task {task_id}"))
            })?;
        }

        Ok(AdmissionPermit {
            controller: Arc::clone(self),
            category,
            released: false,
        })
    }

    /// Remove a still-queued task from its FIFO queue.
    ///
    /// Synchronous and instantaneous; returns whether a waiter was removed.
    /// The removed task's `acquire` call resolves to an error.
    pub fn cancel_queued(&self, task_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for state in inner.values_mut() {
            if let Some(position) = state.queue.iter().position(|w| w.task_id == task_id) {
                // Dropping the waiter drops its sender, failing the wait.
                state.queue.remove(position);
                return true;
            }
        }
        false
    }

    /// Release one unit of capacity and grant the next queued waiter.
    fn release(&self, category: TaskCategory) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(state) = inner.get_mut(&category) else {
            return;
        };

        state.running = state.running.saturating_sub(1);
        while let Some(waiter) = state.queue.pop_front() {
            // A waiter whose receiver is gone was cancelled mid-grant; skip
            // it and hand the slot to the next in line.
            if waiter.grant_tx.send(()).is_ok() {
                state.running += 1;
                break;
            }
        }
    }

    /// Per-category running count, queue depth, and ceiling.
    #[must_use]
    pub fn status(&self) -> Vec<CategoryStatus> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut statuses: Vec<CategoryStatus> = inner
            .iter()
            .map(|(category, state)| CategoryStatus {
                category: *category,
                running: state.running,
                queued: u32::try_from(state.queue.len()).unwrap_or(u32::MAX),
                ceiling: state.ceiling,
            })
            .collect();
        statuses.sort_by_key(|status| format!("{:?}", status.category));
        statuses
    }
}

/// Held capacity for one category; released on drop.
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    category: TaskCategory,
    released: bool,
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("category", &self.category)
            .field("released", &self.released)
            .finish()
    }
}

impl AdmissionPermit {
    /// Explicitly release the permit, waking the next queued task.
    pub fn release(mut self) {
        self.released = true;
        self.controller.release(self.category);
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if !self.released {
            self.controller.release(self.category);
        }
    }
}
