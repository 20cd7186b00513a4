//! Task graph model and wholesale validation.
//!
//! A task graph arrives as a single JSON document from the authoring
//! collaborator. The scheduler accepts it only after every invariant holds;
//! a graph that fails any check is rejected in full, never partially loaded.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Resource category a task is admitted under.
///
/// Each category has its own concurrency ceiling (see
/// [`GlobalConfig::category_ceilings`](crate::config::GlobalConfig)).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    /// Foreground agent work; typically a low ceiling.
    Primary,
    /// Background/fan-out work; typically a higher ceiling.
    Worker,
}

/// Scheduler-visible lifecycle status of one task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Loaded, wave not yet released.
    Pending,
    /// Released, waiting for category capacity.
    Queued,
    /// Process supervisor owns a live attempt.
    Running,
    /// Terminal: lineage ended with exit code 0.
    Done,
    /// Terminal: retries exhausted, spawn failure, or unmet dependency.
    Failed,
    /// Terminal: removed by caller before or during execution.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal for wave-advance purposes.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// One schedulable unit of work from the task graph document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TaskSpec {
    /// Opaque identifier, unique within the graph.
    pub id: String,
    /// Admission category.
    pub category: TaskCategory,
    /// Dependency tier; all lower waves terminate first.
    pub wave: u32,
    /// Ids of tasks that must finish before this one starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Instruction blob delivered to the spawned process on stdin.
    pub payload: String,
    /// Additional spawn attempts permitted after an unexpected crash.
    #[serde(default)]
    pub max_retries: u32,
    /// Working directory for the spawned process; the configured workspace
    /// root is used when absent.
    #[serde(default)]
    pub project_root: Option<PathBuf>,
}

/// A validated collection of tasks forming a DAG tiered into waves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TaskGraph {
    /// All tasks in the run, any order.
    pub tasks: Vec<TaskSpec>,
}

impl TaskGraph {
    /// Parse a graph from its JSON document and validate it wholesale.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Graph` when the document is not valid JSON or any
    /// structural invariant fails; no partially-valid graph is ever returned.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let graph: Self = serde_json::from_str(raw)
            .map_err(|err| AppError::Graph(format!("malformed task graph: {err}")))?;
        graph.validate()?;
        Ok(graph)
    }

    /// Check every structural invariant of the graph.
    ///
    /// - ids are non-empty and unique;
    /// - every dependency names an existing task;
    /// - every dependency sits in a strictly lower wave (this also rules out
    ///   cycles, so the graph is a DAG by construction).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Graph` naming the first violated invariant.
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(AppError::Graph("task graph contains no tasks".into()));
        }

        let mut waves: HashMap<&str, u32> = HashMap::with_capacity(self.tasks.len());
        for task in &self.tasks {
            if task.id.trim().is_empty() {
                return Err(AppError::Graph("task id must not be empty".into()));
            }
            if waves.insert(task.id.as_str(), task.wave).is_some() {
                return Err(AppError::Graph(format!("duplicate task id `{}`", task.id)));
            }
        }

        for task in &self.tasks {
            let mut seen: HashSet<&str> = HashSet::with_capacity(task.dependencies.len());
            for dep in &task.dependencies {
                if !seen.insert(dep.as_str()) {
                    return Err(AppError::Graph(format!(
                        "task `{}` lists dependency `{dep}` twice",
                        task.id
                    )));
                }
                let Some(&dep_wave) = waves.get(dep.as_str()) else {
                    return Err(AppError::Graph(format!(
                        "task `{}` depends on unknown task `{dep}`",
                        task.id
                    )));
                };
                if dep_wave >= task.wave {
                    return Err(AppError::Graph(format!(
                        "task `{}` (wave {}) depends on `{dep}` (wave {dep_wave}); \
                         dependencies must sit in a strictly lower wave",
                        task.id, task.wave
                    )));
                }
            }
        }

        Ok(())
    }

    /// Distinct wave numbers in ascending order.
    #[must_use]
    pub fn waves(&self) -> Vec<u32> {
        let mut waves: Vec<u32> = self
            .tasks
            .iter()
            .map(|t| t.wave)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        waves.sort_unstable();
        waves
    }

    /// Tasks belonging to one wave, in document order.
    #[must_use]
    pub fn tasks_in_wave(&self, wave: u32) -> Vec<&TaskSpec> {
        self.tasks.iter().filter(|t| t.wave == wave).collect()
    }

    /// Look up a task by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.id == id)
    }
}
