//! Capacity-gated task admission and wave-ordered scheduling.

pub mod admission;
#[allow(clippy::module_inception)]
pub mod scheduler;

pub use admission::{AdmissionController, AdmissionPermit, CategoryStatus};
pub use scheduler::{RunReport, TaskScheduler};
