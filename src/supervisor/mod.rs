//! Process supervision: spawn, stream, idle-detect, stop, retry, resume.

pub mod codec;
pub mod idle;
pub mod reader;
pub mod signal;
#[allow(clippy::module_inception)]
pub mod supervisor;

pub use supervisor::{OutcomeStatus, SessionOutcome, Supervisor, SupervisorHandle};
