#![forbid(unsafe_code)]

//! `agent-foreman` — orchestrator for long-running coding-agent processes.
//!
//! The crate supervises externally-spawned agent processes end-to-end:
//! admission-controlled scheduling over a wave-ordered task graph, per-attempt
//! process supervision (spawn, stream, idle-detect, timeout, retry, resume),
//! crash-recoverable session state behind a locked JSON document, and an
//! ordered event stream fanned out to any number of live subscribers.

pub mod config;
pub mod errors;
pub mod hub;
pub mod models;
pub mod scheduler;
pub mod store;
pub mod supervisor;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
