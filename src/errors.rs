//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Task graph failed DAG or wave-consistency validation.
    Graph(String),
    /// Process could not be spawned (executable missing or not launchable).
    Spawn(String),
    /// Supervisor lifecycle failure (streaming, stop, retry bookkeeping).
    Supervise(String),
    /// Session store read or write failure.
    Store(String),
    /// Store lock could not be acquired within the deadline; retryable.
    LockTimeout(String),
    /// Inbound event rejected at the ingest boundary.
    Ingest(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Graph(msg) => write!(f, "graph: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Supervise(msg) => write!(f, "supervise: {msg}"),
            Self::Store(msg) => write!(f, "store: {msg}"),
            Self::LockTimeout(msg) => write!(f, "lock timeout: {msg}"),
            Self::Ingest(msg) => write!(f, "ingest: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Whether the caller may retry the failed operation.
    ///
    /// Only lock contention on the session store is transient; every other
    /// variant reflects a condition a bare retry cannot fix.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
