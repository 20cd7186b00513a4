//! Ordered event ingest, replay history, and fan-out to subscribers.

#[allow(clippy::module_inception)]
pub mod hub;
pub mod http;

pub use hub::EventHub;
