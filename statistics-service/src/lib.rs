pub mod config;
pub mod control;
pub mod error;
pub mod metrics_server;
pub mod observability;
pub mod reconcile;
pub mod sinks;
pub mod sources;
pub mod transform;

pub use reconcile::{CycleOutcome, ReconciliationCoordinator};
