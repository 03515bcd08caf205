//! Forward simulation of fitted models

mod config;
mod engine;
mod state;

pub use config::{CancellationToken, FailurePolicy, SimulationConfig, DEFAULT_MAX_CYCLES, DEFAULT_SEED};
pub use engine::{ReplicateOutcome, SimulationReport, Simulator};
pub use state::{ReplicateStatus, SimulationState, TerminationReason};
