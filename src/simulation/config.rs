//! Simulation run configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;

/// Default cap on cycles simulated per replicate
pub const DEFAULT_MAX_CYCLES: u32 = 50;

/// Default base seed for replicate random streams
pub const DEFAULT_SEED: u64 = 2024;

/// What to do when a replicate fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Return the failure of the lowest failing replicate
    #[default]
    Abort,
    /// Keep the successful replicates and report the failures alongside
    Partial,
}

/// Configuration for a simulation run
///
/// Every field has a default, so a JSON file only needs the fields it changes:
/// ```json
/// { "max_cycles": 20, "seed": 7, "failure_policy": "partial" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Maximum cycles simulated per replicate
    pub max_cycles: u32,

    /// Base seed; replicate `r` draws from a stream derived from (seed, r)
    pub seed: u64,

    /// Run replicates on the rayon thread pool
    pub parallel: bool,

    pub failure_policy: FailurePolicy,

    /// Wall-clock budget for the whole run, checked between cycles
    pub deadline_ms: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_cycles: DEFAULT_MAX_CYCLES,
            seed: DEFAULT_SEED,
            parallel: true,
            failure_policy: FailurePolicy::Abort,
            deadline_ms: None,
        }
    }
}

impl SimulationConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Seed of replicate `replicate`'s random stream
    pub fn replicate_seed(&self, replicate: u32) -> u64 {
        self.seed ^ (replicate as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }
}

/// Shared flag that stops a running simulation between cycles
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
