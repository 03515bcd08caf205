//! Error types for model construction, fitting and simulation

use thiserror::Error;

use crate::estimator::EstimatorError;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the layer engine and its I/O collaborators
#[derive(Debug, Error)]
pub enum Error {
    /// Expected column missing or holding the wrong kind of value
    #[error("Schema error: {message}")]
    Schema { message: String },

    /// Generation or prediction requested before the layer was fitted
    #[error("Layer '{layer}' has not been fitted")]
    LayerNotFitted { layer: String },

    /// Estimator backend failed while fitting a layer
    #[error("Fitting layer '{layer}' failed: {source}")]
    EstimatorFit {
        layer: String,
        #[source]
        source: EstimatorError,
    },

    /// Generation failed mid-replicate
    #[error(
        "Simulation failed in replicate {replicate} at cycle {cycle}{}: {reason}",
        location_suffix(.layer, .record)
    )]
    Simulation {
        replicate: u32,
        cycle: u32,
        layer: Option<String>,
        record: Option<String>,
        reason: String,
    },

    /// Invalid model setup (duplicate layer, unknown anchor, missing formula)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
}

fn location_suffix(layer: &Option<String>, record: &Option<String>) -> String {
    let mut suffix = String::new();
    if let Some(layer) = layer {
        suffix.push_str(&format!(", layer '{}'", layer));
    }
    if let Some(record) = record {
        suffix.push_str(&format!(", record '{}'", record));
    }
    suffix
}

impl Error {
    pub(crate) fn schema(message: impl Into<String>) -> Self {
        Error::Schema { message: message.into() }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration { message: message.into() }
    }

    /// Replicate id for simulation failures
    pub fn replicate(&self) -> Option<u32> {
        match self {
            Error::Simulation { replicate, .. } => Some(*replicate),
            _ => None,
        }
    }
}
