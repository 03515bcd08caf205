//! hisim - Hierarchical sequential models for claim development
//!
//! This library provides:
//! - Layered models: one estimator per outcome variable, fitted in order
//! - Covariate updaters anchored before, between and after layers
//! - Stochastic forward simulation over independent, reproducible replicates
//! - A reference GLM estimator (binomial, poisson, gaussian, gamma)
//! - CSV datasets, synthetic claim histories and reserve summaries

pub mod data;
pub mod error;
pub mod estimator;
pub mod model;
pub mod reserve;
pub mod simulation;
pub mod synthetic;

// Re-export commonly used types
pub use data::{Dataset, Record, Value};
pub use error::{Error, Result};
pub use estimator::{Estimator, FittedEstimator, FormulaSpec, Glm, Prediction};
pub use model::{formulas, Anchor, LayerOptions, Model, Transformation};
pub use reserve::ReserveSummary;
pub use simulation::{SimulationConfig, SimulationReport, Simulator};
