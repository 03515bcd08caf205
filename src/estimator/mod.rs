//! Pluggable estimator interface
//!
//! The layer engine never looks inside an estimator. It hands over the
//! eligible training rows, the target column and an opaque [`FormulaSpec`],
//! and later asks the fitted estimator for one [`Prediction`] per record.

pub mod formula;
pub mod glm;

use rand::Rng;
use rand_distr::{Bernoulli, Distribution, Gamma, Normal, Poisson};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::data::{Dataset, Record};

pub use glm::{Family, Glm, GlmConfig};

/// Model specification handed through to the estimator unmodified
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormulaSpec(String);

impl FormulaSpec {
    pub fn new(spec: impl Into<String>) -> Self {
        Self(spec.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FormulaSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FormulaSpec {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Failures reported by estimator backends
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EstimatorError {
    #[error("no eligible rows to fit")]
    NoData,

    #[error("invalid formula '{formula}': {reason}")]
    Formula { formula: String, reason: String },

    #[error("covariate '{column}' is missing or not numeric")]
    MissingCovariate { column: String },

    #[error("level '{level}' of '{column}' was not seen during fitting")]
    UnseenLevel { column: String, level: String },

    #[error("design matrix is singular")]
    Singular,

    #[error("no convergence after {iterations} iterations")]
    NonConvergence { iterations: usize },

    #[error("invalid prediction: {reason}")]
    InvalidPrediction { reason: String },

    #[error("{0}")]
    Backend(String),
}

/// Fit capability supplied by the caller for one layer
pub trait Estimator: Send + Sync {
    /// Fit `target` on the eligible rows
    fn fit(
        &self,
        data: &Dataset,
        target: &str,
        formula: &FormulaSpec,
    ) -> Result<Box<dyn FittedEstimator>, EstimatorError>;
}

/// Fitted state produced by an [`Estimator`]
pub trait FittedEstimator: Send + Sync + fmt::Debug {
    /// Predictive distribution for a single record
    fn predict_record(&self, record: &Record) -> Result<Prediction, EstimatorError>;

    /// Predictive distribution for every row of a dataset
    fn predict(&self, data: &Dataset) -> Result<Vec<Prediction>, EstimatorError> {
        data.rows().iter().map(|r| self.predict_record(r)).collect()
    }
}

/// Per-row predictive distribution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Prediction {
    /// Degenerate distribution at a single value
    Point(f64),
    Bernoulli { p: f64 },
    Normal { mean: f64, sd: f64 },
    Poisson { lambda: f64 },
    Gamma { shape: f64, scale: f64 },
}

impl Prediction {
    /// Expected value of the distribution
    pub fn mean(&self) -> f64 {
        match *self {
            Prediction::Point(x) => x,
            Prediction::Bernoulli { p } => p,
            Prediction::Normal { mean, .. } => mean,
            Prediction::Poisson { lambda } => lambda,
            Prediction::Gamma { shape, scale } => shape * scale,
        }
    }

    /// Same distribution family with its mean multiplied by `factor`
    pub fn scale_mean(self, factor: f64) -> Prediction {
        match self {
            Prediction::Point(x) => Prediction::Point(x * factor),
            Prediction::Bernoulli { p } => Prediction::Bernoulli { p: (p * factor).clamp(0.0, 1.0) },
            Prediction::Normal { mean, sd } => Prediction::Normal { mean: mean * factor, sd },
            Prediction::Poisson { lambda } => Prediction::Poisson { lambda: lambda * factor },
            Prediction::Gamma { shape, scale } => Prediction::Gamma { shape, scale: scale * factor },
        }
    }

    /// Draw one realization
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<f64, EstimatorError> {
        let invalid = |reason: String| EstimatorError::InvalidPrediction { reason };
        match *self {
            Prediction::Point(x) => Ok(x),
            Prediction::Bernoulli { p } => {
                let dist = Bernoulli::new(p.clamp(0.0, 1.0))
                    .map_err(|e| invalid(format!("bernoulli p={}: {}", p, e)))?;
                Ok(if dist.sample(rng) { 1.0 } else { 0.0 })
            }
            Prediction::Normal { mean, sd } => {
                // Normal::new only rejects a non-finite sd
                if !(mean.is_finite() && sd.is_finite() && sd >= 0.0) {
                    return Err(invalid(format!("normal mean={} sd={}", mean, sd)));
                }
                let dist = Normal::new(mean, sd)
                    .map_err(|e| invalid(format!("normal sd={}: {}", sd, e)))?;
                Ok(dist.sample(rng))
            }
            Prediction::Poisson { lambda } => {
                if lambda == 0.0 {
                    return Ok(0.0);
                }
                let dist = Poisson::new(lambda)
                    .map_err(|e| invalid(format!("poisson lambda={}: {}", lambda, e)))?;
                Ok(dist.sample(rng))
            }
            Prediction::Gamma { shape, scale } => {
                let dist = Gamma::new(shape, scale)
                    .map_err(|e| invalid(format!("gamma shape={} scale={}: {}", shape, scale, e)))?;
                Ok(dist.sample(rng))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_prediction_means() {
        assert_eq!(Prediction::Point(3.0).mean(), 3.0);
        assert_eq!(Prediction::Bernoulli { p: 0.25 }.mean(), 0.25);
        assert_eq!(Prediction::Gamma { shape: 2.0, scale: 5.0 }.mean(), 10.0);
    }

    #[test]
    fn test_scale_mean() {
        let scaled = Prediction::Gamma { shape: 2.0, scale: 5.0 }.scale_mean(1.5);
        assert_relative_eq!(scaled.mean(), 15.0);

        let capped = Prediction::Bernoulli { p: 0.8 }.scale_mean(2.0);
        assert_eq!(capped.mean(), 1.0);
    }

    #[test]
    fn test_sampling_is_reproducible() {
        let pred = Prediction::Normal { mean: 10.0, sd: 2.0 };
        let a = pred.sample(&mut StdRng::seed_from_u64(7)).unwrap();
        let b = pred.sample(&mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_bernoulli_sample_is_binary() {
        let mut rng = StdRng::seed_from_u64(1);
        let pred = Prediction::Bernoulli { p: 0.5 };
        for _ in 0..50 {
            let x = pred.sample(&mut rng).unwrap();
            assert!(x == 0.0 || x == 1.0);
        }
    }

    #[test]
    fn test_sample_mean_close_to_expectation() {
        let mut rng = StdRng::seed_from_u64(42);
        let pred = Prediction::Poisson { lambda: 4.0 };
        let n = 20_000;
        let total: f64 = (0..n).map(|_| pred.sample(&mut rng).unwrap()).sum();
        assert!((total / n as f64 - 4.0).abs() < 0.1);
    }

    #[test]
    fn test_invalid_normal_is_reported() {
        let pred = Prediction::Normal { mean: 0.0, sd: -1.0 };
        let err = pred.sample(&mut StdRng::seed_from_u64(1)).unwrap_err();
        assert!(matches!(err, EstimatorError::InvalidPrediction { .. }));

        let nan_mean = Prediction::Normal { mean: f64::NAN, sd: 1.0 };
        assert!(nan_mean.sample(&mut StdRng::seed_from_u64(1)).is_err());

        let degenerate = Prediction::Normal { mean: 4.0, sd: 0.0 };
        assert_eq!(degenerate.sample(&mut StdRng::seed_from_u64(1)).unwrap(), 4.0);
    }
}
