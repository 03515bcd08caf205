//! A single outcome layer: estimator, eligibility filter and target transform

use log::{debug, info};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::data::{Dataset, Record, Value};
use crate::error::{Error, Result};
use crate::estimator::{Estimator, EstimatorError, FittedEstimator, FormulaSpec, Prediction};

/// Predicate over a single record
pub type RecordPredicate = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Transformation applied to the target before fitting and undone on generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transformation {
    #[default]
    Identity,
    /// Model the log of a strictly positive target
    Log,
}

impl Transformation {
    pub fn forward(&self, x: f64) -> Option<f64> {
        match self {
            Transformation::Identity => Some(x),
            Transformation::Log if x > 0.0 => Some(x.ln()),
            Transformation::Log => None,
        }
    }

    pub fn inverse(&self, x: f64) -> f64 {
        match self {
            Transformation::Identity => x,
            Transformation::Log => x.exp(),
        }
    }

    /// Expected value on the original scale
    pub fn inverse_mean(&self, prediction: &Prediction) -> f64 {
        match (self, prediction) {
            // Log-normal mean
            (Transformation::Log, Prediction::Normal { mean, sd }) => (mean + 0.5 * sd * sd).exp(),
            _ => self.inverse(prediction.mean()),
        }
    }
}

/// How a layer turns a prediction into a value
pub enum Draw<'a> {
    /// One stochastic realization per record
    Sample(&'a mut StdRng),
    /// Expected value, for evaluation
    Expected,
}

/// Optional layer settings
#[derive(Clone, Default)]
pub struct LayerOptions {
    pub filter: Option<RecordPredicate>,
    pub transformation: Transformation,
    /// Column whose levels receive separate balance factors
    pub balance_by: Option<String>,
}

impl LayerOptions {
    /// Restrict the layer to records satisfying `filter`
    pub fn filtered<F>(filter: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        Self {
            filter: Some(Arc::new(filter)),
            ..Self::default()
        }
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_transformation(mut self, transformation: Transformation) -> Self {
        self.transformation = transformation;
        self
    }

    pub fn balanced_by(mut self, column: &str) -> Self {
        self.balance_by = Some(column.to_string());
        self
    }
}

/// One outcome variable's modeling unit
#[derive(Clone)]
pub struct Layer {
    name: String,
    estimator: Arc<dyn Estimator>,
    filter: Option<RecordPredicate>,
    transformation: Transformation,
    balance_by: Option<String>,
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("name", &self.name)
            .field("filtered", &self.filter.is_some())
            .field("transformation", &self.transformation)
            .field("balance_by", &self.balance_by)
            .finish()
    }
}

impl Layer {
    pub fn new(name: impl Into<String>, estimator: Arc<dyn Estimator>, options: LayerOptions) -> Self {
        Self {
            name: name.into(),
            estimator,
            filter: options.filter,
            transformation: options.transformation,
            balance_by: options.balance_by,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transformation(&self) -> Transformation {
        self.transformation
    }

    pub fn balance_by(&self) -> Option<&str> {
        self.balance_by.as_deref()
    }

    /// Whether a record takes part in fitting and receives a generated value
    pub fn is_eligible(&self, record: &Record) -> bool {
        self.filter.as_ref().map(|f| f(record)).unwrap_or(true)
    }

    /// Fit the layer's estimator on the eligible training rows
    pub fn fit(&self, training: &Dataset, formula: &FormulaSpec) -> Result<FittedLayer> {
        training.require_column(&self.name)?;
        if let Some(column) = &self.balance_by {
            training.require_column(column)?;
        }

        let mut eligible = training.filter(|r| self.is_eligible(r));
        for row in eligible.rows_mut() {
            let y = row.numeric(&self.name).ok_or_else(|| {
                Error::schema(format!(
                    "target '{}' of record '{}' at cycle {} is not numeric",
                    self.name, row.id, row.cycle
                ))
            })?;
            let t = self.transformation.forward(y).ok_or_else(|| {
                Error::schema(format!(
                    "target '{}' of record '{}' at cycle {} is {} which the {:?} transformation cannot take",
                    self.name, row.id, row.cycle, y, self.transformation
                ))
            })?;
            row.set(&self.name, Value::Number(t));
        }

        let wrap = |source: EstimatorError| Error::EstimatorFit {
            layer: self.name.clone(),
            source,
        };
        let estimator: Arc<dyn FittedEstimator> = Arc::from(self.estimator.fit(&eligible, &self.name, formula).map_err(wrap)?);

        let balance = match &self.balance_by {
            Some(column) => Some(BalanceFactors::compute(&eligible, &self.name, column, estimator.as_ref()).map_err(wrap)?),
            None => None,
        };

        info!(
            "Fitted layer '{}' on {} of {} rows ({})",
            self.name,
            eligible.len(),
            training.len(),
            formula
        );

        Ok(FittedLayer {
            layer: self.name.clone(),
            estimator,
            transformation: self.transformation,
            balance,
        })
    }

    /// Write generated values into column `name`
    ///
    /// Eligible records receive a draw (or the expected value); ineligible
    /// records receive the neutral default. Returns the updated data and the
    /// realized value of every row.
    pub fn generate(
        &self,
        fitted: Option<&FittedLayer>,
        mut data: Dataset,
        draw: &mut Draw<'_>,
    ) -> Result<(Dataset, Vec<f64>)> {
        let fitted = match fitted {
            Some(f) if f.layer == self.name => f,
            _ => return Err(Error::LayerNotFitted { layer: self.name.clone() }),
        };
        data.require_column(&self.name)?;

        let mut realized = Vec::with_capacity(data.len());
        for record in data.rows_mut() {
            let current = match record.value(&self.name) {
                Some(Value::Category(level)) => {
                    return Err(Error::schema(format!(
                        "column '{}' holds category '{}' and cannot take generated values",
                        self.name, level
                    )))
                }
                Some(v) => v.clone(),
                None => Value::Number(0.0),
            };

            if !self.is_eligible(record) {
                record.set(&self.name, current.neutral());
                realized.push(0.0);
                continue;
            }

            let x = fitted.realize(record, draw).map_err(|source| Error::Simulation {
                replicate: record.replicate.unwrap_or(0),
                cycle: record.cycle,
                layer: Some(self.name.clone()),
                record: Some(record.id.clone()),
                reason: source.to_string(),
            })?;
            record.set(&self.name, current.with_number(x));
            realized.push(x);
        }

        Ok((data, realized))
    }
}

/// Per-level multiplicative corrections so fitted means reproduce observed totals
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceFactors {
    column: String,
    factors: BTreeMap<String, f64>,
}

impl BalanceFactors {
    fn compute(
        eligible: &Dataset,
        target: &str,
        column: &str,
        estimator: &dyn FittedEstimator,
    ) -> std::result::Result<Self, EstimatorError> {
        let predictions = estimator.predict(eligible)?;
        let mut sums: BTreeMap<String, (f64, f64)> = BTreeMap::new();

        for (row, prediction) in eligible.rows().iter().zip(&predictions) {
            let Some(level) = row.level(column) else { continue };
            let observed = row.numeric(target).unwrap_or(0.0);
            let entry = sums.entry(level).or_insert((0.0, 0.0));
            entry.0 += observed;
            entry.1 += prediction.mean();
        }

        let factors = sums
            .into_iter()
            .map(|(level, (observed, predicted))| {
                let factor = if predicted > 0.0 { observed / predicted } else { 1.0 };
                (level, factor)
            })
            .collect();

        Ok(Self { column: column.to_string(), factors })
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    /// Factor for a record; 1.0 for levels not seen during fitting
    pub fn factor(&self, record: &Record) -> f64 {
        let level = record.level(&self.column);
        match level.as_ref().and_then(|l| self.factors.get(l)) {
            Some(f) => *f,
            None => {
                debug!("No balance factor for level {:?} of '{}'", level, self.column);
                1.0
            }
        }
    }
}

/// Fitted state of one layer
#[derive(Debug, Clone)]
pub struct FittedLayer {
    layer: String,
    estimator: Arc<dyn FittedEstimator>,
    transformation: Transformation,
    balance: Option<BalanceFactors>,
}

impl FittedLayer {
    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn balance(&self) -> Option<&BalanceFactors> {
        self.balance.as_ref()
    }

    /// Balance-corrected predictive distribution on the model scale
    pub fn prediction(&self, record: &Record) -> std::result::Result<Prediction, EstimatorError> {
        let prediction = self.estimator.predict_record(record)?;
        Ok(match &self.balance {
            Some(balance) => prediction.scale_mean(balance.factor(record)),
            None => prediction,
        })
    }

    fn realize(&self, record: &Record, draw: &mut Draw<'_>) -> std::result::Result<f64, EstimatorError> {
        let prediction = self.prediction(record)?;
        match draw {
            Draw::Sample(rng) => Ok(self.transformation.inverse(prediction.sample(&mut **rng)?)),
            Draw::Expected => Ok(self.transformation.inverse_mean(&prediction)),
        }
    }
}
