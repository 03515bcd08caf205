//! Reference generalized linear model backend
//!
//! Fitted by iteratively reweighted least squares with the canonical links
//! (logit for binomial, log for poisson and gamma, identity for gaussian).
//! Linear predictor = intercept + sum(coefficient * covariate), as in any
//! log- or logit-link predictive model.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::formula::{Formula, Term};
use super::{Estimator, EstimatorError, FittedEstimator, FormulaSpec, Prediction};
use crate::data::{Dataset, Record};

const MU_EPSILON: f64 = 1e-10;
const MAX_ETA: f64 = 700.0;
/// Singular values of X'WX below this fraction of its largest diagonal count as zero
const RANK_TOLERANCE: f64 = 1e-10;

/// Response distribution and its canonical link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    /// 0/1 outcomes, logit link
    Binomial,
    /// Counts, log link
    Poisson,
    /// Continuous outcomes, identity link
    Gaussian,
    /// Positive continuous outcomes, log link
    Gamma,
}

impl Family {
    fn link(&self, mu: f64) -> f64 {
        match self {
            Family::Binomial => (mu / (1.0 - mu)).ln(),
            Family::Poisson | Family::Gamma => mu.ln(),
            Family::Gaussian => mu,
        }
    }

    fn inverse_link(&self, eta: f64) -> f64 {
        match self {
            Family::Binomial => {
                let p = 1.0 / (1.0 + (-eta).exp());
                p.clamp(MU_EPSILON, 1.0 - MU_EPSILON)
            }
            Family::Poisson | Family::Gamma => eta.min(MAX_ETA).exp().max(MU_EPSILON),
            Family::Gaussian => eta,
        }
    }

    /// d mu / d eta
    fn mu_eta(&self, mu: f64) -> f64 {
        match self {
            Family::Binomial => (mu * (1.0 - mu)).max(MU_EPSILON),
            Family::Poisson | Family::Gamma => mu.max(MU_EPSILON),
            Family::Gaussian => 1.0,
        }
    }

    fn variance(&self, mu: f64) -> f64 {
        match self {
            Family::Binomial => (mu * (1.0 - mu)).max(MU_EPSILON),
            Family::Poisson => mu.max(MU_EPSILON),
            Family::Gamma => (mu * mu).max(MU_EPSILON),
            Family::Gaussian => 1.0,
        }
    }

    fn starting_mu(&self, y: f64) -> f64 {
        match self {
            Family::Binomial => (y + 0.5) / 2.0,
            Family::Poisson => y + 0.1,
            Family::Gamma | Family::Gaussian => y,
        }
    }

    fn check_response(&self, y: f64) -> Result<(), EstimatorError> {
        let ok = y.is_finite()
            && match self {
                Family::Binomial => (0.0..=1.0).contains(&y),
                Family::Poisson => y >= 0.0,
                Family::Gamma => y > 0.0,
                Family::Gaussian => true,
            };
        if ok {
            Ok(())
        } else {
            Err(EstimatorError::Backend(format!(
                "response {} is outside the support of the {:?} family",
                y, self
            )))
        }
    }

    fn unit_deviance(&self, y: f64, mu: f64) -> f64 {
        fn ylogy(y: f64, mu: f64) -> f64 {
            if y == 0.0 { 0.0 } else { y * (y / mu).ln() }
        }
        match self {
            Family::Gaussian => (y - mu).powi(2),
            Family::Binomial => 2.0 * (ylogy(y, mu) + ylogy(1.0 - y, 1.0 - mu)),
            Family::Poisson => 2.0 * (ylogy(y, mu) - (y - mu)),
            Family::Gamma => 2.0 * (-(y / mu).ln() + (y - mu) / mu),
        }
    }

    fn estimates_dispersion(&self) -> bool {
        matches!(self, Family::Gaussian | Family::Gamma)
    }
}

/// IRLS controls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlmConfig {
    pub max_iterations: usize,
    /// Relative deviance change treated as converged
    pub tolerance: f64,
}

impl Default for GlmConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            tolerance: 1e-8,
        }
    }
}

/// GLM estimator for one layer
#[derive(Debug, Clone)]
pub struct Glm {
    family: Family,
    config: GlmConfig,
}

impl Glm {
    pub fn new(family: Family) -> Self {
        Self { family, config: GlmConfig::default() }
    }

    pub fn binomial() -> Self {
        Self::new(Family::Binomial)
    }

    pub fn poisson() -> Self {
        Self::new(Family::Poisson)
    }

    pub fn gaussian() -> Self {
        Self::new(Family::Gaussian)
    }

    pub fn gamma() -> Self {
        Self::new(Family::Gamma)
    }

    pub fn with_config(mut self, config: GlmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn family(&self) -> Family {
        self.family
    }
}

/// Column of the design matrix
#[derive(Debug, Clone)]
enum DesignColumn {
    Numeric(String),
    Dummy { column: String, level: String },
}

/// Mapping from a record to a design-matrix row
#[derive(Debug, Clone)]
struct Design {
    intercept: bool,
    columns: Vec<DesignColumn>,
    /// Levels seen during fitting, per factor column
    levels: BTreeMap<String, BTreeSet<String>>,
}

impl Design {
    fn build(formula: &Formula, data: &Dataset) -> Result<Self, EstimatorError> {
        let mut columns = Vec::new();
        let mut levels = BTreeMap::new();

        for term in &formula.terms {
            match term {
                Term::Numeric(column) => columns.push(DesignColumn::Numeric(column.clone())),
                Term::Factor(column) => {
                    let mut seen = BTreeSet::new();
                    for row in data.rows() {
                        let level = row.level(column).ok_or_else(|| EstimatorError::MissingCovariate {
                            column: column.clone(),
                        })?;
                        seen.insert(level);
                    }
                    // First level is the reference when an intercept is present
                    let skip = usize::from(formula.intercept);
                    for level in seen.iter().skip(skip) {
                        columns.push(DesignColumn::Dummy {
                            column: column.clone(),
                            level: level.clone(),
                        });
                    }
                    levels.insert(column.clone(), seen);
                }
            }
        }

        Ok(Self { intercept: formula.intercept, columns, levels })
    }

    fn width(&self) -> usize {
        self.columns.len() + usize::from(self.intercept)
    }

    fn row(&self, record: &Record) -> Result<Vec<f64>, EstimatorError> {
        for (column, seen) in &self.levels {
            let level = record.level(column).ok_or_else(|| EstimatorError::MissingCovariate {
                column: column.clone(),
            })?;
            if !seen.contains(&level) {
                return Err(EstimatorError::UnseenLevel { column: column.clone(), level });
            }
        }

        let mut x = Vec::with_capacity(self.width());
        if self.intercept {
            x.push(1.0);
        }
        for col in &self.columns {
            match col {
                DesignColumn::Numeric(column) => {
                    let v = record.numeric(column).ok_or_else(|| EstimatorError::MissingCovariate {
                        column: column.clone(),
                    })?;
                    x.push(v);
                }
                DesignColumn::Dummy { column, level } => {
                    let is_level = record.level(column).as_deref() == Some(level.as_str());
                    x.push(if is_level { 1.0 } else { 0.0 });
                }
            }
        }
        Ok(x)
    }

    fn names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.width());
        if self.intercept {
            names.push("(Intercept)".to_string());
        }
        for col in &self.columns {
            names.push(match col {
                DesignColumn::Numeric(c) => c.clone(),
                DesignColumn::Dummy { column, level } => format!("{}={}", column, level),
            });
        }
        names
    }
}

/// Fitted GLM state
#[derive(Debug, Clone)]
pub struct FittedGlm {
    family: Family,
    design: Design,
    coefficients: Vec<f64>,
    dispersion: f64,
    iterations: usize,
    deviance: f64,
}

impl FittedGlm {
    /// Named coefficients in design order
    pub fn coefficients(&self) -> Vec<(String, f64)> {
        self.design.names().into_iter().zip(self.coefficients.iter().copied()).collect()
    }

    pub fn dispersion(&self) -> f64 {
        self.dispersion
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn deviance(&self) -> f64 {
        self.deviance
    }

    fn linear_predictor(&self, x: &[f64]) -> f64 {
        x.iter().zip(&self.coefficients).map(|(a, b)| a * b).sum()
    }
}

impl FittedEstimator for FittedGlm {
    fn predict_record(&self, record: &Record) -> Result<Prediction, EstimatorError> {
        let x = self.design.row(record)?;
        let mu = self.family.inverse_link(self.linear_predictor(&x));

        Ok(match self.family {
            Family::Binomial => Prediction::Bernoulli { p: mu },
            Family::Poisson => Prediction::Poisson { lambda: mu },
            Family::Gaussian => Prediction::Normal { mean: mu, sd: self.dispersion.max(0.0).sqrt() },
            Family::Gamma if self.dispersion > 0.0 => Prediction::Gamma {
                shape: 1.0 / self.dispersion,
                scale: mu * self.dispersion,
            },
            Family::Gamma => Prediction::Point(mu),
        })
    }
}

impl Glm {
    /// Fit and keep the concrete GLM state (coefficients, dispersion, deviance)
    pub fn fit_glm(&self, data: &Dataset, target: &str, spec: &FormulaSpec) -> Result<FittedGlm, EstimatorError> {
        let formula = Formula::parse(spec)?;
        if let Some(response) = &formula.response {
            if response != target {
                return Err(EstimatorError::Formula {
                    formula: spec.to_string(),
                    reason: format!("response '{}' does not match target '{}'", response, target),
                });
            }
        }
        if data.is_empty() {
            return Err(EstimatorError::NoData);
        }

        let design = Design::build(&formula, data)?;
        let mut flat = Vec::with_capacity(data.len() * design.width());
        let mut y = Vec::with_capacity(data.len());
        for row in data.rows() {
            let response = row.numeric(target).ok_or_else(|| EstimatorError::MissingCovariate {
                column: target.to_string(),
            })?;
            self.family.check_response(response)?;
            flat.extend(design.row(row)?);
            y.push(response);
        }
        let x = DMatrix::from_row_slice(y.len(), design.width(), &flat);
        let y = DVector::from_vec(y);

        let fit = irls(self.family, &x, &y, &self.config)?;
        Ok(FittedGlm {
            family: self.family,
            design,
            coefficients: fit.beta.iter().copied().collect(),
            dispersion: fit.dispersion,
            iterations: fit.iterations,
            deviance: fit.deviance,
        })
    }
}

impl Estimator for Glm {
    fn fit(
        &self,
        data: &Dataset,
        target: &str,
        spec: &FormulaSpec,
    ) -> Result<Box<dyn FittedEstimator>, EstimatorError> {
        Ok(Box::new(self.fit_glm(data, target, spec)?))
    }
}

struct IrlsFit {
    beta: DVector<f64>,
    dispersion: f64,
    iterations: usize,
    deviance: f64,
}

fn irls(family: Family, x: &DMatrix<f64>, y: &DVector<f64>, config: &GlmConfig) -> Result<IrlsFit, EstimatorError> {
    let (n, p) = x.shape();
    if n < p {
        return Err(EstimatorError::Singular);
    }

    let mut mu = y.map(|yi| family.starting_mu(yi));
    let mut eta = mu.map(|m| family.link(m));
    let mut deviance_old = f64::INFINITY;

    for iteration in 1..=config.max_iterations {
        let d = mu.map(|m| family.mu_eta(m));
        let w = DVector::from_fn(n, |i, _| d[i] * d[i] / family.variance(mu[i]));
        let z = DVector::from_fn(n, |i, _| eta[i] + (y[i] - mu[i]) / d[i]);
        let xw = DMatrix::from_fn(n, p, |i, j| x[(i, j)] * w[i]);

        let beta = solve_normal_equation(x.transpose() * &xw, xw.transpose() * &z)?;
        eta = x * &beta;
        mu = eta.map(|e| family.inverse_link(e));

        let deviance: f64 = y.iter().zip(mu.iter()).map(|(&yi, &mi)| family.unit_deviance(yi, mi)).sum();
        if !deviance.is_finite() {
            return Err(EstimatorError::NonConvergence { iterations: iteration });
        }
        if (deviance - deviance_old).abs() / (deviance.abs() + 0.1) < config.tolerance {
            let dispersion = if family.estimates_dispersion() && n > p {
                let pearson: f64 = y
                    .iter()
                    .zip(mu.iter())
                    .map(|(&yi, &mi)| (yi - mi).powi(2) / family.variance(mi))
                    .sum();
                pearson / (n - p) as f64
            } else if family.estimates_dispersion() {
                0.0
            } else {
                1.0
            };
            return Ok(IrlsFit { beta, dispersion, iterations: iteration, deviance });
        }
        deviance_old = deviance;
    }

    Err(EstimatorError::NonConvergence { iterations: config.max_iterations })
}

/// Solve X'WX beta = X'Wz, Cholesky first with an LU fallback
fn solve_normal_equation(normal: DMatrix<f64>, rhs: DVector<f64>) -> Result<DVector<f64>, EstimatorError> {
    let scale = normal.diagonal().amax().max(1.0);
    if normal.rank(RANK_TOLERANCE * scale) < normal.nrows() {
        return Err(EstimatorError::Singular);
    }
    if let Some(chol) = normal.clone().cholesky() {
        return Ok(chol.solve(&rhs));
    }
    normal.lu().solve(&rhs).ok_or(EstimatorError::Singular)
}
