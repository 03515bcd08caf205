//! Synthetic claim development histories
//!
//! Each claim starts open at cycle 1 and develops one row per cycle until it
//! closes (or reaches `max_development`). A row records whether the claim
//! closed in that cycle, whether a payment was made and its size.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::data::{Dataset, Record, Value};
use crate::error::Result;

pub const KIND_PROPERTY: &str = "property";
pub const KIND_LIABILITY: &str = "liability";

/// Column names, in schema order
pub const COLUMNS: [&str; 6] = ["kind", "close", "payment", "size", "paid_to_date", "prev_payment"];

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Number of rows to produce
    pub rows: usize,
    pub seed: u64,
    /// Last development cycle of a claim that never closes
    pub max_development: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            rows: 500,
            seed: 42,
            max_development: 12,
        }
    }
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Probability that an open claim of `kind` closes at `cycle`
pub fn close_probability(kind: &str, cycle: u32) -> f64 {
    let liability = if kind == KIND_LIABILITY { -0.6 } else { 0.0 };
    logistic(-2.0 + 0.45 * cycle as f64 + liability)
}

/// Probability of a payment given the claim's close status
pub fn payment_probability(closed: bool) -> f64 {
    if closed {
        0.8
    } else {
        0.35
    }
}

/// Generate a training dataset of exactly `config.rows` rows
pub fn generate_claims(config: &SyntheticConfig) -> Result<Dataset> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut rows: Vec<Record> = Vec::with_capacity(config.rows);
    let mut claim = 0usize;

    while rows.len() < config.rows {
        let id = format!("C{:04}", claim);
        let kind = if claim % 2 == 0 { KIND_PROPERTY } else { KIND_LIABILITY };
        let mu = if kind == KIND_LIABILITY { 7.5 } else { 6.8 };
        let mut paid_to_date = 0.0;
        let mut prev_payment = 0.0;

        for cycle in 1..=config.max_development.max(1) {
            if rows.len() == config.rows {
                break;
            }
            let closed = rng.gen_bool(close_probability(kind, cycle));
            let paid = rng.gen_bool(payment_probability(closed));
            let size = if paid {
                let z: f64 = rng.sample(StandardNormal);
                (mu + 0.1 * cycle as f64 + 0.8 * z).exp()
            } else {
                0.0
            };
            paid_to_date += size;

            rows.push(
                Record::new(id.clone(), cycle)
                    .with("kind", kind)
                    .with("close", if closed { 1.0 } else { 0.0 })
                    .with("payment", if paid { 1.0 } else { 0.0 })
                    .with("size", size)
                    .with("paid_to_date", paid_to_date)
                    .with("prev_payment", Value::Number(prev_payment)),
            );
            prev_payment = if paid { 1.0 } else { 0.0 };
            if closed {
                break;
            }
        }
        claim += 1;
    }

    Dataset::from_records(COLUMNS.iter().map(|c| c.to_string()).collect(), rows)
}
