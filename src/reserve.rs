//! Reserve summaries over simulated replicates

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::data::Dataset;
use crate::error::{Error, Result};

/// Quantile levels reported by default
pub const DEFAULT_QUANTILES: [f64; 4] = [0.5, 0.75, 0.95, 0.995];

/// Distribution of a projected total across replicates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveSummary {
    /// Column that was totalled
    pub column: String,

    /// Total per replicate, keyed by replicate id
    pub totals: BTreeMap<u32, f64>,

    pub mean: f64,

    /// Sample standard deviation (zero with a single replicate)
    pub std_dev: f64,

    /// (level, value) pairs
    pub quantiles: Vec<(f64, f64)>,
}

impl ReserveSummary {
    /// Total `column` over the rows each replicate projected
    ///
    /// A row counts as projected when its (id, cycle) pair does not appear in
    /// `initial`. Replicates without projected rows total zero.
    pub fn from_simulation(simulated: &Dataset, initial: &Dataset, column: &str) -> Result<Self> {
        simulated.require_column(column)?;
        let replicates = simulated.replicate_ids();
        if replicates.is_empty() {
            return Err(Error::schema("simulated data carries no replicate ids"));
        }

        let observed: BTreeSet<(&str, u32)> = initial.rows().iter().map(|r| (r.id.as_str(), r.cycle)).collect();
        let mut totals: BTreeMap<u32, f64> = replicates.into_iter().map(|r| (r, 0.0)).collect();
        for row in simulated.rows() {
            if observed.contains(&(row.id.as_str(), row.cycle)) {
                continue;
            }
            if let (Some(replicate), Some(x)) = (row.replicate, row.numeric(column)) {
                *totals.entry(replicate).or_insert(0.0) += x;
            }
        }

        let values: Vec<f64> = totals.values().copied().collect();
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let std_dev = if values.len() > 1 {
            (values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
        } else {
            0.0
        };

        let mut sorted = values;
        sorted.sort_by(|a, b| a.total_cmp(b));
        let quantiles = DEFAULT_QUANTILES.iter().map(|&q| (q, quantile_sorted(&sorted, q))).collect();

        Ok(Self {
            column: column.to_string(),
            totals,
            mean,
            std_dev,
            quantiles,
        })
    }

    /// Empirical quantile of the replicate totals (linear interpolation)
    pub fn quantile(&self, q: f64) -> f64 {
        let mut sorted: Vec<f64> = self.totals.values().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        quantile_sorted(&sorted, q)
    }

    pub fn replicates(&self) -> usize {
        self.totals.len()
    }
}

fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let h = (sorted.len() - 1) as f64 * q.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}
