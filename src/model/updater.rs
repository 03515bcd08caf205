//! Deterministic covariate updaters and the points in a cycle where they run

use log::debug;
use std::fmt;
use std::sync::Arc;

use crate::data::Dataset;
use crate::error::{Error, Result};

/// Pure transformation of the rows generated in a cycle
pub type Transform = Arc<dyn Fn(Dataset) -> Dataset + Send + Sync>;

/// Point within a cycle at which an updater runs
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Anchor {
    /// Before the first layer fires
    StartOfCycle,
    /// Right after the named layer has generated its values
    AfterLayer(String),
    /// After every layer has fired
    #[default]
    EndOfCycle,
}

impl Anchor {
    pub fn after(layer: &str) -> Self {
        Anchor::AfterLayer(layer.to_string())
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anchor::StartOfCycle => write!(f, "start of cycle"),
            Anchor::AfterLayer(layer) => write!(f, "after layer '{}'", layer),
            Anchor::EndOfCycle => write!(f, "end of cycle"),
        }
    }
}

#[derive(Clone)]
pub struct Updater {
    label: String,
    transform: Transform,
    anchor: Anchor,
}

impl fmt::Debug for Updater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Updater")
            .field("label", &self.label)
            .field("anchor", &self.anchor)
            .finish()
    }
}

impl Updater {
    pub fn new(label: impl Into<String>, transform: Transform, anchor: Anchor) -> Self {
        Self {
            label: label.into(),
            transform,
            anchor,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn anchor(&self) -> &Anchor {
        &self.anchor
    }
}

/// Updaters in registration order
#[derive(Debug, Clone, Default)]
pub struct UpdaterRegistry {
    updaters: Vec<Updater>,
}

impl UpdaterRegistry {
    pub fn register(&mut self, updater: Updater) {
        self.updaters.push(updater);
    }

    pub fn len(&self) -> usize {
        self.updaters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updaters.is_empty()
    }

    /// Updaters registered at an anchor, in registration order
    pub fn at<'a>(&'a self, anchor: &'a Anchor) -> impl Iterator<Item = &'a Updater> + 'a {
        self.updaters.iter().filter(move |u| &u.anchor == anchor)
    }

    /// Run every updater at `anchor`, each on the previous one's output
    ///
    /// Updaters may rewrite values but must keep the same rows (same ids and
    /// cycles, same order).
    pub fn apply_anchor(&self, mut data: Dataset, anchor: &Anchor) -> Result<Dataset> {
        for updater in self.at(anchor) {
            let keys: Vec<(String, u32)> = data.rows().iter().map(|r| (r.id.clone(), r.cycle)).collect();
            let (replicate, cycle) = data
                .rows()
                .first()
                .map(|r| (r.replicate.unwrap_or(0), r.cycle))
                .unwrap_or((0, 0));

            debug!("Applying updater '{}' {} to {} rows", updater.label, anchor, keys.len());
            data = (updater.transform)(data);

            let unchanged = data.len() == keys.len()
                && data.rows().iter().zip(&keys).all(|(r, (id, c))| &r.id == id && r.cycle == *c);
            if !unchanged {
                return Err(Error::Simulation {
                    replicate,
                    cycle,
                    layer: None,
                    record: None,
                    reason: format!("updater '{}' added, removed or reordered rows", updater.label),
                });
            }
        }
        Ok(data)
    }
}
