//! Hierarchical model: ordered layers, covariate updaters and fitted state
//!
//! A [`Model`] is built by chaining calls that consume and return it.
//! [`Model::fit`] borrows the model and hands back a new fitted one, so a
//! model referenced elsewhere is never changed underneath its holder.

mod layer;
mod updater;
mod fitting;

pub use layer::{BalanceFactors, Draw, FittedLayer, Layer, LayerOptions, RecordPredicate, Transformation};
pub use updater::{Anchor, Transform, Updater, UpdaterRegistry};
pub use fitting::{formulas, Formulas};

use log::debug;
use std::fmt;
use std::sync::Arc;

use crate::data::{Dataset, Record, Value};
use crate::error::{Error, Result};
use crate::estimator::Estimator;
use crate::simulation::{SimulationConfig, Simulator};

/// Ordered layers plus updaters over a training dataset
#[derive(Clone)]
pub struct Model {
    layers: Vec<Layer>,
    updaters: UpdaterRegistry,
    training_data: Arc<Dataset>,
    fitted: Option<Arc<Vec<FittedLayer>>>,
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("layers", &self.layers)
            .field("updaters", &self.updaters)
            .field("training_rows", &self.training_data.len())
            .field("fitted", &self.is_fitted())
            .finish()
    }
}

impl Model {
    pub fn new(training_data: Dataset) -> Self {
        Self {
            layers: Vec::new(),
            updaters: UpdaterRegistry::default(),
            training_data: Arc::new(training_data),
            fitted: None,
        }
    }

    /// Append a layer; its name must be unique within the model
    ///
    /// Adding a layer discards any fitted state.
    pub fn add_layer<E>(self, name: &str, estimator: E, options: LayerOptions) -> Result<Self>
    where
        E: Estimator + 'static,
    {
        self.add_shared_layer(name, Arc::new(estimator), options)
    }

    /// Append a layer backed by an estimator shared with other layers or models
    pub fn add_shared_layer(mut self, name: &str, estimator: Arc<dyn Estimator>, options: LayerOptions) -> Result<Self> {
        if self.layer(name).is_some() {
            return Err(Error::configuration(format!("duplicate layer name '{}'", name)));
        }
        if options.balance_by.is_some() && options.transformation != Transformation::Identity {
            return Err(Error::configuration(format!(
                "layer '{}' cannot combine balance correction with a {:?} transformation",
                name, options.transformation
            )));
        }
        if self.fitted.take().is_some() {
            debug!("Adding layer '{}' discards the previous fit", name);
        }
        self.layers.push(Layer::new(name, estimator, options));
        Ok(self)
    }

    /// Register a covariate updater at `anchor`
    pub fn register_updater<F>(mut self, label: &str, transform: F, anchor: Anchor) -> Result<Self>
    where
        F: Fn(Dataset) -> Dataset + Send + Sync + 'static,
    {
        if let Anchor::AfterLayer(layer) = &anchor {
            if self.layer(layer).is_none() {
                return Err(Error::configuration(format!(
                    "updater '{}' is anchored after unknown layer '{}'",
                    label, layer
                )));
            }
        }
        self.updaters.register(Updater::new(label, Arc::new(transform), anchor));
        Ok(self)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name() == name)
    }

    pub fn updaters(&self) -> &UpdaterRegistry {
        &self.updaters
    }

    pub fn training_data(&self) -> &Dataset {
        &self.training_data
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    pub fn fitted_layer(&self, name: &str) -> Option<&FittedLayer> {
        self.fitted.as_ref()?.iter().find(|f| f.layer() == name)
    }

    /// Expected value of every layer, written in layer order
    ///
    /// Layer columns missing from `data` are added first. Later layers see
    /// the expected values of earlier ones.
    pub fn predict(&self, data: &Dataset) -> Result<Dataset> {
        let pairs = self.fitted_pairs()?;
        let mut out = data.clone();
        for layer in &self.layers {
            out.add_column(layer.name(), Value::Number(0.0));
        }
        for (layer, fitted) in pairs {
            out = layer.generate(Some(fitted), out, &mut Draw::Expected)?.0;
        }
        Ok(out)
    }

    /// Simulate `n_replicates` paths with the default configuration
    pub fn simulate<P>(&self, n_replicates: u32, continuation: P, initial_data: &Dataset) -> Result<Dataset>
    where
        P: Fn(&Record) -> bool + Sync,
    {
        self.simulate_with(&SimulationConfig::default(), n_replicates, continuation, initial_data)
    }

    /// Simulate with an explicit configuration
    pub fn simulate_with<P>(
        &self,
        config: &SimulationConfig,
        n_replicates: u32,
        continuation: P,
        initial_data: &Dataset,
    ) -> Result<Dataset>
    where
        P: Fn(&Record) -> bool + Sync,
    {
        let report = Simulator::new(self, config.clone()).run(n_replicates, continuation, initial_data)?;
        Ok(report.dataset)
    }

    pub(crate) fn fitted_pairs(&self) -> Result<Vec<(&Layer, &FittedLayer)>> {
        fitting::aligned(self)
    }
}
