//! Fitting engine: drives every layer's estimator in declaration order

use log::info;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::layer::{FittedLayer, Layer};
use super::Model;
use crate::error::{Error, Result};
use crate::estimator::FormulaSpec;

/// Formula per layer name
pub type Formulas = BTreeMap<String, FormulaSpec>;

/// Build a [`Formulas`] map from `(layer, formula)` pairs
pub fn formulas<I, K, V>(pairs: I) -> Formulas
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), FormulaSpec::new(v)))
        .collect()
}

impl Model {
    /// Fit every layer in insertion order and return the fitted model
    ///
    /// All or nothing: the first failing layer aborts the call and `self`
    /// keeps whatever fitted state it had before.
    pub fn fit(&self, formulas: &Formulas) -> Result<Model> {
        check_formulas(&self.layers, formulas)?;

        let mut fitted = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let formula = &formulas[layer.name()];
            fitted.push(layer.fit(&self.training_data, formula)?);
        }

        info!(
            "Fitted {} layers on {} training rows",
            fitted.len(),
            self.training_data.len()
        );

        let mut model = self.clone();
        model.fitted = Some(Arc::new(fitted));
        Ok(model)
    }
}

fn check_formulas(layers: &[Layer], formulas: &Formulas) -> Result<()> {
    if layers.is_empty() {
        return Err(Error::configuration("model has no layers to fit"));
    }
    if let Some(layer) = layers.iter().find(|l| !formulas.contains_key(l.name())) {
        return Err(Error::configuration(format!("no formula given for layer '{}'", layer.name())));
    }
    if let Some(name) = formulas.keys().find(|k| !layers.iter().any(|l| l.name() == k.as_str())) {
        return Err(Error::configuration(format!("formula given for unknown layer '{}'", name)));
    }
    Ok(())
}

/// Fitted layers aligned with the model's layer order
pub(super) fn aligned<'a>(model: &'a Model) -> Result<Vec<(&'a Layer, &'a FittedLayer)>> {
    let fitted = match (&model.fitted, model.layers.first()) {
        (Some(fitted), _) => fitted,
        (None, Some(first)) => return Err(Error::LayerNotFitted { layer: first.name().to_string() }),
        (None, None) => return Err(Error::configuration("model has no layers")),
    };
    Ok(model.layers.iter().zip(fitted.iter()).collect())
}
