//! Estimator wrapper with explicit seeding and persistence.

use std::fmt;
use std::path::Path;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::data::{Data, DataSet};
use crate::error::{PypeError, Result};
use crate::registry::{EstimatorRegistry, Factory, Parameters};
use crate::serialiser::Serialiser;

pub mod estimators;

/// File holding the trained estimator state inside the model folder.
pub const STATE_FILE: &str = "state";

pub trait Estimator: Send + Sync + fmt::Debug {
    /// `inputs` and `targets` follow the model's input and output keys.
    fn fit(&mut self, inputs: &[&Data], targets: &[&Data], rng: &mut StdRng) -> Result<()>;

    /// Returns one value per output key.
    fn predict(&self, inputs: &[&Data]) -> Result<Vec<Data>>;

    fn state(&self) -> Result<Value>;

    fn restore(&mut self, state: Value) -> Result<()>;
}

/// Everything needed to construct an unfitted [`Model`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub kind: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub seed: u64,
    #[serde(default)]
    pub hyperparameters: Parameters,
}

#[derive(Debug)]
pub struct Model {
    inputs: Vec<String>,
    outputs: Vec<String>,
    seed: u64,
    hyperparameters: Parameters,
    factory: Factory<dyn Estimator>,
    estimator: Box<dyn Estimator>,
    fitted: bool,
}

impl Model {
    pub fn new(
        factory: Factory<dyn Estimator>,
        hyperparameters: Parameters,
        inputs: Vec<String>,
        outputs: Vec<String>,
        seed: u64,
    ) -> Result<Self> {
        if inputs.is_empty() || outputs.is_empty() {
            return Err(PypeError::config(format!(
                "model `{}` needs at least one input and one output",
                factory.kind()
            )));
        }
        let estimator = factory.create(hyperparameters.clone())?;
        Ok(Self {
            inputs,
            outputs,
            seed,
            hyperparameters,
            factory,
            estimator,
            fitted: false,
        })
    }

    pub fn from_manifest(manifest: ModelManifest, registry: &EstimatorRegistry) -> Result<Self> {
        Self::new(
            registry.factory(&manifest.kind)?,
            manifest.hyperparameters,
            manifest.inputs,
            manifest.outputs,
            manifest.seed,
        )
    }

    pub fn kind(&self) -> &str {
        self.factory.kind()
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn hyperparameters(&self) -> &Parameters {
        &self.hyperparameters
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted
    }

    pub fn manifest(&self) -> ModelManifest {
        ModelManifest {
            kind: self.kind().to_string(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            seed: self.seed,
            hyperparameters: self.hyperparameters.clone(),
        }
    }

    /// Fits a fresh estimator with an RNG seeded from `seed`, so repeated
    /// fits on the same data agree.
    #[instrument(skip_all, fields(model = %self.factory.kind(), seed = self.seed))]
    pub fn fit(&mut self, dataset: &DataSet) -> Result<()> {
        let inputs = dataset.get_all(&self.inputs)?;
        let targets = dataset.get_all(&self.outputs)?;
        let mut estimator = self.factory.create(self.hyperparameters.clone())?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        estimator.fit(&inputs, &targets, &mut rng)?;
        self.estimator = estimator;
        self.fitted = true;
        debug!("Model fitted");
        Ok(())
    }

    /// Returns a DataSet holding only the output keys.
    pub fn transform(&self, dataset: &DataSet) -> Result<DataSet> {
        if !self.fitted {
            return Err(PypeError::UnfittedOperator(self.kind().to_string()));
        }
        let inputs = dataset.get_all(&self.inputs)?;
        let predictions = self.estimator.predict(&inputs)?;
        let mut result = DataSet::new();
        result.set_all(&self.outputs, predictions)?;
        Ok(result)
    }

    /// Overlays `overrides` on the hyperparameters. The model must be
    /// fitted again afterwards.
    pub fn reinitialise(&mut self, overrides: &Parameters) -> Result<()> {
        let mut hyperparameters = self.hyperparameters.clone();
        for (key, value) in overrides {
            hyperparameters.insert(key.clone(), value.clone());
        }
        self.estimator = self.factory.create(hyperparameters.clone())?;
        self.hyperparameters = hyperparameters;
        self.fitted = false;
        Ok(())
    }

    /// Writes the trained state into `folder`. The manifest is persisted
    /// separately by the caller.
    pub fn save(&self, folder: &Path, serialiser: &dyn Serialiser) -> Result<()> {
        if !self.fitted {
            return Err(PypeError::UnfittedOperator(self.kind().to_string()));
        }
        serialiser.serialise(&self.estimator.state()?, &folder.join(STATE_FILE))
    }

    pub fn load(
        folder: &Path,
        manifest: ModelManifest,
        registry: &EstimatorRegistry,
        serialiser: &dyn Serialiser,
    ) -> Result<Self> {
        let mut model = Self::from_manifest(manifest, registry)?;
        let state = serialiser.deserialise(&folder.join(STATE_FILE))?;
        model.estimator.restore(state)?;
        model.fitted = true;
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Column;
    use crate::registry::Registry;
    use crate::serialiser::JsonSerialiser;
    use serde_json::json;
    use tempfile::tempdir;

    fn mean_model(a: f64) -> Model {
        let registry = Registry::with_defaults();
        let mut params = Parameters::new();
        params.insert("a".into(), json!(a));
        Model::new(
            registry.estimators.factory("mean").unwrap(),
            params,
            vec!["x".into()],
            vec!["y".into()],
            7,
        )
        .unwrap()
    }

    fn train() -> DataSet {
        let mut dataset = DataSet::new();
        dataset.insert("x", Column::Float(vec![0.0, 1.0, 2.0]));
        dataset.insert("y", Column::Float(vec![1.0, 2.0, 3.0]));
        dataset
    }

    #[test]
    fn unfitted_model_refuses_to_predict() {
        let err = mean_model(0.0).transform(&train()).unwrap_err();
        assert!(matches!(err, PypeError::UnfittedOperator(kind) if kind == "mean"));
    }

    #[test]
    fn transform_returns_only_outputs() {
        let mut model = mean_model(1.0);
        model.fit(&train()).unwrap();
        let predicted = model.transform(&train()).unwrap();
        assert_eq!(predicted.keys().collect::<Vec<_>>(), vec!["y"]);
        assert_eq!(predicted.get("y"), Some(&Data::from(vec![3.0, 3.0, 3.0])));
    }

    #[test]
    fn saved_state_loads_through_manifest() {
        let temp = tempdir().unwrap();
        let mut model = mean_model(0.5);
        model.fit(&train()).unwrap();
        model.save(temp.path(), &JsonSerialiser).unwrap();

        let registry = Registry::with_defaults();
        let loaded = Model::load(
            temp.path(),
            model.manifest(),
            &registry.estimators,
            &JsonSerialiser,
        )
        .unwrap();
        assert_eq!(
            loaded.transform(&train()).unwrap(),
            model.transform(&train()).unwrap()
        );
    }
}
