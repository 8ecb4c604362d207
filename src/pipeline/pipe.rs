use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{Level, debug};

use super::operator::Operator;
use crate::data::DataSet;
use crate::error::{PypeError, Result};
use crate::registry::{Factory, OperatorRegistry, Parameters};

/// Binds one operator to named inputs and outputs of a DataSet.
#[derive(Debug)]
pub struct Pipe {
    name: String,
    factory: Factory<dyn Operator>,
    params: Parameters,
    operator: Box<dyn Operator>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    fit_inputs: Vec<String>,
    skip_on_inference: bool,
    fitted: bool,
}

impl Pipe {
    pub fn new(
        name: impl Into<String>,
        factory: Factory<dyn Operator>,
        params: Parameters,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(PypeError::config("pipe name cannot be empty"));
        }
        if name.contains(super::params::SEPARATOR) {
            return Err(PypeError::config(format!(
                "pipe name `{name}` cannot contain `{}`",
                super::params::SEPARATOR
            )));
        }
        if inputs.is_empty() {
            return Err(PypeError::config(format!(
                "pipe `{name}` needs at least one input"
            )));
        }
        let operator = factory.create(params.clone()).map_err(|err| {
            PypeError::config(format!("pipe `{name}` ({}): {err}", factory.kind()))
        })?;
        Ok(Self {
            name,
            factory,
            params,
            operator,
            inputs,
            outputs,
            fit_inputs: Vec::new(),
            skip_on_inference: false,
            fitted: false,
        })
    }

    pub fn from_registry(
        registry: &OperatorRegistry,
        name: impl Into<String>,
        kind: &str,
        params: Parameters,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Result<Self> {
        Self::new(name, registry.factory(kind)?, params, inputs, outputs)
    }

    /// Keys handed to `fit` after the inputs, never to `transform`.
    pub fn with_fit_inputs(mut self, keys: Vec<String>) -> Self {
        self.fit_inputs = keys;
        self
    }

    /// Bypass this pipe when transforming at inference time.
    pub fn skip_on_inference(mut self, skip: bool) -> Self {
        self.skip_on_inference = skip;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        self.factory.kind()
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn fit_inputs(&self) -> &[String] {
        &self.fit_inputs
    }

    pub fn skips_on_inference(&self) -> bool {
        self.skip_on_inference
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted
    }

    pub fn fit(&mut self, dataset: &DataSet) -> Result<()> {
        let span = tracing::span!(Level::DEBUG, "pipe.fit", pipe = self.name.as_str());
        let _guard = span.enter();
        let mut keys = self.inputs.clone();
        keys.extend(self.fit_inputs.iter().cloned());
        let values = dataset.get_all(&keys)?;
        self.operator.fit(&values)?;
        self.fitted = true;
        debug!(operator = self.kind(), "Pipe fitted");
        Ok(())
    }

    /// Returns a copy of `dataset` with this pipe's outputs written into it.
    pub fn transform(&self, dataset: &DataSet, is_inference: bool) -> Result<DataSet> {
        if is_inference && self.skip_on_inference {
            debug!(pipe = self.name.as_str(), "Skipping pipe at inference");
            return Ok(dataset.clone());
        }
        if !self.fitted {
            return Err(PypeError::UnfittedOperator(self.name.clone()));
        }
        let span = tracing::span!(Level::DEBUG, "pipe.transform", pipe = self.name.as_str());
        let _guard = span.enter();
        let values = dataset.get_all(&self.inputs)?;
        let produced = self.operator.transform(&values)?;
        let mut result = dataset.clone();
        result.set_all(&self.outputs, produced)?;
        Ok(result)
    }

    /// Rebuilds the operator with `overrides` laid over the current
    /// parameters. The pipe must be fitted again afterwards.
    pub fn reinitialise(&mut self, overrides: &Parameters) -> Result<()> {
        let mut params = self.params.clone();
        for (key, value) in overrides {
            params.insert(key.clone(), value.clone());
        }
        self.operator = self.factory.create(params.clone()).map_err(|err| {
            PypeError::config(format!("pipe `{}` ({}): {err}", self.name, self.kind()))
        })?;
        self.params = params;
        self.fitted = false;
        debug!(pipe = self.name.as_str(), "Pipe reinitialised");
        Ok(())
    }

    pub fn to_artifact(&self) -> Result<PipeArtifact> {
        Ok(PipeArtifact {
            name: self.name.clone(),
            operator: self.kind().to_string(),
            params: self.params.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            fit_inputs: self.fit_inputs.clone(),
            skip_on_inference: self.skip_on_inference,
            fitted: self.fitted,
            state: if self.fitted {
                self.operator.state()?
            } else {
                Value::Null
            },
        })
    }

    pub fn from_artifact(artifact: PipeArtifact, registry: &OperatorRegistry) -> Result<Self> {
        let mut pipe = Self::from_registry(
            registry,
            artifact.name,
            &artifact.operator,
            artifact.params,
            artifact.inputs,
            artifact.outputs,
        )?
        .with_fit_inputs(artifact.fit_inputs)
        .skip_on_inference(artifact.skip_on_inference);
        if artifact.fitted {
            pipe.operator.restore(artifact.state)?;
            pipe.fitted = true;
        }
        Ok(pipe)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeArtifact {
    pub name: String,
    pub operator: String,
    #[serde(default)]
    pub params: Parameters,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fit_inputs: Vec<String>,
    #[serde(default)]
    pub skip_on_inference: bool,
    #[serde(default)]
    pub fitted: bool,
    #[serde(default)]
    pub state: Value,
}
