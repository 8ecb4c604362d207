use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glob::glob;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::DataSetSource;
use crate::data::{DataSink, SinkSpec, SourceSpec};
use crate::data::source::with_path;
use crate::error::{PypeError, Result};
use crate::evaluate::{Evaluator, MetricGate};
use crate::experiment::{Experiment, ExperimentBuilder};
use crate::model::Model;
use crate::pipeline::{Node, ParameterTree, Pipe, Pipeline};
use crate::registry::{Parameters, Registry};
use crate::serialiser::SerialiserKind;

pub const RECIPE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub version: u32,
    pub name: String,
    pub output: OutputSpec,
    /// Dataset name (`train`, `test`, ...) to the sources of its keys.
    pub data: BTreeMap<String, BTreeMap<String, SourceSpec>>,
    #[serde(default)]
    pub pipeline: Vec<NodeSpec>,
    pub model: ModelSpec,
    #[serde(default)]
    pub evaluation: EvaluationSpec,
    #[serde(default)]
    pub type_checking: TypeCheckingSpec,
    #[serde(default, skip_serializing_if = "ParameterTree::is_empty")]
    pub parameters: ParameterTree,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<MetricGate>,
    #[serde(default)]
    pub serialiser: SerialiserKind,
    /// Input or output name to the sink recording it while serving.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tracking: BTreeMap<String, SinkSpec>,
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| with_path(err, path))?;
        serde_yaml::from_str(&content).map_err(|err| {
            PypeError::config(format!(
                "Failed to parse recipe YAML {}: {err}",
                path.display()
            ))
        })
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Resolves `extra_files` glob patterns. Every pattern must match at
    /// least one file.
    pub fn expand_extra_files(&self, base_dir: Option<&Path>) -> Result<Vec<PathBuf>> {
        let mut resolved = Vec::new();
        for pattern in &self.extra_files {
            let full = resolve(Path::new(pattern), base_dir);
            let full = full.to_string_lossy();
            let matches = glob(&full)
                .map_err(|err| PypeError::config(format!("Invalid glob pattern {pattern}: {err}")))?;
            let mut found = false;
            for entry in matches {
                let path = entry.map_err(|err| PypeError::Io(err.into_error()))?;
                if path.is_file() {
                    resolved.push(path);
                    found = true;
                }
            }
            if !found {
                return Err(PypeError::config(format!(
                    "No extra files matched pattern: {pattern}"
                )));
            }
        }
        Ok(resolved)
    }

    pub fn build_pipeline(&self, registry: &Registry) -> Result<Pipeline> {
        let nodes = self
            .pipeline
            .iter()
            .map(|spec| spec.build(registry))
            .collect::<Result<Vec<_>>>()?;
        Pipeline::new(nodes)
    }

    pub fn build_model(&self, registry: &Registry) -> Result<Model> {
        Model::new(
            registry.estimators.factory(&self.model.estimator)?,
            self.model.hyperparameters.clone(),
            self.model.inputs.clone(),
            self.model.outputs.clone(),
            self.model.seed,
        )
    }

    pub fn build_sources(&self, base_dir: Option<&Path>) -> BTreeMap<String, DataSetSource> {
        self.data
            .iter()
            .map(|(name, keys)| {
                let mut source = DataSetSource::new();
                for (key, spec) in keys {
                    source.insert(key.clone(), spec.build(base_dir));
                }
                (name.clone(), source)
            })
            .collect()
    }

    pub fn build_tracking(
        &self,
        base_dir: Option<&Path>,
    ) -> BTreeMap<String, Arc<dyn DataSink>> {
        self.tracking
            .iter()
            .map(|(name, spec)| (name.clone(), Arc::from(spec.build(base_dir))))
            .collect()
    }

    pub fn output_folder(&self, base_dir: Option<&Path>) -> PathBuf {
        resolve(&self.output.directory, base_dir)
    }
}

/// Builds a runnable experiment. `overrides` win over the recipe's own
/// `parameters`.
pub fn build_experiment(
    recipe: &Recipe,
    base_dir: Option<&Path>,
    registry: &Registry,
    overrides: ParameterTree,
) -> Result<Experiment> {
    if recipe.version != RECIPE_VERSION {
        return Err(PypeError::config(format!(
            "Unsupported recipe version {}; expected {RECIPE_VERSION}",
            recipe.version
        )));
    }
    let mut parameters = recipe.parameters.clone();
    parameters.merge(overrides);
    debug!(recipe = recipe.name.as_str(), ?parameters, "Building experiment");

    let mut builder = ExperimentBuilder::new(recipe.build_pipeline(registry)?, recipe.build_model(registry)?)
        .evaluator(Evaluator::from_names(&recipe.evaluation.metrics)?)
        .strict(recipe.type_checking.strict)
        .type_checkers(registry.type_checkers.clone())
        .output_folder(recipe.output_folder(base_dir))
        .serialiser(recipe.serialiser.build())
        .parameters(parameters)
        .extra_files(recipe.expand_extra_files(base_dir)?)
        .gates(recipe.gates.clone());
    if let Some(keys) = &recipe.type_checking.inputs {
        builder = builder.input_keys(keys.clone());
    }
    for (name, source) in recipe.build_sources(base_dir) {
        builder = builder.data_source(name, source);
    }
    builder.build()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeSpec {
    Pipeline(PipelineSpec),
    Pipe(PipeSpec),
}

impl NodeSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::Pipeline(spec) => &spec.name,
            Self::Pipe(spec) => &spec.name,
        }
    }

    pub fn build(&self, registry: &Registry) -> Result<Node> {
        match self {
            Self::Pipe(spec) => {
                let outputs = if spec.outputs.is_empty() {
                    spec.inputs.clone()
                } else {
                    spec.outputs.clone()
                };
                let pipe = Pipe::from_registry(
                    &registry.operators,
                    spec.name.clone(),
                    &spec.operator,
                    spec.params.clone(),
                    spec.inputs.clone(),
                    outputs,
                )?
                .with_fit_inputs(spec.fit_inputs.clone())
                .skip_on_inference(spec.skip_on_inference);
                Ok(Node::Pipe(pipe))
            }
            Self::Pipeline(spec) => {
                let nodes = spec
                    .pipeline
                    .iter()
                    .map(|child| child.build(registry))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Node::Pipeline(Pipeline::named(spec.name.clone(), nodes)?))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    pub pipeline: Vec<NodeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeSpec {
    pub name: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Parameters::is_empty")]
    pub params: Parameters,
    pub inputs: Vec<String>,
    /// Defaults to `inputs`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fit_inputs: Vec<String>,
    #[serde(default)]
    pub skip_on_inference: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub estimator: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub seed: u64,
    #[serde(default, skip_serializing_if = "Parameters::is_empty")]
    pub hyperparameters: Parameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSpec {
    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,
}

impl Default for EvaluationSpec {
    fn default() -> Self {
        Self {
            metrics: default_metrics(),
        }
    }
}

fn default_metrics() -> Vec<String> {
    vec!["mse".to_string(), "mae".to_string()]
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeCheckingSpec {
    /// Request keys; defaults to every `train` key the model does not predict.
    #[serde(default)]
    pub inputs: Option<Vec<String>>,
    #[serde(default)]
    pub strict: bool,
}

fn resolve(path: &Path, base_dir: Option<&Path>) -> PathBuf {
    match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const RECIPE: &str = r#"
version: 1
name: nested
output:
  directory: out
data:
  train:
    x:
      type: inline
      data: {a: [1.0, 2.0, 3.0], b: [2.0, 4.0, 6.0]}
    y:
      type: inline
      data: [1.0, 2.0, 3.0]
pipeline:
  - name: scale
    operator: standard_scaler
    inputs: [x]
  - name: inner
    pipeline:
      - name: keep
        operator: select_columns
        params: {columns: [a]}
        inputs: [x]
model:
  estimator: mean
  inputs: [x]
  outputs: [y]
parameters:
  model:
    a: 2.0
tracking:
  x:
    type: json_lines
    path: logs/x.jsonl
"#;

    #[test]
    fn recipe_nodes_build_a_nested_pipeline() {
        let recipe: Recipe = serde_yaml::from_str(RECIPE).unwrap();
        assert!(matches!(&recipe.pipeline[1], NodeSpec::Pipeline(spec) if spec.pipeline.len() == 1));
        assert_eq!(recipe.evaluation.metrics, vec!["mse", "mae"]);

        let pipeline = recipe.build_pipeline(&Registry::with_defaults()).unwrap();
        assert_eq!(pipeline.pipe_paths(), vec!["scale", "inner__keep"]);
        let scale = pipeline.find_pipe(&["scale"]).unwrap();
        assert_eq!(scale.outputs(), ["x".to_string()]);
    }

    #[test]
    fn unknown_operator_fails_to_build() {
        let recipe: Recipe =
            serde_yaml::from_str(&RECIPE.replace("standard_scaler", "pca")).unwrap();
        assert!(recipe.build_pipeline(&Registry::with_defaults()).is_err());
    }

    #[test]
    fn extra_file_patterns_must_match() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("notes.md"), "notes").unwrap();
        let mut recipe: Recipe = serde_yaml::from_str(RECIPE).unwrap();
        recipe.extra_files = vec!["*.md".to_string()];
        assert_eq!(
            recipe.expand_extra_files(Some(temp.path())).unwrap(),
            vec![temp.path().join("notes.md")]
        );
        recipe.extra_files = vec!["*.csv".to_string()];
        assert!(recipe.expand_extra_files(Some(temp.path())).is_err());
    }

    #[test]
    fn overrides_win_over_recipe_parameters() {
        let temp = tempdir().unwrap();
        let recipe: Recipe = serde_yaml::from_str(RECIPE).unwrap();
        let overrides = ParameterTree::from_flat([("model__a", serde_json::json!(5.0))]).unwrap();
        let experiment =
            build_experiment(&recipe, Some(temp.path()), &Registry::with_defaults(), overrides)
                .unwrap();
        assert_eq!(experiment.model().hyperparameters()["a"], 5.0);
        assert_eq!(experiment.output_folder(), temp.path().join("out"));
    }

    #[test]
    fn tracking_sinks_resolve_against_the_recipe_folder() {
        let temp = tempdir().unwrap();
        let recipe: Recipe = serde_yaml::from_str(RECIPE).unwrap();
        let sinks = recipe.build_tracking(Some(temp.path()));
        assert_eq!(sinks.keys().collect::<Vec<_>>(), vec!["x"]);

        let data = crate::data::Data::Array(crate::data::Column::Float(vec![1.5]));
        sinks["x"].write(&data).unwrap();
        sinks["x"].write(&data).unwrap();
        let written = fs::read_to_string(temp.path().join("logs/x.jsonl")).unwrap();
        assert_eq!(written, "[1.5]\n[1.5]\n");
    }

    #[test]
    fn version_is_checked() {
        let mut recipe: Recipe = serde_yaml::from_str(RECIPE).unwrap();
        recipe.version = 2;
        let err = build_experiment(&recipe, None, &Registry::with_defaults(), ParameterTree::new())
            .unwrap_err();
        assert!(matches!(err, PypeError::Configuration(msg) if msg.contains("version")));
    }
}
