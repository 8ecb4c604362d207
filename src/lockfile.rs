use std::fs::File;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::data::source::with_path;
use crate::error::Result;
use crate::experiment::{MODEL_PARAMS, PIPELINE_PARAMS};
use crate::pipeline::{Pipe, PipelineVisitor, SEPARATOR};
use crate::recipe::Recipe;
use crate::registry::{Parameters, Registry};

/// Effective configuration of a recipe after parameter overrides, with a
/// digest per pipe so two runs can be compared without diffing YAML.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExperimentLock {
    pub recipe_version: u32,
    pub name: String,
    pub generated_at: DateTime<Utc>,
    pub data: Vec<String>,
    pub output: String,
    pub pipes: Vec<PipeLock>,
    pub model: ModelLock,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PipeLock {
    pub path: String,
    pub operator: String,
    pub params_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelLock {
    pub estimator: String,
    pub seed: u64,
    pub params_hash: String,
}

pub fn build_lock(recipe: &Recipe, registry: &Registry) -> Result<ExperimentLock> {
    let mut pipeline = recipe.build_pipeline(registry)?;
    if let Some(params) = recipe.parameters.child(PIPELINE_PARAMS) {
        pipeline.reinitialise(params)?;
    }
    let mut model = recipe.build_model(registry)?;
    if let Some(params) = recipe.parameters.child(MODEL_PARAMS) {
        model.reinitialise(&params.arguments())?;
    }

    let mut collector = PipeHashes::default();
    pipeline.walk(&mut collector);
    let pipes = collector.finish()?;

    let data = recipe
        .data
        .iter()
        .flat_map(|(name, keys)| keys.keys().map(move |key| format!("{name}.{key}")))
        .collect();

    Ok(ExperimentLock {
        recipe_version: recipe.version,
        name: recipe.name.clone(),
        generated_at: Utc::now(),
        data,
        output: recipe.output.directory.to_string_lossy().to_string(),
        pipes,
        model: ModelLock {
            estimator: model.kind().to_string(),
            seed: model.seed(),
            params_hash: hash_params(model.kind(), model.hyperparameters())?,
        },
    })
}

pub fn generate_lock(recipe: &Recipe, registry: &Registry, path: &Path) -> Result<ExperimentLock> {
    let lock = build_lock(recipe, registry)?;
    let file = File::create(path).map_err(|err| with_path(err, path))?;
    serde_yaml::to_writer(file, &lock)?;
    Ok(lock)
}

#[derive(Default)]
struct PipeHashes {
    pipes: Vec<PipeLock>,
    error: Option<serde_json::Error>,
}

impl PipeHashes {
    fn finish(self) -> Result<Vec<PipeLock>> {
        match self.error {
            Some(err) => Err(err.into()),
            None => Ok(self.pipes),
        }
    }
}

impl PipelineVisitor for PipeHashes {
    fn visit_pipe(&mut self, path: &[String], pipe: &Pipe) {
        match hash_params(pipe.kind(), pipe.params()) {
            Ok(params_hash) => self.pipes.push(PipeLock {
                path: path.join(SEPARATOR),
                operator: pipe.kind().to_string(),
                params_hash,
            }),
            Err(err) => {
                self.error.get_or_insert(err);
            }
        }
    }
}

fn hash_params(kind: &str, params: &Parameters) -> serde_json::Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(serde_json::to_vec(params)?);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ParameterTree;
    use serde_json::json;

    const RECIPE: &str = r#"
version: 1
name: lock
output: {directory: out}
data:
  train:
    x: {type: inline, data: [1.0, 2.0]}
    y: {type: inline, data: [1.0, 2.0]}
pipeline:
  - name: scale
    operator: standard_scaler
    inputs: [x]
model:
  estimator: mean
  inputs: [x]
  outputs: [y]
  seed: 7
"#;

    #[test]
    fn lock_hash_follows_parameter_overrides() {
        let registry = Registry::with_defaults();
        let mut recipe: Recipe = serde_yaml::from_str(RECIPE).unwrap();
        let plain = build_lock(&recipe, &registry).unwrap();
        assert_eq!(plain.pipes.len(), 1);
        assert_eq!(plain.pipes[0].path, "scale");
        assert_eq!(plain.model.seed, 7);
        assert_eq!(plain.data, vec!["train.x", "train.y"]);

        recipe.parameters =
            ParameterTree::from_flat([("pipeline__scale__with_mean", json!(false))]).unwrap();
        let changed = build_lock(&recipe, &registry).unwrap();
        assert_ne!(plain.pipes[0].params_hash, changed.pipes[0].params_hash);
        assert_eq!(plain.model.params_hash, changed.model.params_hash);
    }
}
