use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};

use crate::data::SourceSpec;
use crate::data::source::with_path;
use crate::error::{PypeError, Result};
use crate::evaluate::MetricGate;
use crate::pipeline::ParameterTree;
use crate::recipe::{
    EvaluationSpec, ModelSpec, NodeSpec, OutputSpec, PipeSpec, RECIPE_VERSION, Recipe,
    TypeCheckingSpec,
};
use crate::registry::Parameters;
use crate::serialiser::SerialiserKind;

pub const PRESETS: &[&str] = &["baseline", "regression", "classification"];

pub fn preset(name: &str) -> Result<Recipe> {
    match name {
        "baseline" => Ok(baseline_preset()),
        "regression" => Ok(regression_preset()),
        "classification" => Ok(classification_preset()),
        other => Err(PypeError::config(format!(
            "Unknown preset '{other}'. Available: {}",
            PRESETS.join(", ")
        ))),
    }
}

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let rendered = preset(name)?.to_yaml()?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|err| with_path(err, parent))?;
    }
    fs::write(destination, rendered).map_err(|err| with_path(err, destination))?;

    Ok(destination.to_path_buf())
}

fn baseline_preset() -> Recipe {
    Recipe {
        version: RECIPE_VERSION,
        name: "baseline".into(),
        output: output("./runs/baseline"),
        data: splits(&["x", "y"]),
        pipeline: Vec::new(),
        model: ModelSpec {
            estimator: "mean".into(),
            inputs: vec!["x".into()],
            outputs: vec!["y".into()],
            seed: 0,
            hyperparameters: params(&[("a", json!(0.0))]),
        },
        evaluation: EvaluationSpec::default(),
        type_checking: TypeCheckingSpec::default(),
        parameters: ParameterTree::new(),
        extra_files: Vec::new(),
        gates: Vec::new(),
        serialiser: SerialiserKind::Json,
        tracking: BTreeMap::new(),
    }
}

fn regression_preset() -> Recipe {
    Recipe {
        version: RECIPE_VERSION,
        name: "regression".into(),
        output: output("./runs/regression"),
        data: splits(&["x", "y"]),
        pipeline: vec![pipe("scale", "standard_scaler", Parameters::new(), "x", "features")],
        model: ModelSpec {
            estimator: "linear_regression".into(),
            inputs: vec!["features".into()],
            outputs: vec!["y".into()],
            seed: 42,
            hyperparameters: params(&[
                ("learning_rate", json!(0.05)),
                ("epochs", json!(200)),
                ("batch_size", json!(16)),
            ]),
        },
        evaluation: EvaluationSpec {
            metrics: vec!["mse".into(), "mae".into(), "r2".into()],
        },
        type_checking: TypeCheckingSpec::default(),
        parameters: ParameterTree::new(),
        extra_files: Vec::new(),
        gates: vec![MetricGate {
            label: Some("regression-quality".into()),
            dataset: "test".into(),
            metric: "r2".into(),
            min: Some(0.5),
            max: None,
        }],
        serialiser: SerialiserKind::Json,
        tracking: BTreeMap::new(),
    }
}

fn classification_preset() -> Recipe {
    Recipe {
        version: RECIPE_VERSION,
        name: "classification".into(),
        output: output("./runs/classification"),
        data: splits(&["x", "label"]),
        pipeline: vec![pipe(
            "encode",
            "one_hot_encoder",
            params(&[("column", json!("category"))]),
            "x",
            "features",
        )],
        model: ModelSpec {
            estimator: "majority_class".into(),
            inputs: vec!["features".into()],
            outputs: vec!["label".into()],
            seed: 0,
            hyperparameters: Parameters::new(),
        },
        evaluation: EvaluationSpec {
            metrics: vec!["accuracy".into()],
        },
        type_checking: TypeCheckingSpec {
            inputs: None,
            strict: true,
        },
        parameters: ParameterTree::new(),
        extra_files: Vec::new(),
        gates: Vec::new(),
        serialiser: SerialiserKind::Yaml,
        tracking: BTreeMap::new(),
    }
}

fn output(directory: &str) -> OutputSpec {
    OutputSpec {
        directory: PathBuf::from(directory),
    }
}

/// `train` and `test` splits reading `data/{split}_{key}.json`.
fn splits(keys: &[&str]) -> BTreeMap<String, BTreeMap<String, SourceSpec>> {
    ["train", "test"]
        .iter()
        .map(|split| {
            let sources = keys
                .iter()
                .map(|key| {
                    let spec = SourceSpec::Json {
                        path: PathBuf::from(format!("data/{split}_{key}.json")),
                    };
                    (key.to_string(), spec)
                })
                .collect();
            (split.to_string(), sources)
        })
        .collect()
}

fn pipe(name: &str, operator: &str, params: Parameters, input: &str, output: &str) -> NodeSpec {
    NodeSpec::Pipe(PipeSpec {
        name: name.into(),
        operator: operator.into(),
        params,
        inputs: vec![input.into()],
        outputs: vec![output.into()],
        fit_inputs: Vec::new(),
        skip_on_inference: false,
    })
}

fn params(entries: &[(&str, Value)]) -> Parameters {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}
