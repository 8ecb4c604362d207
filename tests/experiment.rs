use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use pype::data::{Column, Data, DataSet, DataSetSource, InMemorySource};
use pype::error::SchemaViolation;
use pype::evaluate::{Evaluator, Metric, MetricGate};
use pype::experiment::{EXTRA_FILES_FILE, MODEL_CLASS_FILE, MODEL_FOLDER, PIPELINE_FILE};
use pype::logger::METRICS_FILE;
use pype::model::Estimator;
use pype::packaging::{DIGEST_FILE, REQUIREMENTS_FILE, verify_digests};
use pype::pipeline::ParameterTree;
use pype::registry::{Parameters, Registry};
use pype::serialiser::YamlSerialiser;
use pype::{Experiment, Inferencer, Model, Pipeline, PypeError};
use rand::rngs::StdRng;
use serde_json::{Value, json};
use tempfile::tempdir;

fn ints(values: impl IntoIterator<Item = i64>) -> InMemorySource {
    InMemorySource::new(Column::Int(values.into_iter().collect()))
}

fn mean_model(registry: &Registry, a: f64) -> Model {
    let mut params = Parameters::new();
    params.insert("a".into(), json!(a));
    Model::new(
        registry.estimators.factory("mean").unwrap(),
        params,
        vec!["x".into()],
        vec!["y".into()],
        0,
    )
    .unwrap()
}

fn experiment(folder: &Path, registry: &Registry, model: Model) -> pype::ExperimentBuilder {
    Experiment::builder(Pipeline::new(Vec::new()).unwrap(), model)
        .data_source(
            "train",
            DataSetSource::new().with("x", ints(0..10)).with("y", ints(0..10)),
        )
        .data_source(
            "test",
            DataSetSource::new().with("x", ints([10, 11])).with("y", ints([10, 11])),
        )
        .type_checkers(registry.type_checkers.clone())
        .output_folder(folder)
}

fn request(values: &[i64]) -> DataSet {
    let mut dataset = DataSet::new();
    dataset.insert("x", Column::Int(values.to_vec()));
    dataset
}

#[test]
fn mean_estimator_runs_end_to_end() {
    let temp = tempdir().unwrap();
    let registry = Registry::with_defaults();
    let mut run = experiment(temp.path(), &registry, mean_model(&registry, 3.0))
        .build()
        .unwrap();

    assert!(!run.is_completed());
    let metrics = run.run().unwrap();
    assert!(run.is_completed());
    assert!((metrics["test"]["mse"] - 9.25).abs() < 1e-9);
    assert!((metrics["train"]["mae"] - 3.4).abs() < 1e-9);

    let inferencer = Inferencer::from_experiment(run).unwrap();
    let predictions = inferencer.predict(request(&[10, 11])).unwrap();
    assert_eq!(
        predictions.get("y"),
        Some(&Data::Array(Column::Float(vec![7.5, 7.5])))
    );
}

#[test]
fn artifacts_reload_into_an_equivalent_inferencer() {
    let temp = tempdir().unwrap();
    let registry = Registry::with_defaults();
    let notes = temp.path().join("notes.txt");
    fs::write(&notes, "trained on integers").unwrap();
    let folder = temp.path().join("run");

    let mut run = experiment(&folder, &registry, mean_model(&registry, 3.0))
        .extra_files(vec![notes])
        .build()
        .unwrap();
    run.run().unwrap();

    for name in [
        MODEL_CLASS_FILE,
        PIPELINE_FILE,
        REQUIREMENTS_FILE,
        METRICS_FILE,
        DIGEST_FILE,
    ] {
        assert!(folder.join(name).is_file(), "missing {name}");
    }
    assert!(folder.join(MODEL_FOLDER).join("state").is_file());
    let listing: Value =
        serde_json::from_str(&fs::read_to_string(folder.join(EXTRA_FILES_FILE)).unwrap()).unwrap();
    assert_eq!(listing["paths"], json!(["extra_files/notes.txt"]));
    assert!(verify_digests(&folder).unwrap().is_empty());

    let in_memory = Inferencer::from_experiment(run).unwrap();
    let reloaded = Inferencer::from_folder(&folder, &registry).unwrap();
    assert_eq!(
        reloaded.predict(request(&[3, 4, 5])).unwrap(),
        in_memory.predict(request(&[3, 4, 5])).unwrap()
    );
    assert_eq!(reloaded.input_schema(), in_memory.input_schema());
}

#[test]
fn yaml_artifacts_are_detected_on_reload() {
    let temp = tempdir().unwrap();
    let registry = Registry::with_defaults();
    let mut run = experiment(temp.path(), &registry, mean_model(&registry, 0.0))
        .serialiser(Box::new(YamlSerialiser))
        .build()
        .unwrap();
    run.run().unwrap();

    let manifest = fs::read_to_string(temp.path().join(MODEL_CLASS_FILE)).unwrap();
    assert!(manifest.contains("kind: mean"));
    let reloaded = Inferencer::from_folder(temp.path(), &registry).unwrap();
    let response = reloaded.predict_json(&json!({"x": [1, 2]})).unwrap();
    assert_eq!(response, json!({"y": [4.5, 4.5]}));
}

#[test]
fn parameters_reconfigure_the_model_before_the_run() {
    let temp = tempdir().unwrap();
    let registry = Registry::with_defaults();
    let overrides = ParameterTree::from_flat([("model__a", json!(1.0))]).unwrap();
    let mut run = experiment(temp.path(), &registry, mean_model(&registry, 3.0))
        .parameters(overrides)
        .build()
        .unwrap();
    assert_eq!(run.model().hyperparameters()["a"], json!(1.0));
    run.run().unwrap();

    let logged: Value = serde_json::from_str(
        &fs::read_to_string(temp.path().join("parameters.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(logged, json!({"model__a": 1.0}));
}

#[test]
fn failing_gate_aborts_before_artifacts_are_written() {
    let temp = tempdir().unwrap();
    let registry = Registry::with_defaults();
    let gate = MetricGate {
        label: Some("tight".into()),
        dataset: "test".into(),
        metric: "mse".into(),
        min: None,
        max: Some(0.5),
    };
    let mut run = experiment(temp.path(), &registry, mean_model(&registry, 3.0))
        .evaluator(Evaluator::new(vec![Metric::Mse]))
        .gates(vec![gate])
        .build()
        .unwrap();

    let err = run.run().unwrap_err();
    assert!(matches!(err, PypeError::GateFailed { label, .. } if label == "tight"));
    let logged: Value =
        serde_json::from_str(&fs::read_to_string(temp.path().join(METRICS_FILE)).unwrap()).unwrap();
    assert!((logged["test"]["mse"].as_f64().unwrap() - 9.25).abs() < 1e-9);
    assert!(!temp.path().join(MODEL_FOLDER).exists());
    assert_eq!(run.collector().snapshot().gate_failures, 1);
    assert!(Inferencer::from_experiment(run).is_err());
}

#[test]
fn experiments_need_a_train_source() {
    let temp = tempdir().unwrap();
    let registry = Registry::with_defaults();
    let err = Experiment::builder(Pipeline::new(Vec::new()).unwrap(), mean_model(&registry, 0.0))
        .data_source("test", DataSetSource::new().with("x", ints([1])))
        .output_folder(temp.path())
        .build()
        .unwrap_err();
    assert!(matches!(err, PypeError::Configuration(msg) if msg.contains("train")));
}

static SPY_PREDICTIONS: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug)]
struct Spy;

impl Estimator for Spy {
    fn fit(&mut self, _inputs: &[&Data], _targets: &[&Data], _rng: &mut StdRng) -> pype::Result<()> {
        Ok(())
    }

    fn predict(&self, inputs: &[&Data]) -> pype::Result<Vec<Data>> {
        SPY_PREDICTIONS.fetch_add(1, Ordering::SeqCst);
        let rows = inputs[0].n_rows().unwrap_or(0);
        Ok(vec![Data::Array(Column::Float(vec![0.0; rows]))])
    }

    fn state(&self) -> pype::Result<Value> {
        Ok(Value::Null)
    }

    fn restore(&mut self, _state: Value) -> pype::Result<()> {
        Ok(())
    }
}

#[test]
fn invalid_requests_never_reach_the_model() {
    let temp = tempdir().unwrap();
    let mut registry = Registry::with_defaults();
    registry.estimators.register("spy", |_| Ok(Box::new(Spy)));
    let model = Model::new(
        registry.estimators.factory("spy").unwrap(),
        Parameters::new(),
        vec!["x".into()],
        vec!["y".into()],
        0,
    )
    .unwrap();
    let mut run = experiment(temp.path(), &registry, model).build().unwrap();
    run.run().unwrap();
    let inferencer = Inferencer::from_experiment(run).unwrap();

    let before = SPY_PREDICTIONS.load(Ordering::SeqCst);
    let err = inferencer.predict_json(&json!({"other": [1, 2]})).unwrap_err();
    assert!(err.is_schema_violation(), "{err}");
    let err = inferencer.predict_json(&json!({"x": ["a", "b"]})).unwrap_err();
    assert!(err.is_schema_violation(), "{err}");
    assert_eq!(SPY_PREDICTIONS.load(Ordering::SeqCst), before);

    inferencer.predict_json(&json!({"x": [1, 2]})).unwrap();
    assert_eq!(SPY_PREDICTIONS.load(Ordering::SeqCst), before + 1);
}

#[test]
fn strict_runs_reject_unknown_keys_on_both_request_paths() {
    let temp = tempdir().unwrap();
    let registry = Registry::with_defaults();
    let mut run = experiment(temp.path(), &registry, mean_model(&registry, 0.0))
        .strict(true)
        .build()
        .unwrap();
    run.run().unwrap();
    let inferencer = Inferencer::from_experiment(run).unwrap();

    let mut typed = request(&[1]);
    typed.insert("z", Column::Int(vec![5]));
    let err = inferencer.predict(typed).unwrap_err();
    assert!(matches!(
        err,
        PypeError::SchemaValidation(SchemaViolation::UnexpectedField { ref field }) if field == "z"
    ));
    let err = inferencer.predict_json(&json!({"x": [1], "z": [5]})).unwrap_err();
    assert!(err.is_schema_violation(), "{err}");
}

#[test]
fn lenient_runs_drop_unknown_keys_on_both_request_paths() {
    let temp = tempdir().unwrap();
    let registry = Registry::with_defaults();
    let mut run = experiment(temp.path(), &registry, mean_model(&registry, 0.0))
        .build()
        .unwrap();
    run.run().unwrap();
    let inferencer = Inferencer::from_experiment(run).unwrap();

    let mut typed = request(&[1]);
    typed.insert("z", Column::Int(vec![5]));
    let predictions = inferencer.predict(typed).unwrap();
    assert_eq!(predictions.keys().collect::<Vec<_>>(), vec!["y"]);
    let response = inferencer.predict_json(&json!({"x": [1], "z": [5]})).unwrap();
    assert_eq!(response, json!({"y": [4.5]}));
}

#[derive(Debug)]
struct NotANumber;

impl Estimator for NotANumber {
    fn fit(&mut self, _inputs: &[&Data], _targets: &[&Data], _rng: &mut StdRng) -> pype::Result<()> {
        Ok(())
    }

    fn predict(&self, inputs: &[&Data]) -> pype::Result<Vec<Data>> {
        let rows = inputs[0].n_rows().unwrap_or(0);
        Ok(vec![Data::Array(Column::Float(vec![f64::NAN; rows]))])
    }

    fn state(&self) -> pype::Result<Value> {
        Ok(Value::Null)
    }

    fn restore(&mut self, _state: Value) -> pype::Result<()> {
        Ok(())
    }
}

#[test]
fn nan_predictions_fail_loudly_at_the_json_boundary() {
    let temp = tempdir().unwrap();
    let mut registry = Registry::with_defaults();
    registry.estimators.register("nan", |_| Ok(Box::new(NotANumber)));
    let model = Model::new(
        registry.estimators.factory("nan").unwrap(),
        Parameters::new(),
        vec!["x".into()],
        vec!["y".into()],
        0,
    )
    .unwrap();
    let mut run = experiment(temp.path(), &registry, model)
        .evaluator(Evaluator::new(Vec::new()))
        .build()
        .unwrap();
    run.run().unwrap();
    let inferencer = Inferencer::from_experiment(run).unwrap();

    assert!(inferencer.predict(request(&[1])).is_ok());
    let err = inferencer.predict_json(&json!({"x": [1]})).unwrap_err();
    assert!(matches!(err, PypeError::Operator { ref operator, .. } if operator == "y"), "{err}");
}
