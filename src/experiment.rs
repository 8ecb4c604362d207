//! One orchestrated training run.
//!
//! [`Experiment::run`] reads every data source, fits the type checkers,
//! the pipeline and the model on `train`, scores every dataset, applies
//! metric gates and persists the artifacts that [`crate::Inferencer`]
//! reloads.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde_json::json;
use tracing::{info, instrument, warn};

use crate::data::DataSet;
use crate::data::DataSetSource;
use crate::data::source::with_path;
use crate::error::{PypeError, Result};
use crate::evaluate::{Evaluator, MetricGate, Metrics};
use crate::logger::{ExperimentLogger, LocalLogger, LoggerScope};
use crate::model::Model;
use crate::observability::{MetricsCollector, log_snapshot};
use crate::packaging::{self, REQUIREMENTS_FILE};
use crate::pipeline::{ParameterTree, Pipeline};
use crate::serialiser::{JsonSerialiser, Serialiser, serialise_as};
use crate::type_checker::{TypeCheckerPipe, TypeCheckerRegistry};

pub const TRAIN: &str = "train";
pub const MODEL_FOLDER: &str = "model";
pub const MODEL_CLASS_FILE: &str = "model_class";
pub const PIPELINE_FILE: &str = "pipeline";
pub const INPUT_TYPE_CHECKER_FILE: &str = "input_type_checker";
pub const OUTPUT_TYPE_CHECKER_FILE: &str = "output_type_checker";
pub const EXTRA_FILES_FILE: &str = "extra_files.json";

/// Parameter tree child holding model hyperparameters.
pub const MODEL_PARAMS: &str = "model";
/// Parameter tree child holding pipeline parameters.
pub const PIPELINE_PARAMS: &str = "pipeline";

#[derive(Debug)]
pub struct Experiment {
    data_sources: BTreeMap<String, DataSetSource>,
    pipeline: Pipeline,
    model: Model,
    evaluator: Evaluator,
    input_type_checker: TypeCheckerPipe,
    output_type_checker: TypeCheckerPipe,
    type_checkers: TypeCheckerRegistry,
    logger: Box<dyn ExperimentLogger>,
    serialiser: Box<dyn Serialiser>,
    parameters: ParameterTree,
    extra_files: Vec<PathBuf>,
    gates: Vec<MetricGate>,
    requirements: Vec<String>,
    collector: MetricsCollector,
    completed: bool,
}

impl Experiment {
    pub fn builder(pipeline: Pipeline, model: Model) -> ExperimentBuilder {
        ExperimentBuilder::new(pipeline, model)
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn input_type_checker(&self) -> &TypeCheckerPipe {
        &self.input_type_checker
    }

    pub fn output_type_checker(&self) -> &TypeCheckerPipe {
        &self.output_type_checker
    }

    pub fn parameters(&self) -> &ParameterTree {
        &self.parameters
    }

    pub fn output_folder(&self) -> &Path {
        self.logger.artifact_folder()
    }

    pub fn collector(&self) -> &MetricsCollector {
        &self.collector
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Replaces the lines written to `requirements.txt`.
    pub fn set_requirements(&mut self, lines: Vec<String>) {
        self.requirements = lines;
    }

    /// Runs the experiment once. Any failure aborts the run; the logger is
    /// closed either way.
    #[instrument(skip_all)]
    pub fn run(&mut self) -> Result<Metrics> {
        let started = Instant::now();
        let Self {
            data_sources,
            pipeline,
            model,
            evaluator,
            input_type_checker,
            output_type_checker,
            type_checkers,
            logger,
            serialiser,
            parameters,
            extra_files,
            gates,
            requirements,
            collector,
            completed,
        } = self;
        *completed = false;
        let folder = logger.artifact_folder().to_path_buf();
        let mut scope = LoggerScope::open(logger.as_mut())?;

        info!("Load data");
        let datasets = {
            let _timer = collector.start_stage("read");
            data_sources
                .iter()
                .map(|(name, source)| Ok((name.clone(), source.read()?)))
                .collect::<Result<BTreeMap<String, DataSet>>>()?
        };
        let train = datasets
            .get(TRAIN)
            .ok_or_else(|| PypeError::config("data sources must contain a 'train' entry"))?;

        info!("Fit input type checker");
        {
            let _timer = collector.start_stage("fit_type_checkers");
            input_type_checker.fit(train, type_checkers)?;
        }

        info!("Fit pipeline");
        {
            let _timer = collector.start_stage("fit_pipeline");
            pipeline.fit(train)?;
        }

        info!("Transform data");
        let transformed = {
            let _timer = collector.start_stage("transform");
            datasets
                .iter()
                .map(|(name, data)| Ok((name.clone(), pipeline.transform(data, false)?)))
                .collect::<Result<BTreeMap<String, DataSet>>>()?
        };
        let transformed_train = transformed
            .get(TRAIN)
            .ok_or_else(|| PypeError::config("data sources must contain a 'train' entry"))?;

        info!("Fit model");
        {
            let _timer = collector.start_stage("fit_model");
            model.fit(transformed_train)?;
            let predictions = model.transform(transformed_train)?;
            output_type_checker.fit(&predictions, type_checkers)?;
        }

        info!("Evaluate model");
        let mut metrics = Metrics::new();
        {
            let _timer = collector.start_stage("evaluate");
            for (name, data) in &transformed {
                metrics.insert(name.clone(), evaluator.evaluate(model, data)?);
            }
        }
        for (name, scores) in &metrics {
            scope.logger().log_metrics(name, scores)?;
        }
        for gate in gates.iter() {
            match gate.check(&metrics) {
                Ok(()) => collector.record_gate_pass(),
                Err(err) => {
                    collector.record_gate_failure();
                    warn!(gate = %gate.label(), error = %err, "Metric gate failed");
                    return Err(err);
                }
            }
        }

        info!("Log results: parameters, pipeline, model");
        {
            let _timer = collector.start_stage("persist");
            let logger = scope.logger();
            model.save(&folder.join(MODEL_FOLDER), &**serialiser)?;
            logger.log_artifact(
                MODEL_CLASS_FILE,
                &serde_json::to_value(model.manifest())?,
                &**serialiser,
            )?;
            logger.log_artifact(
                PIPELINE_FILE,
                &serde_json::to_value(pipeline.to_artifact()?)?,
                &**serialiser,
            )?;
            serialise_as(
                &**serialiser,
                &*input_type_checker,
                &folder.join(INPUT_TYPE_CHECKER_FILE),
            )?;
            serialise_as(
                &**serialiser,
                &*output_type_checker,
                &folder.join(OUTPUT_TYPE_CHECKER_FILE),
            )?;
            logger.log_parameters(&parameters.to_flat())?;
            packaging::write_requirements(requirements, &folder.join(REQUIREMENTS_FILE))?;

            let mut stored = Vec::with_capacity(extra_files.len());
            for extra in extra_files.iter() {
                stored.push(logger.log_file(extra)?);
            }
            let listing = folder.join(EXTRA_FILES_FILE);
            let rendered = serde_json::to_string_pretty(&json!({ "paths": stored }))?;
            fs::write(&listing, rendered).map_err(|err| with_path(err, &listing))?;
        }
        scope.finish()?;
        packaging::write_digests(&folder)?;

        collector.record_total_duration(started.elapsed());
        log_snapshot(&collector.snapshot());
        *completed = true;
        info!(folder = %folder.display(), "Done");
        Ok(metrics)
    }

    pub(crate) fn into_fitted_parts(self) -> Result<(Pipeline, Model, TypeCheckerPipe, TypeCheckerPipe)> {
        if !self.completed {
            return Err(PypeError::UnfittedOperator("experiment".to_string()));
        }
        Ok((
            self.pipeline,
            self.model,
            self.input_type_checker,
            self.output_type_checker,
        ))
    }
}

pub struct ExperimentBuilder {
    pipeline: Pipeline,
    model: Model,
    data_sources: BTreeMap<String, DataSetSource>,
    evaluator: Evaluator,
    input_keys: Option<Vec<String>>,
    strict: bool,
    type_checkers: TypeCheckerRegistry,
    logger: Option<Box<dyn ExperimentLogger>>,
    output_folder: Option<PathBuf>,
    serialiser: Box<dyn Serialiser>,
    parameters: ParameterTree,
    extra_files: Vec<PathBuf>,
    gates: Vec<MetricGate>,
    requirements: Vec<String>,
    collector: MetricsCollector,
}

impl ExperimentBuilder {
    pub fn new(pipeline: Pipeline, model: Model) -> Self {
        Self {
            pipeline,
            model,
            data_sources: BTreeMap::new(),
            evaluator: Evaluator::default(),
            input_keys: None,
            strict: false,
            type_checkers: TypeCheckerRegistry::with_defaults(),
            logger: None,
            output_folder: None,
            serialiser: Box::new(JsonSerialiser),
            parameters: ParameterTree::new(),
            extra_files: Vec::new(),
            gates: Vec::new(),
            requirements: vec![packaging::framework_requirement()],
            collector: MetricsCollector::new(),
        }
    }

    pub fn data_source(mut self, name: impl Into<String>, source: DataSetSource) -> Self {
        self.data_sources.insert(name.into(), source);
        self
    }

    pub fn evaluator(mut self, evaluator: Evaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Keys validated on incoming requests. Defaults to every `train` key
    /// the model does not predict.
    pub fn input_keys(mut self, keys: Vec<String>) -> Self {
        self.input_keys = Some(keys);
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn type_checkers(mut self, registry: TypeCheckerRegistry) -> Self {
        self.type_checkers = registry;
        self
    }

    pub fn logger(mut self, logger: Box<dyn ExperimentLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Logs locally into `folder` unless a logger is set explicitly.
    pub fn output_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.output_folder = Some(folder.into());
        self
    }

    pub fn serialiser(mut self, serialiser: Box<dyn Serialiser>) -> Self {
        self.serialiser = serialiser;
        self
    }

    /// Parameters applied before the run: `model` re-instantiates the model,
    /// `pipeline` re-instantiates the pipes. Also logged with the run.
    pub fn parameters(mut self, parameters: ParameterTree) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn extra_files(mut self, files: Vec<PathBuf>) -> Self {
        self.extra_files = files;
        self
    }

    pub fn gates(mut self, gates: Vec<MetricGate>) -> Self {
        self.gates = gates;
        self
    }

    pub fn requirements(mut self, lines: Vec<String>) -> Self {
        self.requirements = lines;
        self
    }

    pub fn collector(mut self, collector: MetricsCollector) -> Self {
        self.collector = collector;
        self
    }

    pub fn build(self) -> Result<Experiment> {
        let Self {
            mut pipeline,
            mut model,
            data_sources,
            evaluator,
            input_keys,
            strict,
            type_checkers,
            logger,
            output_folder,
            serialiser,
            parameters,
            extra_files,
            gates,
            requirements,
            collector,
        } = self;

        let train = data_sources
            .get(TRAIN)
            .ok_or_else(|| PypeError::config("data sources must contain a 'train' entry"))?;
        let input_keys = input_keys.unwrap_or_else(|| {
            train
                .keys()
                .filter(|key| !model.outputs().iter().any(|output| output == key))
                .map(str::to_string)
                .collect()
        });
        let logger = match (logger, output_folder) {
            (Some(logger), _) => logger,
            (None, Some(folder)) => Box::new(LocalLogger::new(folder)),
            (None, None) => {
                return Err(PypeError::config(
                    "an experiment needs an output folder or a logger",
                ));
            }
        };

        for (name, _) in parameters.children() {
            if name != MODEL_PARAMS && name != PIPELINE_PARAMS {
                warn!(path = name, "Parameter path addresses neither model nor pipeline");
            }
        }
        for arg in parameters.values().keys() {
            warn!(path = arg.as_str(), "Top-level parameter is ignored");
        }
        if let Some(model_params) = parameters.child(MODEL_PARAMS) {
            model.reinitialise(&model_params.arguments())?;
        }
        if let Some(pipeline_params) = parameters.child(PIPELINE_PARAMS) {
            for path in pipeline.unmatched_parameters(pipeline_params) {
                warn!(path = path.as_str(), "Pipeline parameter matches no pipe");
            }
            pipeline.reinitialise(pipeline_params)?;
        }

        let output_keys = model.outputs().to_vec();
        Ok(Experiment {
            data_sources,
            pipeline,
            model,
            evaluator,
            input_type_checker: TypeCheckerPipe::new("input", input_keys).strict(strict),
            output_type_checker: TypeCheckerPipe::new("output", output_keys).strict(strict),
            type_checkers,
            logger,
            serialiser,
            parameters,
            extra_files,
            gates,
            requirements,
            collector,
            completed: false,
        })
    }
}
