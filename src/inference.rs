//! Prediction with a fitted pipeline and model, either straight from a
//! finished [`Experiment`] or reloaded from its artifact folder.

use std::path::Path;

use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::data::{DataSet, DataSetSource};
use crate::error::Result;
use crate::experiment::{
    Experiment, INPUT_TYPE_CHECKER_FILE, MODEL_CLASS_FILE, MODEL_FOLDER, OUTPUT_TYPE_CHECKER_FILE,
    PIPELINE_FILE,
};
use crate::model::{Model, ModelManifest};
use crate::pipeline::{Pipeline, PipelineArtifact};
use crate::registry::Registry;
use crate::serialiser::{Serialiser, SerialiserKind, deserialise_as};
use crate::type_checker::{DataSetSchema, TypeCheckerPipe};

/// One answered JSON prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonExchange {
    pub request: DataSet,
    pub predictions: DataSet,
    pub response: Value,
}

/// What `predict` accepts: data already in memory, or sources to read.
#[derive(Debug)]
pub enum InferenceInput {
    DataSet(DataSet),
    Source(DataSetSource),
}

impl From<DataSet> for InferenceInput {
    fn from(dataset: DataSet) -> Self {
        Self::DataSet(dataset)
    }
}

impl From<DataSetSource> for InferenceInput {
    fn from(source: DataSetSource) -> Self {
        Self::Source(source)
    }
}

#[derive(Debug)]
pub struct Inferencer {
    pipeline: Pipeline,
    model: Model,
    input_type_checker: TypeCheckerPipe,
    output_type_checker: TypeCheckerPipe,
    input_schema: DataSetSchema,
    output_schema: DataSetSchema,
}

impl Inferencer {
    /// Loads the artifacts of a finished run. The encoding is detected from
    /// the `model_class` file.
    pub fn from_folder(folder: &Path, registry: &Registry) -> Result<Self> {
        let kind = SerialiserKind::detect(&folder.join(MODEL_CLASS_FILE))?;
        Self::from_folder_with(folder, registry, kind.build().as_ref())
    }

    #[instrument(skip(registry, serialiser), fields(folder = %folder.display()))]
    pub fn from_folder_with(
        folder: &Path,
        registry: &Registry,
        serialiser: &dyn Serialiser,
    ) -> Result<Self> {
        let manifest: ModelManifest = deserialise_as(serialiser, &folder.join(MODEL_CLASS_FILE))?;
        let model = Model::load(
            &folder.join(MODEL_FOLDER),
            manifest,
            &registry.estimators,
            serialiser,
        )?;
        let artifact: PipelineArtifact = deserialise_as(serialiser, &folder.join(PIPELINE_FILE))?;
        let pipeline = Pipeline::from_artifact(artifact, &registry.operators)?;
        let input_type_checker = deserialise_as(serialiser, &folder.join(INPUT_TYPE_CHECKER_FILE))?;
        let output_type_checker =
            deserialise_as(serialiser, &folder.join(OUTPUT_TYPE_CHECKER_FILE))?;
        info!(model = model.kind(), pipes = pipeline.pipe_paths().len(), "Inferencer loaded");
        Self::from_parts(pipeline, model, input_type_checker, output_type_checker)
    }

    /// Takes the fitted components of a completed run.
    pub fn from_experiment(experiment: Experiment) -> Result<Self> {
        let (pipeline, model, input_type_checker, output_type_checker) =
            experiment.into_fitted_parts()?;
        Self::from_parts(pipeline, model, input_type_checker, output_type_checker)
    }

    fn from_parts(
        pipeline: Pipeline,
        model: Model,
        input_type_checker: TypeCheckerPipe,
        output_type_checker: TypeCheckerPipe,
    ) -> Result<Self> {
        let input_schema = input_type_checker.schema()?;
        let output_schema = output_type_checker.schema()?;
        Ok(Self {
            pipeline,
            model,
            input_type_checker,
            output_type_checker,
            input_schema,
            output_schema,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn input_schema(&self) -> &DataSetSchema {
        &self.input_schema
    }

    pub fn output_schema(&self) -> &DataSetSchema {
        &self.output_schema
    }

    /// Input checker, pipeline in inference mode, model, output checker.
    #[instrument(skip_all)]
    pub fn predict(&self, input: impl Into<InferenceInput>) -> Result<DataSet> {
        let dataset = match input.into() {
            InferenceInput::DataSet(dataset) => dataset,
            InferenceInput::Source(source) => source.read()?,
        };
        let checked = self.input_type_checker.transform(&dataset, true)?;
        let transformed = self.pipeline.transform(&checked, true)?;
        let predictions = self.model.transform(&transformed)?;
        let checked = self.output_type_checker.transform(&predictions, true)?;
        debug!(keys = ?checked.keys().collect::<Vec<_>>(), "Prediction complete");
        Ok(checked)
    }

    /// Parses `request` with the input schema, predicts and renders the
    /// response with the output schema.
    pub fn predict_json(&self, request: &Value) -> Result<Value> {
        Ok(self.exchange_json(request)?.response)
    }

    /// [`Inferencer::predict_json`], keeping the parsed request and the
    /// checked predictions alongside the response.
    pub fn exchange_json(&self, request: &Value) -> Result<JsonExchange> {
        let request = self.input_schema.parse(request)?.convert()?;
        let predictions = self.predict(request.clone())?;
        let response = self.output_schema.to_model(&predictions)?.to_json();
        Ok(JsonExchange {
            request,
            predictions,
            response,
        })
    }
}
