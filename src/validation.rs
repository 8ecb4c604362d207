use std::collections::BTreeSet;

use serde::Serialize;

use crate::evaluate::Metric;
use crate::experiment::{MODEL_PARAMS, PIPELINE_PARAMS, TRAIN};
use crate::recipe::{NodeSpec, RECIPE_VERSION, Recipe};
use crate::registry::Registry;

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_recipe(recipe: &Recipe, registry: &Registry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if recipe.version != RECIPE_VERSION {
        report
            .errors
            .push(format!("Unsupported recipe version: {}", recipe.version));
    }

    if recipe.output.directory.as_os_str().is_empty() {
        report
            .errors
            .push("Output directory cannot be empty".into());
    }

    for (idx, pattern) in recipe.extra_files.iter().enumerate() {
        if let Err(err) = glob::Pattern::new(pattern) {
            report.errors.push(format!(
                "Extra file pattern {} ('{}') is not a valid glob: {}",
                idx + 1,
                pattern,
                err
            ));
        }
    }

    let mut available: BTreeSet<String> = match recipe.data.get(TRAIN) {
        Some(keys) => keys.keys().cloned().collect(),
        None => {
            report
                .errors
                .push("Data must contain a 'train' dataset".into());
            BTreeSet::new()
        }
    };

    if recipe.pipeline.is_empty() {
        report
            .warnings
            .push("Pipeline is empty; the model sees raw data".into());
    }
    report.merge(validate_nodes(&recipe.pipeline, registry, &mut available, ""));

    report.merge(validate_model(recipe, registry, &available));
    report.merge(validate_evaluation(recipe));
    report.merge(validate_parameters(recipe, registry));

    report
}

fn validate_nodes(
    nodes: &[NodeSpec],
    registry: &Registry,
    available: &mut BTreeSet<String>,
    prefix: &str,
) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut seen = BTreeSet::new();
    for (idx, node) in nodes.iter().enumerate() {
        let label = format!("{prefix}{}", node.name());
        if !seen.insert(node.name()) {
            report
                .errors
                .push(format!("Node '{label}' appears twice in the same pipeline"));
        }
        match node {
            NodeSpec::Pipe(spec) => {
                if let Err(err) = registry.operators.create(&spec.operator, spec.params.clone()) {
                    report.errors.push(format!(
                        "Pipe {} ('{label}'): failed to instantiate operator: {err}",
                        idx + 1
                    ));
                }
                for key in spec.inputs.iter().chain(&spec.fit_inputs) {
                    if !available.contains(key) {
                        report.errors.push(format!(
                            "Pipe '{label}' reads '{key}', which no data source or earlier pipe provides"
                        ));
                    }
                }
                if spec.skip_on_inference
                    && (spec.outputs.is_empty() || spec.outputs == spec.inputs)
                {
                    report.warnings.push(format!(
                        "Pipe '{label}' is skipped at inference and rewrites its own inputs; \
                         training and serving will see different values"
                    ));
                }
                let outputs = if spec.outputs.is_empty() {
                    &spec.inputs
                } else {
                    &spec.outputs
                };
                available.extend(outputs.iter().cloned());
            }
            NodeSpec::Pipeline(spec) => {
                if spec.pipeline.is_empty() {
                    report
                        .warnings
                        .push(format!("Nested pipeline '{label}' is empty"));
                }
                report.merge(validate_nodes(
                    &spec.pipeline,
                    registry,
                    available,
                    &format!("{label}/"),
                ));
            }
        }
    }
    report
}

fn validate_model(recipe: &Recipe, registry: &Registry, available: &BTreeSet<String>) -> ValidationReport {
    let mut report = ValidationReport::default();
    let model = &recipe.model;
    if let Err(err) = registry
        .estimators
        .create(&model.estimator, model.hyperparameters.clone())
    {
        report
            .errors
            .push(format!("Failed to instantiate estimator: {err}"));
    }
    if model.inputs.is_empty() || model.outputs.is_empty() {
        report
            .errors
            .push("Model needs at least one input and one output".into());
    }
    for key in model.inputs.iter().chain(&model.outputs) {
        if !available.contains(key) {
            report.errors.push(format!(
                "Model key '{key}' is not provided by the train data or the pipeline"
            ));
        }
    }
    for (name, keys) in &recipe.data {
        if name == TRAIN {
            continue;
        }
        for output in &model.outputs {
            if !keys.contains_key(output) {
                report.warnings.push(format!(
                    "Dataset '{name}' has no '{output}' values; evaluating it will fail"
                ));
            }
        }
    }
    report
}

fn validate_evaluation(recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut metrics = BTreeSet::new();
    for name in &recipe.evaluation.metrics {
        match Metric::from_name(name) {
            Ok(metric) => {
                metrics.insert(metric.as_str());
            }
            Err(err) => report.errors.push(err.to_string()),
        }
    }
    for gate in &recipe.gates {
        if !recipe.data.contains_key(&gate.dataset) {
            report.errors.push(format!(
                "Gate '{}' checks unknown dataset '{}'",
                gate.label(),
                gate.dataset
            ));
        }
        if !metrics.contains(gate.metric.as_str()) {
            report.errors.push(format!(
                "Gate '{}' checks metric '{}', which is not evaluated",
                gate.label(),
                gate.metric
            ));
        }
        if gate.min.is_none() && gate.max.is_none() {
            report
                .warnings
                .push(format!("Gate '{}' has neither min nor max", gate.label()));
        }
    }
    report
}

fn validate_parameters(recipe: &Recipe, registry: &Registry) -> ValidationReport {
    let mut report = ValidationReport::default();
    for (name, _) in recipe.parameters.children() {
        if name != MODEL_PARAMS && name != PIPELINE_PARAMS {
            report.warnings.push(format!(
                "Parameters under '{name}' address neither model nor pipeline"
            ));
        }
    }
    if let Some(params) = recipe.parameters.child(PIPELINE_PARAMS)
        && let Ok(pipeline) = recipe.build_pipeline(registry)
    {
        for path in pipeline.unmatched_parameters(params) {
            report
                .warnings
                .push(format!("Pipeline parameter '{path}' matches no pipe"));
        }
    }
    report
}
