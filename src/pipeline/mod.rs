//! Tree-structured fit/transform pipelines.
//!
//! A [`Pipeline`] is an ordered list of [`Node`]s, each either a [`Pipe`]
//! (one operator bound to DataSet keys) or a nested pipeline. Fitting
//! always chains fit then transform through the nodes in declaration
//! order; transforming threads the `is_inference` flag to every node.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{Level, debug, instrument};

use crate::data::DataSet;
use crate::error::{PypeError, Result};
use crate::registry::OperatorRegistry;

pub mod operator;
pub mod params;
pub mod pipe;

pub use operator::Operator;
pub use params::{ParameterTree, SEPARATOR};
pub use pipe::{Pipe, PipeArtifact};

/// Name given to the outermost pipeline.
pub const ROOT_NAME: &str = "pipeline";

#[derive(Debug)]
pub enum Node {
    Pipe(Pipe),
    Pipeline(Pipeline),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Self::Pipe(pipe) => pipe.name(),
            Self::Pipeline(pipeline) => pipeline.name(),
        }
    }

    fn fit_transform(&mut self, dataset: &DataSet) -> Result<DataSet> {
        match self {
            Self::Pipe(pipe) => {
                pipe.fit(dataset)?;
                pipe.transform(dataset, false)
            }
            Self::Pipeline(pipeline) => pipeline.fit_transform(dataset),
        }
    }

    fn transform(&self, dataset: &DataSet, is_inference: bool) -> Result<DataSet> {
        match self {
            Self::Pipe(pipe) => pipe.transform(dataset, is_inference),
            Self::Pipeline(pipeline) => pipeline.transform(dataset, is_inference),
        }
    }

    fn reinitialise(&mut self, params: Option<&ParameterTree>) -> Result<()> {
        match self {
            Self::Pipe(pipe) => {
                pipe.reinitialise(&params.map(ParameterTree::arguments).unwrap_or_default())
            }
            Self::Pipeline(pipeline) => {
                let empty = ParameterTree::new();
                pipeline.reinitialise(params.unwrap_or(&empty))
            }
        }
    }

    fn to_artifact(&self) -> Result<NodeArtifact> {
        Ok(match self {
            Self::Pipe(pipe) => NodeArtifact::Pipe(pipe.to_artifact()?),
            Self::Pipeline(pipeline) => NodeArtifact::Pipeline(pipeline.to_artifact()?),
        })
    }
}

impl From<Pipe> for Node {
    fn from(pipe: Pipe) -> Self {
        Self::Pipe(pipe)
    }
}

impl From<Pipeline> for Node {
    fn from(pipeline: Pipeline) -> Self {
        Self::Pipeline(pipeline)
    }
}

/// Depth-first walk over a pipeline tree in declaration order.
///
/// `path` holds the node names from below the root down to the current
/// node, so the root pipeline is entered with an empty path.
pub trait PipelineVisitor {
    fn enter_pipeline(&mut self, _path: &[String], _pipeline: &Pipeline) {}

    fn visit_pipe(&mut self, path: &[String], pipe: &Pipe);

    fn leave_pipeline(&mut self, _path: &[String], _pipeline: &Pipeline) {}
}

#[derive(Debug)]
pub struct Pipeline {
    name: String,
    nodes: Vec<Node>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            name: ROOT_NAME.to_string(),
            nodes: Vec::new(),
        }
    }
}

impl Pipeline {
    pub fn new(nodes: Vec<Node>) -> Result<Self> {
        Self::named(ROOT_NAME, nodes)
    }

    pub fn named(name: impl Into<String>, nodes: Vec<Node>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(PypeError::config("pipeline name cannot be empty"));
        }
        if name.contains(params::SEPARATOR) {
            return Err(PypeError::config(format!(
                "pipeline name `{name}` cannot contain `{}`",
                params::SEPARATOR
            )));
        }
        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.name()) {
                return Err(PypeError::config(format!(
                    "duplicate node name `{}` in pipeline `{name}`",
                    node.name()
                )));
            }
        }
        Ok(Self { name, nodes })
    }

    pub fn push(&mut self, node: impl Into<Node>) -> Result<()> {
        let node = node.into();
        if self.nodes.iter().any(|existing| existing.name() == node.name()) {
            return Err(PypeError::config(format!(
                "duplicate node name `{}` in pipeline `{}`",
                node.name(),
                self.name
            )));
        }
        self.nodes.push(node);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[instrument(skip_all, fields(pipeline = %self.name))]
    pub fn fit(&mut self, dataset: &DataSet) -> Result<()> {
        self.fit_transform(dataset).map(|_| ())
    }

    /// Fits every node, feeding each the transformed output of the last.
    pub fn fit_transform(&mut self, dataset: &DataSet) -> Result<DataSet> {
        let mut current = dataset.clone();
        for node in &mut self.nodes {
            current = node.fit_transform(&current)?;
        }
        debug!(pipeline = self.name.as_str(), nodes = self.nodes.len(), "Pipeline fitted");
        Ok(current)
    }

    pub fn transform(&self, dataset: &DataSet, is_inference: bool) -> Result<DataSet> {
        let span = tracing::span!(
            Level::DEBUG,
            "pipeline.transform",
            pipeline = self.name.as_str(),
            is_inference
        );
        let _guard = span.enter();
        let mut current = dataset.clone();
        for node in &self.nodes {
            current = node.transform(&current, is_inference)?;
        }
        Ok(current)
    }

    /// Rebuilds every pipe with the parameters addressed to it. Paths that
    /// match no node are ignored; see [`Pipeline::unmatched_parameters`].
    pub fn reinitialise(&mut self, params: &ParameterTree) -> Result<()> {
        for node in &mut self.nodes {
            let child = params.child(node.name());
            node.reinitialise(child)?;
        }
        Ok(())
    }

    /// Flat paths in `params` that do not address any pipe of this tree.
    pub fn unmatched_parameters(&self, params: &ParameterTree) -> Vec<String> {
        let mut unmatched = Vec::new();
        self.collect_unmatched(params, &mut Vec::new(), &mut unmatched);
        unmatched
    }

    fn collect_unmatched(
        &self,
        params: &ParameterTree,
        prefix: &mut Vec<String>,
        out: &mut Vec<String>,
    ) {
        for arg in params.values().keys() {
            out.push(join_path(prefix, arg));
        }
        for (name, child) in params.children() {
            match self.nodes.iter().find(|node| node.name() == name) {
                Some(Node::Pipe(_)) => {}
                Some(Node::Pipeline(pipeline)) => {
                    prefix.push(name.to_string());
                    pipeline.collect_unmatched(child, prefix, out);
                    prefix.pop();
                }
                None => out.push(join_path(prefix, name)),
            }
        }
    }

    pub fn walk<V: PipelineVisitor + ?Sized>(&self, visitor: &mut V) {
        self.walk_at(&mut Vec::new(), visitor);
    }

    fn walk_at<V: PipelineVisitor + ?Sized>(&self, path: &mut Vec<String>, visitor: &mut V) {
        visitor.enter_pipeline(path, self);
        for node in &self.nodes {
            path.push(node.name().to_string());
            match node {
                Node::Pipe(pipe) => visitor.visit_pipe(path, pipe),
                Node::Pipeline(pipeline) => pipeline.walk_at(path, visitor),
            }
            path.pop();
        }
        visitor.leave_pipeline(path, self);
    }

    /// Resolves a node by its name path below this pipeline.
    pub fn find(&self, path: &[&str]) -> Option<&Node> {
        let (first, rest) = path.split_first()?;
        let node = self.nodes.iter().find(|node| node.name() == *first)?;
        match (node, rest.is_empty()) {
            (_, true) => Some(node),
            (Node::Pipeline(pipeline), false) => pipeline.find(rest),
            (Node::Pipe(_), false) => None,
        }
    }

    pub fn find_pipe(&self, path: &[&str]) -> Option<&Pipe> {
        match self.find(path)? {
            Node::Pipe(pipe) => Some(pipe),
            Node::Pipeline(_) => None,
        }
    }

    /// Flat path of every pipe, in traversal order.
    pub fn pipe_paths(&self) -> Vec<String> {
        struct Paths(Vec<String>);
        impl PipelineVisitor for Paths {
            fn visit_pipe(&mut self, path: &[String], _pipe: &Pipe) {
                self.0.push(path.join(SEPARATOR));
            }
        }
        let mut paths = Paths(Vec::new());
        self.walk(&mut paths);
        paths.0
    }

    pub fn is_fitted(&self) -> bool {
        struct Fitted(bool);
        impl PipelineVisitor for Fitted {
            fn visit_pipe(&mut self, _path: &[String], pipe: &Pipe) {
                self.0 &= pipe.is_fitted();
            }
        }
        let mut fitted = Fitted(true);
        self.walk(&mut fitted);
        fitted.0
    }

    pub fn to_artifact(&self) -> Result<PipelineArtifact> {
        Ok(PipelineArtifact {
            name: self.name.clone(),
            nodes: self
                .nodes
                .iter()
                .map(Node::to_artifact)
                .collect::<Result<_>>()?,
        })
    }

    pub fn from_artifact(artifact: PipelineArtifact, registry: &OperatorRegistry) -> Result<Self> {
        let nodes = artifact
            .nodes
            .into_iter()
            .map(|node| match node {
                NodeArtifact::Pipe(pipe) => Pipe::from_artifact(pipe, registry).map(Node::Pipe),
                NodeArtifact::Pipeline(pipeline) => {
                    Self::from_artifact(pipeline, registry).map(Node::Pipeline)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Self::named(artifact.name, nodes)
    }
}

fn join_path(prefix: &[String], last: &str) -> String {
    let mut parts: Vec<&str> = prefix.iter().map(String::as_str).collect();
    parts.push(last);
    parts.join(SEPARATOR)
}

/// Serialisable form of a fitted pipeline tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineArtifact {
    pub name: String,
    pub nodes: Vec<NodeArtifact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum NodeArtifact {
    Pipe(PipeArtifact),
    Pipeline(PipelineArtifact),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Column, Data};
    use crate::registry::{Parameters, Registry};
    use serde_json::json;

    fn scaler(registry: &OperatorRegistry, name: &str, input: &str, output: &str) -> Pipe {
        Pipe::from_registry(
            registry,
            name,
            "standard_scaler",
            Parameters::new(),
            vec![input.to_string()],
            vec![output.to_string()],
        )
        .unwrap()
    }

    fn dataset() -> DataSet {
        let mut dataset = DataSet::new();
        dataset.insert("x", Column::Float(vec![1.0, 2.0, 3.0]));
        dataset
    }

    #[test]
    fn duplicate_names_fail_at_construction() {
        let registry = Registry::with_defaults();
        let err = Pipeline::new(vec![
            scaler(&registry.operators, "scale", "x", "x").into(),
            scaler(&registry.operators, "scale", "x", "y").into(),
        ])
        .unwrap_err();
        assert!(matches!(err, PypeError::Configuration(_)));
    }

    #[test]
    fn pipeline_names_cannot_contain_the_path_separator() {
        let registry = Registry::with_defaults();
        let err = Pipeline::named(
            "pre__proc",
            vec![scaler(&registry.operators, "scale", "x", "x").into()],
        )
        .unwrap_err();
        assert!(matches!(err, PypeError::Configuration(ref msg) if msg.contains("pre__proc")));
        assert!(Pipeline::named("pre_proc", Vec::new()).is_ok());
    }

    #[test]
    fn transform_before_fit_is_rejected() {
        let registry = Registry::with_defaults();
        let pipeline =
            Pipeline::new(vec![scaler(&registry.operators, "scale", "x", "x").into()]).unwrap();
        let err = pipeline.transform(&dataset(), false).unwrap_err();
        assert!(matches!(err, PypeError::UnfittedOperator(name) if name == "scale"));
    }

    #[test]
    fn nested_pipelines_are_walked_depth_first() {
        let registry = Registry::with_defaults();
        let inner = Pipeline::named(
            "inner",
            vec![scaler(&registry.operators, "b", "x", "x").into()],
        )
        .unwrap();
        let pipeline = Pipeline::new(vec![
            scaler(&registry.operators, "a", "x", "x").into(),
            inner.into(),
            scaler(&registry.operators, "c", "x", "x").into(),
        ])
        .unwrap();
        assert_eq!(pipeline.pipe_paths(), vec!["a", "inner__b", "c"]);
        assert!(pipeline.find_pipe(&["inner", "b"]).is_some());
        assert!(pipeline.find_pipe(&["inner"]).is_none());
    }

    #[test]
    fn unmatched_parameters_are_reported() {
        let registry = Registry::with_defaults();
        let pipeline =
            Pipeline::new(vec![scaler(&registry.operators, "scale", "x", "x").into()]).unwrap();
        let params = ParameterTree::from_flat([
            ("scale__with_mean", json!(false)),
            ("missing__arg", json!(1)),
        ])
        .unwrap();
        assert_eq!(pipeline.unmatched_parameters(&params), vec!["missing"]);
    }

    #[test]
    fn map_valued_arguments_reach_the_pipe() {
        let registry = Registry::with_defaults();
        let mut pipeline =
            Pipeline::new(vec![scaler(&registry.operators, "scale", "x", "x").into()]).unwrap();
        let params: ParameterTree =
            serde_yaml::from_str("scale:\n  with_mean: false\n  range: {low: 0}\n").unwrap();
        assert!(pipeline.unmatched_parameters(&params).is_empty());
        let err = pipeline.reinitialise(&params).unwrap_err();
        assert!(err.to_string().contains("range"), "{err}");
    }

    #[test]
    fn artifact_restores_fitted_state() {
        let registry = Registry::with_defaults();
        let mut pipeline =
            Pipeline::new(vec![scaler(&registry.operators, "scale", "x", "z").into()]).unwrap();
        let fitted = pipeline.fit_transform(&dataset()).unwrap();

        let artifact = pipeline.to_artifact().unwrap();
        let encoded = serde_json::to_value(&artifact).unwrap();
        let decoded: PipelineArtifact = serde_json::from_value(encoded).unwrap();
        let restored = Pipeline::from_artifact(decoded, &registry.operators).unwrap();

        assert!(restored.is_fitted());
        let again = restored.transform(&dataset(), true).unwrap();
        assert_eq!(again.get("z"), fitted.get("z"));
        assert!(matches!(again.get("z"), Some(Data::Array(_))));
    }
}
