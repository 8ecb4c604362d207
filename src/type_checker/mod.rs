//! Runtime type checking at pipeline boundaries.
//!
//! A [`TypeCheckerPipe`] fits one checker per DataSet key, chosen from a
//! [`TypeCheckerRegistry`] by the runtime [`DataKind`] of the value. At
//! inference the fitted checkers validate and narrow incoming data, and
//! their [`schema`] describes the request and response wire formats.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::{Data, DataKind, DataSet};
use crate::error::{PypeError, Result};

pub mod checkers;
pub mod schema;

pub use checkers::{ArrayChecker, FrameChecker, ObjectChecker, ScalarChecker};
pub use schema::{DataModel, DataSetModel, DataSetSchema, FieldSchema, SchemaType, Shape};

pub trait TypeChecker {
    fn kind(&self) -> DataKind;

    /// Infers and stores the signature of `data`.
    fn fit(&mut self, data: &Data) -> Result<()>;

    /// Validates `data` against the fitted signature and narrows it to the
    /// fitted fields. `field` names the value in error messages.
    fn transform(&self, field: &str, data: &Data, reject_extra: bool) -> Result<Data>;

    fn schema(&self, name: &str) -> Result<SchemaType>;
}

/// A fitted checker of any registered kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnyTypeChecker {
    Frame(FrameChecker),
    Array(ArrayChecker),
    Scalar(ScalarChecker),
    Object(ObjectChecker),
}

impl AnyTypeChecker {
    fn inner(&self) -> &dyn TypeChecker {
        match self {
            Self::Frame(checker) => checker,
            Self::Array(checker) => checker,
            Self::Scalar(checker) => checker,
            Self::Object(checker) => checker,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn TypeChecker {
        match self {
            Self::Frame(checker) => checker,
            Self::Array(checker) => checker,
            Self::Scalar(checker) => checker,
            Self::Object(checker) => checker,
        }
    }
}

impl TypeChecker for AnyTypeChecker {
    fn kind(&self) -> DataKind {
        self.inner().kind()
    }

    fn fit(&mut self, data: &Data) -> Result<()> {
        self.inner_mut().fit(data)
    }

    fn transform(&self, field: &str, data: &Data, reject_extra: bool) -> Result<Data> {
        self.inner().transform(field, data, reject_extra)
    }

    fn schema(&self, name: &str) -> Result<SchemaType> {
        self.inner().schema(name)
    }
}

type CheckerConstructor = fn() -> AnyTypeChecker;

/// Ordered `DataKind -> checker` table; the first matching entry wins.
#[derive(Debug, Clone, Default)]
pub struct TypeCheckerRegistry {
    entries: Vec<(DataKind, CheckerConstructor)>,
}

impl TypeCheckerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checkers for frames, arrays, scalars and objects. Opaque JSON has
    /// no checker.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(DataKind::Frame, || AnyTypeChecker::Frame(FrameChecker::default()));
        registry.register(DataKind::Array, || AnyTypeChecker::Array(ArrayChecker::default()));
        registry.register(DataKind::Scalar, || {
            AnyTypeChecker::Scalar(ScalarChecker::default())
        });
        registry.register(DataKind::Object, || {
            AnyTypeChecker::Object(ObjectChecker::default())
        });
        registry
    }

    pub fn register(&mut self, kind: DataKind, constructor: CheckerConstructor) {
        self.entries.push((kind, constructor));
    }

    pub fn resolve(&self, kind: DataKind) -> Result<AnyTypeChecker> {
        self.entries
            .iter()
            .find(|(registered, _)| *registered == kind)
            .map(|(_, constructor)| constructor())
            .ok_or_else(|| {
                PypeError::unsupported(format!("no type checker registered for {kind} data"))
            })
    }

    pub fn kinds(&self) -> Vec<DataKind> {
        self.entries.iter().map(|(kind, _)| *kind).collect()
    }
}

/// Validates a fixed set of DataSet keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeCheckerPipe {
    name: String,
    input_keys: Vec<String>,
    #[serde(default)]
    strict: bool,
    #[serde(default)]
    checkers: BTreeMap<String, AnyTypeChecker>,
}

impl TypeCheckerPipe {
    pub fn new(name: impl Into<String>, input_keys: Vec<String>) -> Self {
        Self {
            name: name.into(),
            input_keys,
            strict: false,
            checkers: BTreeMap::new(),
        }
    }

    /// Reject fields the checkers were not fitted on at inference time.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_keys(&self) -> &[String] {
        &self.input_keys
    }

    pub fn is_fitted(&self) -> bool {
        self.input_keys
            .iter()
            .all(|key| self.checkers.contains_key(key))
    }

    pub fn fit(&mut self, dataset: &DataSet, registry: &TypeCheckerRegistry) -> Result<()> {
        let mut checkers = BTreeMap::new();
        for key in &self.input_keys {
            let data = dataset.require(key)?;
            let mut checker = registry.resolve(data.kind())?;
            checker.fit(data)?;
            checkers.insert(key.clone(), checker);
        }
        self.checkers = checkers;
        debug!(checker = self.name.as_str(), keys = ?self.input_keys, "Type checkers fitted");
        Ok(())
    }

    /// Returns the checked keys of `dataset`, each validated and narrowed.
    /// Other keys are dropped, or rejected when strict at inference.
    pub fn transform(&self, dataset: &DataSet, is_inference: bool) -> Result<DataSet> {
        if !self.is_fitted() {
            return Err(PypeError::UnfittedOperator(self.name.clone()));
        }
        let reject_extra = self.strict && is_inference;
        if reject_extra
            && let Some(extra) = dataset.keys().find(|key| !self.checkers.contains_key(*key))
        {
            return Err(PypeError::unexpected_field(extra));
        }
        let mut result = DataSet::new();
        for (key, checker) in &self.checkers {
            let data = dataset
                .get(key)
                .ok_or_else(|| PypeError::missing_field(key))?;
            result.insert(key.clone(), checker.transform(key, data, reject_extra)?);
        }
        Ok(result)
    }

    pub fn schema(&self) -> Result<DataSetSchema> {
        if !self.is_fitted() {
            return Err(PypeError::UnfittedOperator(self.name.clone()));
        }
        let fields = self
            .checkers
            .iter()
            .map(|(key, checker)| {
                let mut schema = checker.schema(key)?;
                schema.strict = self.strict;
                Ok((key.clone(), schema))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(DataSetSchema {
            fields,
            strict: self.strict,
        })
    }
}
