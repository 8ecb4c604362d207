//! Data values flowing through pipelines.
//!
//! [`Data`] is a closed variant over the shapes the framework understands:
//! tabular frames, 1-d arrays, scalars, keyed objects and opaque JSON.
//! Natural JSON converts to and from it with [`Data::from_json`] and
//! [`Data::to_json`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PypeError, Result};

pub mod dataset;
pub mod source;

pub use dataset::{DataSet, DataSetSource};
pub use source::{
    DataSink, DataSource, InMemorySource, JsonFileSink, JsonFileSource, JsonLinesSink, MemorySink,
    SinkSpec, SourceSpec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    String,
    Int,
    Float,
    Bool,
}

impl ScalarType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scalar {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    pub fn dtype(&self) -> ScalarType {
        match self {
            Self::String(_) => ScalarType::String,
            Self::Int(_) => ScalarType::Int,
            Self::Float(_) => ScalarType::Float,
            Self::Bool(_) => ScalarType::Bool,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Int(v) => Value::from(*v),
            Self::Float(v) => float_to_json(*v),
            Self::Bool(b) => Value::Bool(*b),
        }
    }

    /// Infers the scalar type from the JSON value itself.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(num) => match num.as_i64() {
                Some(v) => Some(Self::Int(v)),
                None => num.as_f64().map(Self::Float),
            },
            _ => None,
        }
    }

    /// Reads a JSON value as the given type. JSON integers are accepted for
    /// float fields since the wire format cannot tell `1` from `1.0`.
    pub fn from_json_as(value: &Value, dtype: ScalarType) -> Option<Self> {
        match (dtype, value) {
            (ScalarType::String, Value::String(s)) => Some(Self::String(s.clone())),
            (ScalarType::Bool, Value::Bool(b)) => Some(Self::Bool(*b)),
            (ScalarType::Int, Value::Number(num)) => num.as_i64().map(Self::Int),
            (ScalarType::Float, Value::Number(num)) => num.as_f64().map(Self::Float),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// A typed, homogeneous column of values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    String(Vec<String>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    Bool(Vec<bool>),
}

impl Column {
    pub fn dtype(&self) -> ScalarType {
        match self {
            Self::String(_) => ScalarType::String,
            Self::Int(_) => ScalarType::Int,
            Self::Float(_) => ScalarType::Float,
            Self::Bool(_) => ScalarType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::String(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: usize) -> Option<Scalar> {
        match self {
            Self::String(v) => v.get(idx).cloned().map(Scalar::String),
            Self::Int(v) => v.get(idx).copied().map(Scalar::Int),
            Self::Float(v) => v.get(idx).copied().map(Scalar::Float),
            Self::Bool(v) => v.get(idx).copied().map(Scalar::Bool),
        }
    }

    /// Numeric view of the column. Booleans map to 0.0/1.0; strings have none.
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        match self {
            Self::Int(v) => Some(v.iter().map(|x| *x as f64).collect()),
            Self::Float(v) => Some(v.clone()),
            Self::Bool(v) => Some(v.iter().map(|b| if *b { 1.0 } else { 0.0 }).collect()),
            Self::String(_) => None,
        }
    }

    pub fn to_labels(&self) -> Vec<String> {
        (0..self.len())
            .filter_map(|idx| self.get(idx))
            .map(|scalar| scalar.to_string())
            .collect()
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::String(v) => Value::Array(v.iter().cloned().map(Value::String).collect()),
            Self::Int(v) => Value::Array(v.iter().map(|x| Value::from(*x)).collect()),
            Self::Float(v) => Value::Array(v.iter().map(|x| float_to_json(*x)).collect()),
            Self::Bool(v) => Value::Array(v.iter().map(|b| Value::Bool(*b)).collect()),
        }
    }

    /// Infers a column from JSON values. Mixed ints and floats widen to
    /// float; any other mix, nulls, nested values or an empty slice yield
    /// `None`.
    pub fn from_json(values: &[Value]) -> Option<Self> {
        let scalars: Option<Vec<Scalar>> = values.iter().map(Scalar::from_json).collect();
        let scalars = scalars?;
        let types: BTreeSet<ScalarType> = scalars.iter().map(Scalar::dtype).collect();
        let dtype = match types.len() {
            1 => *types.iter().next()?,
            2 if types.contains(&ScalarType::Int) && types.contains(&ScalarType::Float) => {
                ScalarType::Float
            }
            _ => return None,
        };
        Self::from_json_as(values, dtype)
    }

    pub fn from_json_as(values: &[Value], dtype: ScalarType) -> Option<Self> {
        let scalars: Option<Vec<Scalar>> = values
            .iter()
            .map(|value| Scalar::from_json_as(value, dtype))
            .collect();
        Self::from_scalars(dtype, scalars?)
    }

    pub fn from_scalars(dtype: ScalarType, scalars: Vec<Scalar>) -> Option<Self> {
        match dtype {
            ScalarType::String => scalars
                .into_iter()
                .map(|s| match s {
                    Scalar::String(v) => Some(v),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(Self::String),
            ScalarType::Int => scalars
                .into_iter()
                .map(|s| match s {
                    Scalar::Int(v) => Some(v),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(Self::Int),
            ScalarType::Float => scalars
                .into_iter()
                .map(|s| match s {
                    Scalar::Float(v) => Some(v),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(Self::Float),
            ScalarType::Bool => scalars
                .into_iter()
                .map(|s| match s {
                    Scalar::Bool(v) => Some(v),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(Self::Bool),
        }
    }
}

impl From<Vec<f64>> for Column {
    fn from(values: Vec<f64>) -> Self {
        Self::Float(values)
    }
}

impl From<Vec<i64>> for Column {
    fn from(values: Vec<i64>) -> Self {
        Self::Int(values)
    }
}

impl From<Vec<bool>> for Column {
    fn from(values: Vec<bool>) -> Self {
        Self::Bool(values)
    }
}

impl From<Vec<String>> for Column {
    fn from(values: Vec<String>) -> Self {
        Self::String(values)
    }
}

impl From<Vec<&str>> for Column {
    fn from(values: Vec<&str>) -> Self {
        Self::String(values.into_iter().map(str::to_string).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub name: String,
    pub values: Column,
}

/// Ordered, named columns of equal length.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Frame {
    columns: Vec<Series>,
}

impl Frame {
    pub fn new<S: Into<String>>(columns: Vec<(S, Column)>) -> Result<Self> {
        let mut frame = Frame::default();
        for (name, values) in columns {
            frame.push(name.into(), values)?;
        }
        Ok(frame)
    }

    fn push(&mut self, name: String, values: Column) -> Result<()> {
        if self.columns.iter().any(|series| series.name == name) {
            return Err(PypeError::config(format!("duplicate column `{name}`")));
        }
        if let Some(first) = self.columns.first()
            && first.values.len() != values.len()
        {
            return Err(PypeError::config(format!(
                "column `{name}` has {} rows, expected {}",
                values.len(),
                first.values.len()
            )));
        }
        self.columns.push(Series { name, values });
        Ok(())
    }

    pub fn n_rows(&self) -> usize {
        self.columns.first().map(|s| s.values.len()).unwrap_or(0)
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> impl Iterator<Item = &Series> {
        self.columns.iter()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|series| series.name == name)
            .map(|series| &series.values)
    }

    /// Replaces the named column, or appends it when absent.
    pub fn with_column(mut self, name: impl Into<String>, values: Column) -> Result<Self> {
        let name = name.into();
        if let Some(existing) = self.columns.iter_mut().find(|s| s.name == name) {
            if existing.values.len() != values.len() {
                return Err(PypeError::config(format!(
                    "column `{name}` has {} rows, expected {}",
                    values.len(),
                    existing.values.len()
                )));
            }
            existing.values = values;
            return Ok(self);
        }
        self.push(name, values)?;
        Ok(self)
    }

    pub fn without_column(mut self, name: &str) -> Self {
        self.columns.retain(|series| series.name != name);
        self
    }

    /// Row-major numeric matrix over every column, if all are numeric.
    pub fn to_matrix(&self) -> Option<Vec<Vec<f64>>> {
        let numeric: Option<Vec<Vec<f64>>> =
            self.columns.iter().map(|series| series.values.to_f64()).collect();
        let numeric = numeric?;
        Some(
            (0..self.n_rows())
                .map(|row| numeric.iter().map(|col| col[row]).collect())
                .collect(),
        )
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for series in &self.columns {
            map.insert(series.name.clone(), series.values.to_json());
        }
        Value::Object(map)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    Frame,
    Array,
    Scalar,
    Object,
    Json,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Frame => "frame",
            Self::Array => "array",
            Self::Scalar => "scalar",
            Self::Object => "object",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Data {
    Frame(Frame),
    Array(Column),
    Scalar(Scalar),
    Object(BTreeMap<String, Scalar>),
    Json(Value),
}

impl Data {
    pub fn kind(&self) -> DataKind {
        match self {
            Self::Frame(_) => DataKind::Frame,
            Self::Array(_) => DataKind::Array,
            Self::Scalar(_) => DataKind::Scalar,
            Self::Object(_) => DataKind::Object,
            Self::Json(_) => DataKind::Json,
        }
    }

    pub fn as_frame(&self) -> Option<&Frame> {
        match self {
            Self::Frame(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Column> {
        match self {
            Self::Array(column) => Some(column),
            _ => None,
        }
    }

    /// Number of rows for row-shaped data.
    pub fn n_rows(&self) -> Option<usize> {
        match self {
            Self::Frame(frame) => Some(frame.n_rows()),
            Self::Array(column) => Some(column.len()),
            _ => None,
        }
    }

    /// False when any float is NaN or infinite. JSON cannot carry those.
    pub fn is_finite(&self) -> bool {
        let finite = |scalar: &Scalar| !matches!(scalar, Scalar::Float(v) if !v.is_finite());
        match self {
            Self::Frame(frame) => frame.columns().all(|series| column_is_finite(&series.values)),
            Self::Array(column) => column_is_finite(column),
            Self::Scalar(scalar) => finite(scalar),
            Self::Object(fields) => fields.values().all(finite),
            Self::Json(_) => true,
        }
    }

    /// Converts natural JSON into the closest data shape.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Array(items) => match Column::from_json(&items) {
                Some(column) => Self::Array(column),
                None => Self::Json(Value::Array(items)),
            },
            Value::Object(map) => {
                if let Some(frame) = frame_from_json(&map) {
                    return Self::Frame(frame);
                }
                let scalars: Option<BTreeMap<String, Scalar>> = map
                    .iter()
                    .map(|(key, value)| Scalar::from_json(value).map(|s| (key.clone(), s)))
                    .collect();
                match scalars {
                    Some(fields) if !fields.is_empty() => Self::Object(fields),
                    _ => Self::Json(Value::Object(map)),
                }
            }
            other => match Scalar::from_json(&other) {
                Some(scalar) => Self::Scalar(scalar),
                None => Self::Json(other),
            },
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Frame(frame) => frame.to_json(),
            Self::Array(column) => column.to_json(),
            Self::Scalar(scalar) => scalar.to_json(),
            Self::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            Self::Json(value) => value.clone(),
        }
    }
}

impl From<Frame> for Data {
    fn from(frame: Frame) -> Self {
        Self::Frame(frame)
    }
}

impl From<Column> for Data {
    fn from(column: Column) -> Self {
        Self::Array(column)
    }
}

impl From<Scalar> for Data {
    fn from(scalar: Scalar) -> Self {
        Self::Scalar(scalar)
    }
}

impl From<Vec<f64>> for Data {
    fn from(values: Vec<f64>) -> Self {
        Self::Array(Column::Float(values))
    }
}

impl From<Vec<i64>> for Data {
    fn from(values: Vec<i64>) -> Self {
        Self::Array(Column::Int(values))
    }
}

fn frame_from_json(map: &Map<String, Value>) -> Option<Frame> {
    if map.is_empty() {
        return None;
    }
    let mut columns = Vec::with_capacity(map.len());
    for (name, value) in map {
        let Value::Array(items) = value else {
            return None;
        };
        columns.push((name.clone(), Column::from_json(items)?));
    }
    Frame::new(columns).ok()
}

fn column_is_finite(column: &Column) -> bool {
    match column {
        Column::Float(values) => values.iter().all(|v| v.is_finite()),
        _ => true,
    }
}

fn float_to_json(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
