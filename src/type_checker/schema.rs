//! Wire-level schemas derived from fitted type checkers.
//!
//! A [`SchemaType`] describes one DataSet entry; a [`DataSetSchema`]
//! describes a whole request or response. `parse` validates incoming JSON,
//! `to_model` wraps native data, and `convert` turns a model back into
//! native [`Data`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::data::{Column, Data, DataKind, DataSet, Frame, Scalar, ScalarType};
use crate::error::{PypeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shape {
    Scalar,
    Sequence,
    Mapping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub dtype: ScalarType,
    pub shape: Shape,
    #[serde(default = "required_default")]
    pub required: bool,
}

fn required_default() -> bool {
    true
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, dtype: ScalarType, shape: Shape) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            required: true,
        }
    }
}

/// Schema of one DataSet entry.
///
/// Frames and objects list one field per column; arrays and scalars carry
/// a single field named after the entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaType {
    pub name: String,
    pub kind: DataKind,
    pub fields: Vec<FieldSchema>,
    #[serde(default)]
    pub strict: bool,
}

impl SchemaType {
    /// Validates a wire value. Unknown fields are dropped, or rejected when
    /// the schema is strict.
    pub fn parse(&self, value: &Value) -> Result<DataModel> {
        let data = self.decode(value, self.strict)?;
        Ok(DataModel {
            schema: self.clone(),
            value: data.to_json(),
        })
    }

    /// Wraps native data, projecting it onto the schema fields. NaN and
    /// infinite floats are refused since JSON cannot represent them.
    pub fn to_model(&self, data: &Data) -> Result<DataModel> {
        if data.kind() != self.kind {
            return Err(PypeError::kind_mismatch(&self.name, self.kind, data.kind()));
        }
        if !data.is_finite() {
            return Err(PypeError::operator(
                &self.name,
                "produced a NaN or infinite value, which has no JSON encoding",
            ));
        }
        let projected = self.decode(&data.to_json(), false)?;
        Ok(DataModel {
            schema: self.clone(),
            value: projected.to_json(),
        })
    }

    pub fn json_schema(&self) -> Value {
        match self.kind {
            DataKind::Frame | DataKind::Object => {
                let mut properties = Map::new();
                for field in &self.fields {
                    properties.insert(field.name.clone(), field_json_schema(field));
                }
                let required: Vec<&str> = self
                    .fields
                    .iter()
                    .filter(|field| field.required)
                    .map(|field| field.name.as_str())
                    .collect();
                json!({
                    "type": "object",
                    "properties": properties,
                    "required": required,
                    "additionalProperties": !self.strict,
                })
            }
            DataKind::Array | DataKind::Scalar => self
                .fields
                .first()
                .map(field_json_schema)
                .unwrap_or_else(|| json!({})),
            DataKind::Json => json!({}),
        }
    }

    fn decode(&self, value: &Value, reject_extra: bool) -> Result<Data> {
        match self.kind {
            DataKind::Frame => {
                let map = self.expect_object(value)?;
                self.reject_unknown(map, reject_extra)?;
                let columns = self
                    .fields
                    .iter()
                    .map(|field| {
                        let path = format!("{}.{}", self.name, field.name);
                        let raw = map
                            .get(&field.name)
                            .ok_or_else(|| PypeError::missing_field(&path))?;
                        Ok((field.name.clone(), decode_column(&path, raw, field.dtype)?))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let frame = Frame::new(columns).map_err(|_| {
                    PypeError::type_mismatch(&self.name, "equal-length columns", "ragged columns")
                })?;
                Ok(Data::Frame(frame))
            }
            DataKind::Object => {
                let map = self.expect_object(value)?;
                self.reject_unknown(map, reject_extra)?;
                let fields = self
                    .fields
                    .iter()
                    .map(|field| {
                        let path = format!("{}.{}", self.name, field.name);
                        let raw = map
                            .get(&field.name)
                            .ok_or_else(|| PypeError::missing_field(&path))?;
                        Ok((field.name.clone(), decode_scalar(&path, raw, field.dtype)?))
                    })
                    .collect::<Result<BTreeMap<_, _>>>()?;
                Ok(Data::Object(fields))
            }
            DataKind::Array => {
                let dtype = self.single_dtype()?;
                Ok(Data::Array(decode_column(&self.name, value, dtype)?))
            }
            DataKind::Scalar => {
                let dtype = self.single_dtype()?;
                Ok(Data::Scalar(decode_scalar(&self.name, value, dtype)?))
            }
            DataKind::Json => Ok(Data::Json(value.clone())),
        }
    }

    fn expect_object<'a>(&self, value: &'a Value) -> Result<&'a Map<String, Value>> {
        value
            .as_object()
            .ok_or_else(|| PypeError::type_mismatch(&self.name, "object", json_type(value)))
    }

    fn reject_unknown(&self, map: &Map<String, Value>, reject_extra: bool) -> Result<()> {
        if !reject_extra {
            return Ok(());
        }
        match map
            .keys()
            .find(|key| !self.fields.iter().any(|field| &field.name == *key))
        {
            Some(extra) => Err(PypeError::unexpected_field(format!("{}.{extra}", self.name))),
            None => Ok(()),
        }
    }

    fn single_dtype(&self) -> Result<ScalarType> {
        self.fields
            .first()
            .map(|field| field.dtype)
            .ok_or_else(|| PypeError::config(format!("schema `{}` has no fields", self.name)))
    }
}

/// A validated wire value together with the schema it conforms to.
#[derive(Debug, Clone, PartialEq)]
pub struct DataModel {
    schema: SchemaType,
    value: Value,
}

impl DataModel {
    pub fn schema(&self) -> &SchemaType {
        &self.schema
    }

    pub fn to_json(&self) -> Value {
        self.value.clone()
    }

    pub fn convert(&self) -> Result<Data> {
        self.schema.decode(&self.value, false)
    }
}

/// Request or response schema of a whole DataSet.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataSetSchema {
    pub fields: BTreeMap<String, SchemaType>,
    #[serde(default)]
    pub strict: bool,
}

impl DataSetSchema {
    pub fn parse(&self, value: &Value) -> Result<DataSetModel> {
        let map = value
            .as_object()
            .ok_or_else(|| PypeError::type_mismatch("request", "object", json_type(value)))?;
        if self.strict
            && let Some(extra) = map.keys().find(|key| !self.fields.contains_key(*key))
        {
            return Err(PypeError::unexpected_field(extra.clone()));
        }
        let models = self
            .fields
            .iter()
            .map(|(key, schema)| {
                let raw = map.get(key).ok_or_else(|| PypeError::missing_field(key))?;
                Ok((key.clone(), schema.parse(raw)?))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(DataSetModel { models })
    }

    pub fn to_model(&self, dataset: &DataSet) -> Result<DataSetModel> {
        let models = self
            .fields
            .iter()
            .map(|(key, schema)| {
                let data = dataset.get(key).ok_or_else(|| PypeError::missing_field(key))?;
                Ok((key.clone(), schema.to_model(data)?))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(DataSetModel { models })
    }

    pub fn json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .fields
            .iter()
            .map(|(key, schema)| (key.clone(), schema.json_schema()))
            .collect();
        let required: Vec<&str> = self.fields.keys().map(String::as_str).collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": !self.strict,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSetModel {
    models: BTreeMap<String, DataModel>,
}

impl DataSetModel {
    pub fn get(&self, key: &str) -> Option<&DataModel> {
        self.models.get(key)
    }

    pub fn convert(&self) -> Result<DataSet> {
        self.models
            .iter()
            .map(|(key, model)| Ok((key.clone(), model.convert()?)))
            .collect()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.models
                .iter()
                .map(|(key, model)| (key.clone(), model.to_json()))
                .collect(),
        )
    }
}

fn decode_column(field: &str, value: &Value, dtype: ScalarType) -> Result<Column> {
    let items = value.as_array().ok_or_else(|| {
        PypeError::type_mismatch(field, format!("sequence of {dtype}"), json_type(value))
    })?;
    let scalars = items
        .iter()
        .map(|item| decode_scalar(field, item, dtype))
        .collect::<Result<Vec<_>>>()?;
    Column::from_scalars(dtype, scalars)
        .ok_or_else(|| PypeError::type_mismatch(field, dtype, "mixed values"))
}

fn decode_scalar(field: &str, value: &Value, dtype: ScalarType) -> Result<Scalar> {
    Scalar::from_json_as(value, dtype)
        .ok_or_else(|| PypeError::type_mismatch(field, dtype, json_type(value)))
}

fn field_json_schema(field: &FieldSchema) -> Value {
    let item = json!({ "type": json_schema_type(field.dtype) });
    match field.shape {
        Shape::Sequence => json!({ "type": "array", "items": item }),
        Shape::Scalar | Shape::Mapping => item,
    }
}

fn json_schema_type(dtype: ScalarType) -> &'static str {
    match dtype {
        ScalarType::String => "string",
        ScalarType::Int => "integer",
        ScalarType::Float => "number",
        ScalarType::Bool => "boolean",
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(num) if num.is_i64() || num.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
