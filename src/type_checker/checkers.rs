use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::TypeChecker;
use super::schema::{FieldSchema, SchemaType, Shape};
use crate::data::{Data, DataKind, Frame, ScalarType};
use crate::error::{PypeError, Result};

/// Records the column order and type of a frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameChecker {
    raw_types: Option<Vec<(String, ScalarType)>>,
}

impl TypeChecker for FrameChecker {
    fn kind(&self) -> DataKind {
        DataKind::Frame
    }

    fn fit(&mut self, data: &Data) -> Result<()> {
        let Data::Frame(frame) = data else {
            return Err(unsupported(self.kind(), data.kind()));
        };
        self.raw_types = Some(
            frame
                .columns()
                .map(|series| (series.name.clone(), series.values.dtype()))
                .collect(),
        );
        Ok(())
    }

    fn transform(&self, field: &str, data: &Data, reject_extra: bool) -> Result<Data> {
        let raw_types = fitted(&self.raw_types, self.kind())?;
        let Data::Frame(frame) = data else {
            return Err(PypeError::kind_mismatch(field, self.kind(), data.kind()));
        };
        if reject_extra
            && let Some(extra) = frame
                .column_names()
                .into_iter()
                .find(|name| !raw_types.iter().any(|(known, _)| known.as_str() == *name))
        {
            return Err(PypeError::unexpected_field(format!("{field}.{extra}")));
        }
        let mut columns = Vec::with_capacity(raw_types.len());
        for (name, dtype) in raw_types {
            let path = format!("{field}.{name}");
            let column = frame
                .column(name)
                .ok_or_else(|| PypeError::missing_field(&path))?;
            if column.dtype() != *dtype {
                return Err(PypeError::scalar_mismatch(path, *dtype, column.dtype()));
            }
            columns.push((name.clone(), column.clone()));
        }
        Ok(Data::Frame(Frame::new(columns)?))
    }

    fn schema(&self, name: &str) -> Result<SchemaType> {
        let raw_types = fitted(&self.raw_types, self.kind())?;
        Ok(SchemaType {
            name: name.to_string(),
            kind: self.kind(),
            fields: raw_types
                .iter()
                .map(|(column, dtype)| FieldSchema::new(column.clone(), *dtype, Shape::Sequence))
                .collect(),
            strict: false,
        })
    }
}

/// Records the element type of a 1-d array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrayChecker {
    dtype: Option<ScalarType>,
}

impl TypeChecker for ArrayChecker {
    fn kind(&self) -> DataKind {
        DataKind::Array
    }

    fn fit(&mut self, data: &Data) -> Result<()> {
        let Data::Array(column) = data else {
            return Err(unsupported(self.kind(), data.kind()));
        };
        self.dtype = Some(column.dtype());
        Ok(())
    }

    fn transform(&self, field: &str, data: &Data, _reject_extra: bool) -> Result<Data> {
        let dtype = *fitted(&self.dtype, self.kind())?;
        let Data::Array(column) = data else {
            return Err(PypeError::kind_mismatch(field, self.kind(), data.kind()));
        };
        if column.dtype() != dtype {
            return Err(PypeError::scalar_mismatch(field, dtype, column.dtype()));
        }
        Ok(data.clone())
    }

    fn schema(&self, name: &str) -> Result<SchemaType> {
        let dtype = *fitted(&self.dtype, self.kind())?;
        Ok(SchemaType {
            name: name.to_string(),
            kind: self.kind(),
            fields: vec![FieldSchema::new(name, dtype, Shape::Sequence)],
            strict: false,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalarChecker {
    dtype: Option<ScalarType>,
}

impl TypeChecker for ScalarChecker {
    fn kind(&self) -> DataKind {
        DataKind::Scalar
    }

    fn fit(&mut self, data: &Data) -> Result<()> {
        let Data::Scalar(scalar) = data else {
            return Err(unsupported(self.kind(), data.kind()));
        };
        self.dtype = Some(scalar.dtype());
        Ok(())
    }

    fn transform(&self, field: &str, data: &Data, _reject_extra: bool) -> Result<Data> {
        let dtype = *fitted(&self.dtype, self.kind())?;
        let Data::Scalar(scalar) = data else {
            return Err(PypeError::kind_mismatch(field, self.kind(), data.kind()));
        };
        if scalar.dtype() != dtype {
            return Err(PypeError::scalar_mismatch(field, dtype, scalar.dtype()));
        }
        Ok(data.clone())
    }

    fn schema(&self, name: &str) -> Result<SchemaType> {
        let dtype = *fitted(&self.dtype, self.kind())?;
        Ok(SchemaType {
            name: name.to_string(),
            kind: self.kind(),
            fields: vec![FieldSchema::new(name, dtype, Shape::Scalar)],
            strict: false,
        })
    }
}

/// Records the field names and types of a keyed object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectChecker {
    raw_types: Option<Vec<(String, ScalarType)>>,
}

impl TypeChecker for ObjectChecker {
    fn kind(&self) -> DataKind {
        DataKind::Object
    }

    fn fit(&mut self, data: &Data) -> Result<()> {
        let Data::Object(fields) = data else {
            return Err(unsupported(self.kind(), data.kind()));
        };
        self.raw_types = Some(
            fields
                .iter()
                .map(|(name, value)| (name.clone(), value.dtype()))
                .collect(),
        );
        Ok(())
    }

    fn transform(&self, field: &str, data: &Data, reject_extra: bool) -> Result<Data> {
        let raw_types = fitted(&self.raw_types, self.kind())?;
        let Data::Object(fields) = data else {
            return Err(PypeError::kind_mismatch(field, self.kind(), data.kind()));
        };
        if reject_extra
            && let Some(extra) = fields
                .keys()
                .find(|name| !raw_types.iter().any(|(known, _)| known == *name))
        {
            return Err(PypeError::unexpected_field(format!("{field}.{extra}")));
        }
        let mut checked = BTreeMap::new();
        for (name, dtype) in raw_types {
            let path = format!("{field}.{name}");
            let value = fields
                .get(name)
                .ok_or_else(|| PypeError::missing_field(&path))?;
            if value.dtype() != *dtype {
                return Err(PypeError::scalar_mismatch(path, *dtype, value.dtype()));
            }
            checked.insert(name.clone(), value.clone());
        }
        Ok(Data::Object(checked))
    }

    fn schema(&self, name: &str) -> Result<SchemaType> {
        let raw_types = fitted(&self.raw_types, self.kind())?;
        Ok(SchemaType {
            name: name.to_string(),
            kind: self.kind(),
            fields: raw_types
                .iter()
                .map(|(field, dtype)| FieldSchema::new(field.clone(), *dtype, Shape::Mapping))
                .collect(),
            strict: false,
        })
    }
}

fn fitted<T>(value: &Option<T>, kind: DataKind) -> Result<&T> {
    value
        .as_ref()
        .ok_or_else(|| PypeError::UnfittedOperator(format!("{kind} type checker")))
}

fn unsupported(expected: DataKind, actual: DataKind) -> PypeError {
    PypeError::unsupported(format!("{expected} type checker cannot fit {actual} data"))
}
