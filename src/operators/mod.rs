use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::{Column, Data, DataKind, Frame};
use crate::error::{PypeError, Result};
use crate::pipeline::Operator;
use crate::registry::{
    OperatorRegistry, Parameters, ensure_consumed, take_bool, take_string, take_string_list,
};

pub fn register_defaults(registry: &mut OperatorRegistry) {
    registry.register("standard_scaler", |params| {
        Ok(Box::new(Scaler::standard(params)?))
    });
    registry.register("min_max_scaler", |params| {
        Ok(Box::new(Scaler::min_max(params)?))
    });
    registry.register("one_hot_encoder", |params| {
        Ok(Box::new(OneHotEncoder::from_params(params)?))
    });
    registry.register("select_columns", |params| {
        Ok(Box::new(SelectColumns::from_params(params)?))
    });
    registry.register("identity", |params| {
        ensure_consumed("identity", &params)?;
        Ok(Box::new(Identity))
    });
}

#[derive(Debug, Clone, Copy)]
enum Scaling {
    Standard { with_mean: bool, with_std: bool },
    MinMax,
}

impl Scaling {
    fn kind(&self) -> &'static str {
        match self {
            Self::Standard { .. } => "standard_scaler",
            Self::MinMax => "min_max_scaler",
        }
    }

    /// Returns `(offset, scale)` so that `(x - offset) / scale` is applied.
    fn fit(&self, values: &[f64]) -> (f64, f64) {
        if values.is_empty() {
            return (0.0, 1.0);
        }
        let n = values.len() as f64;
        match *self {
            Self::Standard {
                with_mean,
                with_std,
            } => {
                let mean = values.iter().sum::<f64>() / n;
                let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
                let offset = if with_mean { mean } else { 0.0 };
                let scale = if with_std && std > 0.0 { std } else { 1.0 };
                (offset, scale)
            }
            Self::MinMax => {
                let min = values.iter().copied().fold(f64::INFINITY, f64::min);
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let range = max - min;
                (min, if range > 0.0 { range } else { 1.0 })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ColumnScale {
    /// `None` when fitted on an array.
    column: Option<String>,
    offset: f64,
    scale: f64,
}

/// Per-column affine rescaling of numeric frames or arrays.
#[derive(Debug)]
struct Scaler {
    scaling: Scaling,
    columns: Option<Vec<String>>,
    fitted: Vec<ColumnScale>,
}

impl Scaler {
    fn standard(mut params: Parameters) -> Result<Self> {
        let with_mean = take_bool(&mut params, "with_mean")?.unwrap_or(true);
        let with_std = take_bool(&mut params, "with_std")?.unwrap_or(true);
        let columns = take_string_list(&mut params, "columns")?;
        ensure_consumed("standard_scaler", &params)?;
        Ok(Self {
            scaling: Scaling::Standard {
                with_mean,
                with_std,
            },
            columns,
            fitted: Vec::new(),
        })
    }

    fn min_max(mut params: Parameters) -> Result<Self> {
        let columns = take_string_list(&mut params, "columns")?;
        ensure_consumed("min_max_scaler", &params)?;
        Ok(Self {
            scaling: Scaling::MinMax,
            columns,
            fitted: Vec::new(),
        })
    }

    fn kind(&self) -> &'static str {
        self.scaling.kind()
    }

    fn numeric(&self, column: &Column, name: &str) -> Result<Vec<f64>> {
        column.to_f64().ok_or_else(|| {
            PypeError::operator(
                self.kind(),
                format!("column `{name}` is {} and cannot be scaled", column.dtype()),
            )
        })
    }

    fn frame_columns<'a>(&'a self, frame: &'a Frame) -> Vec<&'a str> {
        match &self.columns {
            Some(columns) => columns.iter().map(String::as_str).collect(),
            None => frame
                .columns()
                .filter(|series| series.values.to_f64().is_some())
                .map(|series| series.name.as_str())
                .collect(),
        }
    }
}

impl Operator for Scaler {
    fn fit(&mut self, inputs: &[&Data]) -> Result<()> {
        let mut fitted = Vec::new();
        match first(self.kind(), inputs)? {
            Data::Array(column) => {
                let values = self.numeric(column, "array")?;
                let (offset, scale) = self.scaling.fit(&values);
                fitted.push(ColumnScale {
                    column: None,
                    offset,
                    scale,
                });
            }
            Data::Frame(frame) => {
                for name in self.frame_columns(frame) {
                    let column = frame.column(name).ok_or_else(|| {
                        PypeError::operator(self.kind(), format!("missing column `{name}`"))
                    })?;
                    let values = self.numeric(column, name)?;
                    let (offset, scale) = self.scaling.fit(&values);
                    fitted.push(ColumnScale {
                        column: Some(name.to_string()),
                        offset,
                        scale,
                    });
                }
            }
            other => return Err(unsupported_kind(self.kind(), other.kind())),
        }
        self.fitted = fitted;
        Ok(())
    }

    fn transform(&self, inputs: &[&Data]) -> Result<Vec<Data>> {
        let apply = |values: Vec<f64>, scale: &ColumnScale| {
            Column::Float(
                values
                    .into_iter()
                    .map(|v| (v - scale.offset) / scale.scale)
                    .collect(),
            )
        };
        let output = match first(self.kind(), inputs)? {
            Data::Array(column) => {
                let scale = self
                    .fitted
                    .iter()
                    .find(|scale| scale.column.is_none())
                    .ok_or_else(|| {
                        PypeError::operator(self.kind(), "fitted on a frame, got an array")
                    })?;
                Data::Array(apply(self.numeric(column, "array")?, scale))
            }
            Data::Frame(frame) => {
                let mut frame = frame.clone();
                for scale in &self.fitted {
                    let Some(name) = scale.column.as_deref() else {
                        return Err(PypeError::operator(
                            self.kind(),
                            "fitted on an array, got a frame",
                        ));
                    };
                    let column = frame.column(name).ok_or_else(|| {
                        PypeError::operator(self.kind(), format!("missing column `{name}`"))
                    })?;
                    let scaled = apply(self.numeric(column, name)?, scale);
                    frame = frame.with_column(name, scaled)?;
                }
                Data::Frame(frame)
            }
            other => return Err(unsupported_kind(self.kind(), other.kind())),
        };
        Ok(vec![output])
    }

    fn state(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.fitted)?)
    }

    fn restore(&mut self, state: Value) -> Result<()> {
        self.fitted = serde_json::from_value(state)?;
        Ok(())
    }
}

/// Expands categorical values into 0/1 float columns named
/// `{prefix}_{category}`. Categories unseen during fit encode as all zeros.
#[derive(Debug)]
struct OneHotEncoder {
    column: Option<String>,
    prefix: Option<String>,
    categories: Vec<String>,
}

impl OneHotEncoder {
    const KIND: &'static str = "one_hot_encoder";

    fn from_params(mut params: Parameters) -> Result<Self> {
        let column = take_string(&mut params, "column");
        let prefix = take_string(&mut params, "prefix");
        ensure_consumed(Self::KIND, &params)?;
        Ok(Self {
            column,
            prefix,
            categories: Vec::new(),
        })
    }

    fn labels<'a>(&self, data: &'a Data) -> Result<(Vec<String>, Option<&'a Frame>)> {
        match data {
            Data::Array(column) => Ok((column.to_labels(), None)),
            Data::Frame(frame) => {
                let name = self.column.as_deref().ok_or_else(|| {
                    PypeError::operator(Self::KIND, "`column` is required for frame input")
                })?;
                let column = frame.column(name).ok_or_else(|| {
                    PypeError::operator(Self::KIND, format!("missing column `{name}`"))
                })?;
                Ok((column.to_labels(), Some(frame)))
            }
            other => Err(unsupported_kind(Self::KIND, other.kind())),
        }
    }

    fn prefix(&self) -> &str {
        self.prefix
            .as_deref()
            .or(self.column.as_deref())
            .unwrap_or("category")
    }
}

impl Operator for OneHotEncoder {
    fn fit(&mut self, inputs: &[&Data]) -> Result<()> {
        let (labels, _) = self.labels(first(Self::KIND, inputs)?)?;
        let unique: BTreeSet<String> = labels.into_iter().collect();
        self.categories = unique.into_iter().collect();
        Ok(())
    }

    fn transform(&self, inputs: &[&Data]) -> Result<Vec<Data>> {
        let (labels, frame) = self.labels(first(Self::KIND, inputs)?)?;
        let mut result = match (frame, self.column.as_deref()) {
            (Some(frame), Some(column)) => frame.clone().without_column(column),
            _ => Frame::default(),
        };
        for category in &self.categories {
            let encoded = labels
                .iter()
                .map(|label| if label == category { 1.0 } else { 0.0 })
                .collect();
            let name = format!("{}_{category}", self.prefix());
            if result.column(&name).is_some() {
                return Err(PypeError::config(format!(
                    "{}: encoded column `{name}` collides with an existing column",
                    Self::KIND
                )));
            }
            result = result.with_column(name, Column::Float(encoded))?;
        }
        Ok(vec![Data::Frame(result)])
    }

    fn state(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.categories)?)
    }

    fn restore(&mut self, state: Value) -> Result<()> {
        self.categories = serde_json::from_value(state)?;
        Ok(())
    }
}

#[derive(Debug)]
struct SelectColumns {
    columns: Vec<String>,
}

impl SelectColumns {
    const KIND: &'static str = "select_columns";

    fn from_params(mut params: Parameters) -> Result<Self> {
        let columns = take_string_list(&mut params, "columns")?
            .filter(|columns| !columns.is_empty())
            .ok_or_else(|| PypeError::config("select_columns requires 'columns' parameter"))?;
        ensure_consumed(Self::KIND, &params)?;
        Ok(Self { columns })
    }
}

impl Operator for SelectColumns {
    fn fit(&mut self, _inputs: &[&Data]) -> Result<()> {
        Ok(())
    }

    fn transform(&self, inputs: &[&Data]) -> Result<Vec<Data>> {
        let frame = match first(Self::KIND, inputs)? {
            Data::Frame(frame) => frame,
            other => return Err(unsupported_kind(Self::KIND, other.kind())),
        };
        let columns = self
            .columns
            .iter()
            .map(|name| {
                frame
                    .column(name)
                    .cloned()
                    .map(|column| (name.clone(), column))
                    .ok_or_else(|| PypeError::operator(Self::KIND, format!("missing column `{name}`")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(vec![Data::Frame(Frame::new(columns)?)])
    }
}

/// Copies each input to the output at the same position.
#[derive(Debug)]
struct Identity;

impl Operator for Identity {
    fn fit(&mut self, _inputs: &[&Data]) -> Result<()> {
        Ok(())
    }

    fn transform(&self, inputs: &[&Data]) -> Result<Vec<Data>> {
        Ok(inputs.iter().map(|data| (*data).clone()).collect())
    }
}

fn first<'a>(kind: &str, inputs: &[&'a Data]) -> Result<&'a Data> {
    inputs
        .first()
        .copied()
        .ok_or_else(|| PypeError::operator(kind, "expected at least one input"))
}

fn unsupported_kind(operator: &str, kind: DataKind) -> PypeError {
    PypeError::operator(operator, format!("cannot handle {kind} data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use serde_json::json;

    fn create(kind: &str, params: Value) -> Box<dyn Operator> {
        let params = match params {
            Value::Object(map) => map,
            _ => Parameters::new(),
        };
        Registry::with_defaults().operators.create(kind, params).unwrap()
    }

    #[test]
    fn standard_scaler_centres_and_scales() {
        let mut scaler = create("standard_scaler", json!({}));
        let data = Data::Array(Column::Float(vec![1.0, 2.0, 3.0]));
        scaler.fit(&[&data]).unwrap();
        let out = scaler.transform(&[&data]).unwrap();
        let Data::Array(Column::Float(values)) = &out[0] else {
            panic!("expected float array");
        };
        assert!((values[1]).abs() < 1e-12);
        assert!((values[2] + values[0]).abs() < 1e-12);
    }

    #[test]
    fn scaler_leaves_string_columns_alone() {
        let mut scaler = create("min_max_scaler", json!({}));
        let frame = Frame::new(vec![
            ("x", Column::Int(vec![0, 5, 10])),
            ("name", Column::from(vec!["a", "b", "c"])),
        ])
        .unwrap();
        let data = Data::Frame(frame);
        scaler.fit(&[&data]).unwrap();
        let out = scaler.transform(&[&data]).unwrap();
        let frame = out[0].as_frame().unwrap();
        assert_eq!(frame.column("x"), Some(&Column::Float(vec![0.0, 0.5, 1.0])));
        assert_eq!(frame.column("name"), Some(&Column::from(vec!["a", "b", "c"])));
    }

    #[test]
    fn scaler_state_survives_restore() {
        let data = Data::Array(Column::Float(vec![2.0, 4.0]));
        let mut fitted = create("standard_scaler", json!({"with_std": false}));
        fitted.fit(&[&data]).unwrap();
        let mut restored = create("standard_scaler", json!({"with_std": false}));
        restored.restore(fitted.state().unwrap()).unwrap();
        assert_eq!(
            restored.transform(&[&data]).unwrap(),
            fitted.transform(&[&data]).unwrap()
        );
    }

    #[test]
    fn one_hot_encodes_unseen_as_zeros() {
        let mut encoder = create("one_hot_encoder", json!({"column": "colour"}));
        let train = Data::Frame(
            Frame::new(vec![("colour", Column::from(vec!["red", "blue"]))]).unwrap(),
        );
        encoder.fit(&[&train]).unwrap();
        let test = Data::Frame(
            Frame::new(vec![("colour", Column::from(vec!["green", "red"]))]).unwrap(),
        );
        let out = encoder.transform(&[&test]).unwrap();
        let frame = out[0].as_frame().unwrap();
        assert_eq!(frame.column_names(), vec!["colour_blue", "colour_red"]);
        assert_eq!(frame.column("colour_red"), Some(&Column::Float(vec![0.0, 1.0])));
        assert_eq!(frame.column("colour_blue"), Some(&Column::Float(vec![0.0, 0.0])));
    }

    #[test]
    fn one_hot_refuses_to_overwrite_existing_columns() {
        let mut encoder = create("one_hot_encoder", json!({"column": "colour"}));
        let data = Data::Frame(
            Frame::new(vec![
                ("colour", Column::from(vec!["red", "blue"])),
                ("colour_red", Column::Int(vec![7, 8])),
            ])
            .unwrap(),
        );
        encoder.fit(&[&data]).unwrap();
        let err = encoder.transform(&[&data]).unwrap_err();
        assert!(matches!(err, PypeError::Configuration(ref msg) if msg.contains("colour_red")));
    }

    #[test]
    fn select_columns_requires_columns() {
        let err = Registry::with_defaults()
            .operators
            .create("select_columns", Parameters::new())
            .unwrap_err();
        assert!(matches!(err, PypeError::Configuration(_)));
    }

    #[test]
    fn unknown_parameters_are_rejected() {
        let mut params = Parameters::new();
        params.insert("with_meen".into(), json!(true));
        let err = Registry::with_defaults()
            .operators
            .create("standard_scaler", params)
            .unwrap_err();
        assert!(err.to_string().contains("with_meen"));
    }
}
