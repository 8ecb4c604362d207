use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::{Column, Data, DataSet};
use crate::error::{PypeError, Result};
use crate::model::Model;

/// Metric values keyed by dataset name, then metric name.
pub type Metrics = BTreeMap<String, BTreeMap<String, f64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Mse,
    Mae,
    R2,
    Accuracy,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mse => "mse",
            Self::Mae => "mae",
            Self::R2 => "r2",
            Self::Accuracy => "accuracy",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "mse" | "mean_squared_error" => Ok(Self::Mse),
            "mae" | "mean_absolute_error" => Ok(Self::Mae),
            "r2" | "r2_score" => Ok(Self::R2),
            "accuracy" => Ok(Self::Accuracy),
            other => Err(PypeError::config(format!(
                "Unknown metric '{other}'. Available: mse, mae, r2, accuracy"
            ))),
        }
    }

    fn compute(&self, truth: &Column, predicted: &Column) -> Result<f64> {
        if truth.len() != predicted.len() {
            return Err(PypeError::LengthMismatch {
                keys: truth.len(),
                values: predicted.len(),
            });
        }
        if truth.is_empty() {
            return Err(PypeError::config(format!("cannot compute {self} on no rows")));
        }
        match self {
            Self::Accuracy => Ok(accuracy(truth, predicted)),
            Self::Mse => self.numeric(truth, predicted).map(|(t, p)| mse(&t, &p)),
            Self::Mae => self.numeric(truth, predicted).map(|(t, p)| mae(&t, &p)),
            Self::R2 => self.numeric(truth, predicted).map(|(t, p)| r2(&t, &p)),
        }
    }

    fn numeric(&self, truth: &Column, predicted: &Column) -> Result<(Vec<f64>, Vec<f64>)> {
        match (truth.to_f64(), predicted.to_f64()) {
            (Some(t), Some(p)) => Ok((t, p)),
            _ => Err(PypeError::unsupported(format!(
                "{self} needs numeric values, got {} and {}",
                truth.dtype(),
                predicted.dtype()
            ))),
        }
    }
}

fn accuracy(truth: &Column, predicted: &Column) -> f64 {
    let hits = truth
        .to_labels()
        .iter()
        .zip(predicted.to_labels())
        .filter(|(t, p)| **t == *p)
        .count();
    hits as f64 / truth.len() as f64
}

fn mse(t: &[f64], p: &[f64]) -> f64 {
    t.iter().zip(p).map(|(t, p)| (t - p).powi(2)).sum::<f64>() / t.len() as f64
}

fn mae(t: &[f64], p: &[f64]) -> f64 {
    t.iter().zip(p).map(|(t, p)| (t - p).abs()).sum::<f64>() / t.len() as f64
}

fn r2(t: &[f64], p: &[f64]) -> f64 {
    let mean = t.iter().sum::<f64>() / t.len() as f64;
    let total: f64 = t.iter().map(|v| (v - mean).powi(2)).sum();
    let residual: f64 = t.iter().zip(p).map(|(t, p)| (t - p).powi(2)).sum();
    if total == 0.0 {
        if residual == 0.0 { 1.0 } else { 0.0 }
    } else {
        1.0 - residual / total
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scores a fitted model on labelled datasets.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluator {
    metrics: Vec<Metric>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self {
            metrics: vec![Metric::Mse, Metric::Mae],
        }
    }
}

impl Evaluator {
    pub fn new(metrics: Vec<Metric>) -> Self {
        Self { metrics }
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let metrics = names
            .iter()
            .map(|name| Metric::from_name(name.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { metrics })
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// Predicts on `dataset` and compares against its values at the model's
    /// output keys. With several outputs, names are prefixed `{output}.`.
    pub fn evaluate(&self, model: &Model, dataset: &DataSet) -> Result<BTreeMap<String, f64>> {
        let predicted = model.transform(dataset)?;
        let prefixed = model.outputs().len() > 1;
        let mut scores = BTreeMap::new();
        for output in model.outputs() {
            let truth = single_column(output, dataset.require(output)?)?;
            let guess = single_column(output, predicted.require(output)?)?;
            for metric in &self.metrics {
                let value = metric.compute(truth, guess)?;
                let name = if prefixed {
                    format!("{output}.{metric}")
                } else {
                    metric.to_string()
                };
                scores.insert(name, value);
            }
        }
        debug!(?scores, "Evaluated model");
        Ok(scores)
    }
}

fn single_column<'a>(key: &str, data: &'a Data) -> Result<&'a Column> {
    match data {
        Data::Array(column) => Ok(column),
        Data::Frame(frame) if frame.n_cols() == 1 => frame
            .columns()
            .next()
            .map(|series| &series.values)
            .ok_or_else(|| PypeError::unsupported(format!("`{key}` is an empty frame"))),
        other => Err(PypeError::unsupported(format!(
            "cannot evaluate `{key}`: {} data is not a single column",
            other.kind()
        ))),
    }
}

/// Bounds one metric on one dataset; a violation aborts the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricGate {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_gate_dataset")]
    pub dataset: String,
    pub metric: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

fn default_gate_dataset() -> String {
    "test".to_string()
}

impl MetricGate {
    pub fn label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| format!("{}.{}", self.dataset, self.metric))
    }

    pub fn check(&self, metrics: &Metrics) -> Result<()> {
        let value = metrics
            .get(&self.dataset)
            .and_then(|scores| scores.get(&self.metric))
            .copied()
            .ok_or_else(|| PypeError::GateFailed {
                label: self.label(),
                message: format!("metric `{}` was not computed on `{}`", self.metric, self.dataset),
            })?;
        if let Some(min) = self.min
            && value < min
        {
            return Err(PypeError::GateFailed {
                label: self.label(),
                message: format!("{} {value:.5} < {min:.5}", self.metric),
            });
        }
        if let Some(max) = self.max
            && value > max
        {
            return Err(PypeError::GateFailed {
                label: self.label(),
                message: format!("{} {value:.5} > {max:.5}", self.metric),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regression_metrics() {
        let truth = Column::Float(vec![1.0, 2.0, 3.0]);
        let guess = Column::Float(vec![1.0, 2.0, 5.0]);
        assert_eq!(Metric::Mse.compute(&truth, &guess).unwrap(), 4.0 / 3.0);
        assert_eq!(Metric::Mae.compute(&truth, &guess).unwrap(), 2.0 / 3.0);
        assert_eq!(Metric::R2.compute(&truth, &truth).unwrap(), 1.0);
    }

    #[test]
    fn accuracy_compares_labels() {
        let truth = Column::from(vec!["a", "b", "a", "a"]);
        let guess = Column::from(vec!["a", "a", "a", "a"]);
        assert_eq!(Metric::Accuracy.compute(&truth, &guess).unwrap(), 0.75);
    }

    #[test]
    fn unknown_metric_is_a_configuration_error() {
        let err = Evaluator::from_names(&["mse", "auc"]).unwrap_err();
        assert!(matches!(err, PypeError::Configuration(msg) if msg.contains("auc")));
    }

    #[test]
    fn gates_enforce_bounds() {
        let mut metrics = Metrics::new();
        metrics.insert("test".into(), BTreeMap::from([("mse".to_string(), 0.5)]));
        let gate = MetricGate {
            label: None,
            dataset: "test".into(),
            metric: "mse".into(),
            min: None,
            max: Some(0.25),
        };
        let err = gate.check(&metrics).unwrap_err();
        assert!(matches!(err, PypeError::GateFailed { label, .. } if label == "test.mse"));
        let relaxed = MetricGate {
            max: Some(1.0),
            ..gate
        };
        assert!(relaxed.check(&metrics).is_ok());
    }
}
