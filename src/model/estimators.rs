use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Estimator;
use crate::data::{Column, Data, Frame, Scalar};
use crate::error::{PypeError, Result};
use crate::registry::{EstimatorRegistry, Parameters, ensure_consumed, take_bool, take_f64, take_u64};

pub fn register_defaults(registry: &mut EstimatorRegistry) {
    registry.register("mean", |params| Ok(Box::new(MeanEstimator::from_params(params)?)));
    registry.register("linear_regression", |params| {
        Ok(Box::new(LinearRegression::from_params(params)?))
    });
    registry.register("majority_class", |params| {
        Ok(Box::new(MajorityClass::from_params(params)?))
    });
}

/// Column name of a single-column frame target, `None` for arrays.
type TargetName = Option<String>;

/// Predicts `mean(y) + a` for every row, one value per target.
#[derive(Debug, Default)]
struct MeanEstimator {
    a: f64,
    fitted: Vec<MeanState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MeanState {
    name: TargetName,
    mean: f64,
}

impl MeanEstimator {
    const KIND: &'static str = "mean";

    fn from_params(mut params: Parameters) -> Result<Self> {
        let a = take_f64(&mut params, "a")?.unwrap_or(0.0);
        ensure_consumed(Self::KIND, &params)?;
        Ok(Self {
            a,
            fitted: Vec::new(),
        })
    }
}

impl Estimator for MeanEstimator {
    fn fit(&mut self, _inputs: &[&Data], targets: &[&Data], _rng: &mut StdRng) -> Result<()> {
        self.fitted = targets
            .iter()
            .map(|target| {
                let (name, column) = target_column(Self::KIND, target)?;
                let values = numeric(Self::KIND, column)?;
                if values.is_empty() {
                    return Err(PypeError::operator(Self::KIND, "cannot fit on an empty target"));
                }
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                Ok(MeanState { name, mean })
            })
            .collect::<Result<_>>()?;
        Ok(())
    }

    fn predict(&self, inputs: &[&Data]) -> Result<Vec<Data>> {
        let rows = row_count(Self::KIND, inputs)?;
        self.fitted
            .iter()
            .map(|state| wrap_target(&state.name, Column::Float(vec![state.mean + self.a; rows])))
            .collect()
    }

    fn state(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.fitted)?)
    }

    fn restore(&mut self, state: Value) -> Result<()> {
        self.fitted = serde_json::from_value(state)?;
        Ok(())
    }
}

/// Least squares fitted by mini-batch gradient descent. Rows are shuffled
/// every epoch with the model's seeded RNG.
#[derive(Debug)]
struct LinearRegression {
    learning_rate: f64,
    epochs: u64,
    batch_size: usize,
    fit_intercept: bool,
    fitted: Option<LinearState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LinearState {
    name: TargetName,
    weights: Vec<f64>,
    bias: f64,
}

impl LinearRegression {
    const KIND: &'static str = "linear_regression";

    fn from_params(mut params: Parameters) -> Result<Self> {
        let learning_rate = take_f64(&mut params, "learning_rate")?.unwrap_or(0.01);
        let epochs = take_u64(&mut params, "epochs")?.unwrap_or(200);
        let batch_size = take_u64(&mut params, "batch_size")?.unwrap_or(16) as usize;
        let fit_intercept = take_bool(&mut params, "fit_intercept")?.unwrap_or(true);
        ensure_consumed(Self::KIND, &params)?;
        if learning_rate.is_nan() || learning_rate <= 0.0 {
            return Err(PypeError::config("learning_rate must be positive"));
        }
        if batch_size == 0 {
            return Err(PypeError::config("batch_size must be at least 1"));
        }
        Ok(Self {
            learning_rate,
            epochs,
            batch_size,
            fit_intercept,
            fitted: None,
        })
    }
}

impl Estimator for LinearRegression {
    fn fit(&mut self, inputs: &[&Data], targets: &[&Data], rng: &mut StdRng) -> Result<()> {
        let features = feature_matrix(Self::KIND, inputs)?;
        let [target] = targets else {
            return Err(PypeError::operator(Self::KIND, "expects exactly one target"));
        };
        let (name, column) = target_column(Self::KIND, target)?;
        let y = numeric(Self::KIND, column)?;
        if features.len() != y.len() {
            return Err(PypeError::operator(
                Self::KIND,
                format!("{} feature rows but {} targets", features.len(), y.len()),
            ));
        }
        if y.is_empty() {
            return Err(PypeError::operator(Self::KIND, "cannot fit on an empty dataset"));
        }

        let n_features = features[0].len();
        let mut weights = vec![0.0; n_features];
        let mut bias = 0.0;
        let mut indices: Vec<usize> = (0..y.len()).collect();
        for _ in 0..self.epochs {
            indices.shuffle(rng);
            for batch in indices.chunks(self.batch_size) {
                let mut grad_w = vec![0.0; n_features];
                let mut grad_b = 0.0;
                for &row in batch {
                    let error = dot(&weights, &features[row]) + bias - y[row];
                    for (g, x) in grad_w.iter_mut().zip(&features[row]) {
                        *g += error * x;
                    }
                    grad_b += error;
                }
                let scale = self.learning_rate / batch.len() as f64;
                for (w, g) in weights.iter_mut().zip(&grad_w) {
                    *w -= scale * g;
                }
                if self.fit_intercept {
                    bias -= scale * grad_b;
                }
            }
        }
        if weights.iter().any(|w| !w.is_finite()) || !bias.is_finite() {
            return Err(PypeError::operator(
                Self::KIND,
                "gradient descent diverged; lower learning_rate or scale the features",
            ));
        }
        self.fitted = Some(LinearState {
            name,
            weights,
            bias,
        });
        Ok(())
    }

    fn predict(&self, inputs: &[&Data]) -> Result<Vec<Data>> {
        let state = self
            .fitted
            .as_ref()
            .ok_or_else(|| PypeError::UnfittedOperator(Self::KIND.to_string()))?;
        let features = feature_matrix(Self::KIND, inputs)?;
        let predictions = features
            .iter()
            .map(|row| {
                if row.len() != state.weights.len() {
                    return Err(PypeError::operator(
                        Self::KIND,
                        format!("expected {} features, got {}", state.weights.len(), row.len()),
                    ));
                }
                Ok(dot(&state.weights, row) + state.bias)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(vec![wrap_target(&state.name, Column::Float(predictions))?])
    }

    fn state(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.fitted)?)
    }

    fn restore(&mut self, state: Value) -> Result<()> {
        self.fitted = serde_json::from_value(state)?;
        Ok(())
    }
}

/// Predicts the most frequent training label. Ties go to the label that
/// sorts first.
#[derive(Debug, Default)]
struct MajorityClass {
    fitted: Vec<MajorityState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MajorityState {
    name: TargetName,
    label: Scalar,
}

impl MajorityClass {
    const KIND: &'static str = "majority_class";

    fn from_params(params: Parameters) -> Result<Self> {
        ensure_consumed(Self::KIND, &params)?;
        Ok(Self::default())
    }
}

impl Estimator for MajorityClass {
    fn fit(&mut self, _inputs: &[&Data], targets: &[&Data], _rng: &mut StdRng) -> Result<()> {
        self.fitted = targets
            .iter()
            .map(|target| {
                let (name, column) = target_column(Self::KIND, target)?;
                let mut counts: BTreeMap<String, (usize, usize)> = BTreeMap::new();
                for (idx, label) in column.to_labels().into_iter().enumerate() {
                    counts.entry(label).or_insert((0, idx)).0 += 1;
                }
                let (_, (_, first_idx)) = counts
                    .iter()
                    .fold(None, |best: Option<(&String, &(usize, usize))>, entry| match best {
                        Some(current) if current.1.0 >= entry.1.0 => Some(current),
                        _ => Some(entry),
                    })
                    .ok_or_else(|| {
                        PypeError::operator(Self::KIND, "cannot fit on an empty target")
                    })?;
                let label = column.get(*first_idx).ok_or_else(|| {
                    PypeError::operator(Self::KIND, "label index out of range")
                })?;
                Ok(MajorityState { name, label })
            })
            .collect::<Result<_>>()?;
        Ok(())
    }

    fn predict(&self, inputs: &[&Data]) -> Result<Vec<Data>> {
        let rows = row_count(Self::KIND, inputs)?;
        self.fitted
            .iter()
            .map(|state| {
                let column = Column::from_scalars(state.label.dtype(), vec![state.label.clone(); rows])
                    .ok_or_else(|| PypeError::operator(Self::KIND, "inconsistent label type"))?;
                wrap_target(&state.name, column)
            })
            .collect()
    }

    fn state(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.fitted)?)
    }

    fn restore(&mut self, state: Value) -> Result<()> {
        self.fitted = serde_json::from_value(state)?;
        Ok(())
    }
}

fn target_column<'a>(kind: &str, data: &'a Data) -> Result<(TargetName, &'a Column)> {
    match data {
        Data::Array(column) => Ok((None, column)),
        Data::Frame(frame) if frame.n_cols() == 1 => frame
            .columns()
            .next()
            .map(|series| (Some(series.name.clone()), &series.values))
            .ok_or_else(|| PypeError::operator(kind, "empty target frame")),
        other => Err(PypeError::operator(
            kind,
            format!("target must be an array or a single-column frame, got {}", other.kind()),
        )),
    }
}

fn wrap_target(name: &TargetName, column: Column) -> Result<Data> {
    match name {
        None => Ok(Data::Array(column)),
        Some(name) => Ok(Data::Frame(Frame::new(vec![(name.clone(), column)])?)),
    }
}

fn numeric(kind: &str, column: &Column) -> Result<Vec<f64>> {
    column
        .to_f64()
        .ok_or_else(|| PypeError::operator(kind, format!("{} values are not numeric", column.dtype())))
}

/// Row-major features from every input, concatenated column-wise.
fn feature_matrix(kind: &str, inputs: &[&Data]) -> Result<Vec<Vec<f64>>> {
    let rows = row_count(kind, inputs)?;
    let mut matrix = vec![Vec::new(); rows];
    for input in inputs {
        let block = match input {
            Data::Frame(frame) => frame
                .to_matrix()
                .ok_or_else(|| PypeError::operator(kind, "frame has non-numeric columns"))?,
            Data::Array(column) => numeric(kind, column)?.into_iter().map(|x| vec![x]).collect(),
            other => {
                return Err(PypeError::operator(
                    kind,
                    format!("cannot use {} data as features", other.kind()),
                ));
            }
        };
        if block.len() != rows {
            return Err(PypeError::operator(kind, "inputs have different row counts"));
        }
        for (row, values) in matrix.iter_mut().zip(block) {
            row.extend(values);
        }
    }
    Ok(matrix)
}

fn row_count(kind: &str, inputs: &[&Data]) -> Result<usize> {
    inputs
        .first()
        .and_then(|data| data.n_rows())
        .ok_or_else(|| PypeError::operator(kind, "inputs must be row-shaped"))
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use rand::SeedableRng;
    use serde_json::json;

    fn create(kind: &str, params: Value) -> Box<dyn Estimator> {
        let params = params.as_object().cloned().unwrap_or_default();
        Registry::with_defaults().estimators.create(kind, params).unwrap()
    }

    #[test]
    fn mean_keeps_frame_targets_as_frames() {
        let mut estimator = create("mean", json!({"a": 1}));
        let x = Data::from(vec![1.0, 2.0]);
        let y = Data::Frame(Frame::new(vec![("target", Column::Int(vec![2, 4]))]).unwrap());
        estimator
            .fit(&[&x], &[&y], &mut StdRng::seed_from_u64(0))
            .unwrap();
        let out = estimator.predict(&[&x]).unwrap();
        let frame = out[0].as_frame().unwrap();
        assert_eq!(frame.column("target"), Some(&Column::Float(vec![4.0, 4.0])));
    }

    #[test]
    fn linear_regression_recovers_a_line() {
        let mut estimator = create("linear_regression", json!({"learning_rate": 0.05, "epochs": 1000, "batch_size": 4}));
        let xs: Vec<f64> = (0..10).map(|i| i as f64 / 10.0).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 2.0 * x + 1.0).collect();
        let x = Data::from(xs);
        let y = Data::from(ys);
        estimator
            .fit(&[&x], &[&y], &mut StdRng::seed_from_u64(42))
            .unwrap();
        let point = Data::from(vec![0.5]);
        let Data::Array(Column::Float(pred)) = &estimator.predict(&[&point]).unwrap()[0] else {
            panic!("expected float predictions");
        };
        assert!((pred[0] - 2.0).abs() < 0.05, "prediction {}", pred[0]);
    }

    #[test]
    fn linear_regression_is_deterministic_per_seed() {
        let x = Data::from(vec![0.0, 0.3, 0.6, 0.9, 1.2]);
        let y = Data::from(vec![1.0, 0.0, 2.0, 1.0, 3.0]);
        let fit = |seed| {
            let mut estimator = create("linear_regression", json!({"epochs": 20, "batch_size": 2}));
            estimator
                .fit(&[&x], &[&y], &mut StdRng::seed_from_u64(seed))
                .unwrap();
            estimator.state().unwrap()
        };
        assert_eq!(fit(3), fit(3));
    }

    #[test]
    fn majority_class_breaks_ties_by_label_order() {
        let mut estimator = create("majority_class", json!({}));
        let x = Data::from(vec![0.0, 0.0, 0.0, 0.0]);
        let y = Data::Array(Column::from(vec!["b", "a", "b", "a"]));
        estimator
            .fit(&[&x], &[&y], &mut StdRng::seed_from_u64(0))
            .unwrap();
        let out = estimator.predict(&[&Data::from(vec![1.0, 2.0])]).unwrap();
        assert_eq!(out[0], Data::Array(Column::from(vec!["a", "a"])));
    }
}
