use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{PypeError, Result};
use crate::model::Estimator;
use crate::pipeline::Operator;
use crate::type_checker::TypeCheckerRegistry;

/// Constructor arguments for operators and estimators.
pub type Parameters = Map<String, Value>;

type Constructor<T> = Arc<dyn Fn(Parameters) -> Result<Box<T>> + Send + Sync>;

/// A named constructor for one kind of component.
pub struct Factory<T: ?Sized> {
    kind: String,
    constructor: Constructor<T>,
}

impl<T: ?Sized> Factory<T> {
    pub fn new<F>(kind: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(Parameters) -> Result<Box<T>> + Send + Sync + 'static,
    {
        Self {
            kind: kind.into(),
            constructor: Arc::new(constructor),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn create(&self, params: Parameters) -> Result<Box<T>> {
        (self.constructor)(params)
    }
}

impl<T: ?Sized> Clone for Factory<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            constructor: self.constructor.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Factory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factory").field("kind", &self.kind).finish()
    }
}

pub struct FactoryRegistry<T: ?Sized> {
    label: &'static str,
    factories: HashMap<String, Factory<T>>,
}

impl<T: ?Sized> FactoryRegistry<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(Parameters) -> Result<Box<T>> + Send + Sync + 'static,
    {
        let name = name.into();
        self.factories
            .insert(name.clone(), Factory::new(name, constructor));
    }

    pub fn factory(&self, name: &str) -> Result<Factory<T>> {
        self.factories.get(name).cloned().ok_or_else(|| {
            PypeError::config(format!(
                "Unknown {} '{}'. Available: {}",
                self.label,
                name,
                self.known().join(", ")
            ))
        })
    }

    pub fn create(&self, name: &str, params: Parameters) -> Result<Box<T>> {
        self.factory(name)?.create(params)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn known(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

pub type OperatorRegistry = FactoryRegistry<dyn Operator>;
pub type EstimatorRegistry = FactoryRegistry<dyn Estimator>;

/// Every component table needed to build or restore an experiment.
pub struct Registry {
    pub operators: OperatorRegistry,
    pub estimators: EstimatorRegistry,
    pub type_checkers: TypeCheckerRegistry,
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            operators: OperatorRegistry::new("operator"),
            estimators: EstimatorRegistry::new("estimator"),
            type_checkers: TypeCheckerRegistry::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        crate::operators::register_defaults(&mut registry.operators);
        crate::model::estimators::register_defaults(&mut registry.estimators);
        registry.type_checkers = TypeCheckerRegistry::with_defaults();
        registry
    }
}

pub(crate) fn take_string(params: &mut Parameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

pub(crate) fn take_string_list(params: &mut Parameters, key: &str) -> Result<Option<Vec<String>>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(PypeError::config(format!(
                    "`{key}` must be a list of strings, got {other}"
                ))),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(Value::String(s)) => Ok(Some(
            s.split(',')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(str::to_string)
                .collect(),
        )),
        Some(other) => Err(PypeError::config(format!(
            "`{key}` must be a list of strings, got {other}"
        ))),
    }
}

pub(crate) fn take_f64(params: &mut Parameters, key: &str) -> Result<Option<f64>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value_as_f64(&value)
            .map(Some)
            .ok_or_else(|| PypeError::config(format!("`{key}` must be a number, got {value}"))),
    }
}

pub(crate) fn take_u64(params: &mut Parameters, key: &str) -> Result<Option<u64>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value_as_u64(&value).map(Some).ok_or_else(|| {
            PypeError::config(format!("`{key}` must be a non-negative integer, got {value}"))
        }),
    }
}

pub(crate) fn take_bool(params: &mut Parameters, key: &str) -> Result<Option<bool>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value_as_bool(&value)
            .map(Some)
            .ok_or_else(|| PypeError::config(format!("`{key}` must be a boolean, got {value}"))),
    }
}

/// Fails when `params` still holds keys the constructor did not consume.
pub(crate) fn ensure_consumed(kind: &str, params: &Parameters) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let mut keys: Vec<_> = params.keys().map(String::as_str).collect();
    keys.sort_unstable();
    Err(PypeError::config(format!(
        "{kind} got unexpected parameter(s): {}",
        keys.join(", ")
    )))
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(num) => num.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(num) => num.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(num) => num.as_u64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_operator_lists_available_kinds() {
        let registry = Registry::with_defaults();
        let err = registry
            .operators
            .create("does_not_exist", Parameters::new())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Unknown operator 'does_not_exist'"));
        assert!(message.contains("standard_scaler"));
    }

    #[test]
    fn parameter_helpers_accept_string_forms() {
        let mut params = Parameters::new();
        params.insert("rate".into(), json!("0.5"));
        params.insert("flag".into(), json!("off"));
        params.insert("cols".into(), json!("a, b"));
        assert_eq!(take_f64(&mut params, "rate").unwrap(), Some(0.5));
        assert_eq!(take_bool(&mut params, "flag").unwrap(), Some(false));
        assert_eq!(
            take_string_list(&mut params, "cols").unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert!(ensure_consumed("test", &params).is_ok());
    }

    #[test]
    fn leftover_parameters_are_rejected() {
        let mut params = Parameters::new();
        params.insert("typo".into(), json!(1));
        let err = ensure_consumed("standard_scaler", &params).unwrap_err();
        assert!(err.to_string().contains("typo"));
    }
}
