use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PypeError, Result};
use crate::registry::Parameters;

/// Separator of the flat `pipeline__pipe__arg` notation.
pub const SEPARATOR: &str = "__";

/// Re-instantiation parameters addressed by node path.
///
/// `values` holds the arguments for the node at this level; `children`
/// holds the trees for named sub-nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct ParameterTree {
    values: Parameters,
    children: BTreeMap<String, ParameterTree>,
}

impl ParameterTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses flat entries such as `pipeline__scale__with_mean`.
    pub fn from_flat<I, K>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let mut tree = Self::new();
        for (key, value) in entries {
            tree.insert_flat(key.as_ref(), value)?;
        }
        Ok(tree)
    }

    /// Parses a nested mapping. Objects become child nodes, anything else
    /// is an argument at the current level. The tree cannot tell a node
    /// from a map-valued argument; consumers that know they are at a leaf
    /// read [`ParameterTree::arguments`] instead of [`ParameterTree::values`].
    pub fn from_nested(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => {
                let mut tree = Self::new();
                for (key, value) in map {
                    match value {
                        Value::Object(_) => {
                            tree.children.insert(key, Self::from_nested(value)?);
                        }
                        other => {
                            tree.values.insert(key, other);
                        }
                    }
                }
                Ok(tree)
            }
            other => Err(PypeError::config(format!(
                "parameters must be a mapping, got {other}"
            ))),
        }
    }

    pub fn insert_flat(&mut self, key: &str, value: Value) -> Result<()> {
        let segments: Vec<&str> = key.split(SEPARATOR).collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(PypeError::config(format!("malformed parameter path `{key}`")));
        }
        let Some((arg, path)) = segments.split_last() else {
            return Err(PypeError::config("empty parameter path"));
        };
        self.set(path, arg, value);
        Ok(())
    }

    pub fn set(&mut self, path: &[&str], arg: &str, value: Value) {
        let mut node = self;
        for segment in path {
            node = node.children.entry((*segment).to_string()).or_default();
        }
        node.values.insert(arg.to_string(), value);
    }

    pub fn values(&self) -> &Parameters {
        &self.values
    }

    /// Arguments for a leaf node: plain values plus every child folded back
    /// into a map-valued argument.
    pub fn arguments(&self) -> Parameters {
        let mut arguments = self.values.clone();
        for (name, tree) in &self.children {
            arguments.insert(name.clone(), tree.to_nested());
        }
        arguments
    }

    pub fn child(&self, name: &str) -> Option<&ParameterTree> {
        self.children.get(name)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &ParameterTree)> {
        self.children.iter().map(|(name, tree)| (name.as_str(), tree))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.children.values().all(ParameterTree::is_empty)
    }

    /// Lays `other` over `self`; on conflicts `other` wins.
    pub fn merge(&mut self, other: ParameterTree) {
        for (key, value) in other.values {
            self.values.insert(key, value);
        }
        for (name, tree) in other.children {
            self.children.entry(name).or_default().merge(tree);
        }
    }

    /// Flattens back into `a__b__arg` keys.
    pub fn to_flat(&self) -> BTreeMap<String, Value> {
        let mut flat = BTreeMap::new();
        self.flatten_into(&mut Vec::new(), &mut flat);
        flat
    }

    fn flatten_into(&self, prefix: &mut Vec<String>, out: &mut BTreeMap<String, Value>) {
        for (arg, value) in &self.values {
            let mut parts = prefix.clone();
            parts.push(arg.clone());
            out.insert(parts.join(SEPARATOR), value.clone());
        }
        for (name, tree) in &self.children {
            prefix.push(name.clone());
            tree.flatten_into(prefix, out);
            prefix.pop();
        }
    }

    pub fn to_nested(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.values {
            map.insert(key.clone(), value.clone());
        }
        for (name, tree) in &self.children {
            map.insert(name.clone(), tree.to_nested());
        }
        Value::Object(map)
    }
}

impl TryFrom<Value> for ParameterTree {
    type Error = PypeError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_nested(value)
    }
}

impl From<ParameterTree> for Value {
    fn from(tree: ParameterTree) -> Self {
        tree.to_nested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flat_keys_build_nested_paths() {
        let tree = ParameterTree::from_flat([
            ("pipeline__scale__with_mean", json!(false)),
            ("model__a", json!(3.0)),
        ])
        .unwrap();
        let scale = tree.child("pipeline").and_then(|p| p.child("scale")).unwrap();
        assert_eq!(scale.values().get("with_mean"), Some(&json!(false)));
        assert_eq!(tree.child("model").unwrap().values().get("a"), Some(&json!(3.0)));
    }

    #[test]
    fn empty_segments_are_rejected() {
        assert!(ParameterTree::from_flat([("pipeline____a", json!(1))]).is_err());
    }

    #[test]
    fn nested_yaml_matches_flat_form() {
        let nested: ParameterTree =
            serde_yaml::from_str("pipeline:\n  scale:\n    with_mean: false\n").unwrap();
        let flat = ParameterTree::from_flat([("pipeline__scale__with_mean", json!(false))]).unwrap();
        assert_eq!(nested, flat);
        assert_eq!(
            flat.to_flat().keys().collect::<Vec<_>>(),
            vec!["pipeline__scale__with_mean"]
        );
    }

    #[test]
    fn leaf_arguments_keep_map_values_intact() {
        let tree: ParameterTree =
            serde_yaml::from_str("with_mean: false\nbins:\n  low: 1\n  high: 9\n").unwrap();
        let arguments = tree.arguments();
        assert_eq!(arguments.get("with_mean"), Some(&json!(false)));
        assert_eq!(arguments.get("bins"), Some(&json!({"low": 1, "high": 9})));
        assert!(tree.values().get("bins").is_none());
    }

    #[test]
    fn merge_prefers_overrides() {
        let mut base = ParameterTree::from_flat([("model__a", json!(1)), ("model__b", json!(2))]).unwrap();
        base.merge(ParameterTree::from_flat([("model__a", json!(5))]).unwrap());
        let model = base.child("model").unwrap().values();
        assert_eq!(model.get("a"), Some(&json!(5)));
        assert_eq!(model.get("b"), Some(&json!(2)));
    }
}
