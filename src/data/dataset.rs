use std::collections::BTreeMap;
use std::collections::btree_map;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::source::DataSource;
use super::Data;
use crate::error::{PypeError, Result};

/// Named data values flowing through a pipeline run.
///
/// Keys are kept sorted so that iteration and serialised output are
/// deterministic; insertion order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSet {
    values: BTreeMap<String, Data>,
}

impl DataSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Data> {
        self.values.iter()
    }

    pub fn get(&self, key: &str) -> Option<&Data> {
        self.values.get(key)
    }

    pub fn require(&self, key: &str) -> Result<&Data> {
        self.values
            .get(key)
            .ok_or_else(|| PypeError::KeyNotFound(key.to_string()))
    }

    pub fn insert(&mut self, key: impl Into<String>, data: impl Into<Data>) -> Option<Data> {
        self.values.insert(key.into(), data.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Data> {
        self.values.remove(key)
    }

    /// Returns the values for `keys`, in the order given.
    pub fn get_all<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<&Data>> {
        keys.iter().map(|key| self.require(key.as_ref())).collect()
    }

    /// Stores `values` under `keys`, pairwise.
    ///
    /// Lengths must match; on a mismatch nothing is written.
    pub fn set_all<K: AsRef<str>>(&mut self, keys: &[K], values: Vec<Data>) -> Result<()> {
        if keys.len() != values.len() {
            return Err(PypeError::LengthMismatch {
                keys: keys.len(),
                values: values.len(),
            });
        }
        for (key, value) in keys.iter().zip(values) {
            self.values.insert(key.as_ref().to_string(), value);
        }
        Ok(())
    }

    /// Copies every entry of `other` into this DataSet, overwriting.
    pub fn merge(&mut self, other: DataSet) {
        self.values.extend(other.values);
    }

    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(PypeError::config(
                "a DataSet must be a JSON object of named values",
            ));
        };
        Ok(map
            .into_iter()
            .map(|(key, value)| (key, Data::from_json(value)))
            .collect())
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (key, data) in &self.values {
            map.insert(key.clone(), data.to_json());
        }
        Value::Object(map)
    }
}

impl FromIterator<(String, Data)> for DataSet {
    fn from_iter<T: IntoIterator<Item = (String, Data)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a DataSet {
    type Item = (&'a String, &'a Data);
    type IntoIter = btree_map::Iter<'a, String, Data>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

/// A collection of sources that together form a DataSet when read.
#[derive(Debug, Default)]
pub struct DataSetSource {
    sources: BTreeMap<String, Box<dyn DataSource>>,
}

impl DataSetSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, source: impl DataSource + 'static) -> Self {
        self.insert(key, Box::new(source));
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, source: Box<dyn DataSource>) {
        self.sources.insert(key.into(), source);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Reads every source. The first failure aborts the read.
    pub fn read(&self) -> Result<DataSet> {
        let mut dataset = DataSet::new();
        for (name, source) in &self.sources {
            debug!(source = name.as_str(), "Reading data source");
            dataset.insert(name.clone(), source.read()?);
        }
        Ok(dataset)
    }
}
