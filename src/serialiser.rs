use std::fmt;
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::data::source::with_path;
use crate::error::Result;

/// Encodes artifacts to and from files.
pub trait Serialiser: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn serialise(&self, value: &Value, path: &Path) -> Result<()>;

    fn deserialise(&self, path: &Path) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerialiser;

impl Serialiser for JsonSerialiser {
    fn name(&self) -> &'static str {
        "json"
    }

    fn serialise(&self, value: &Value, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let rendered = serde_json::to_string_pretty(value)?;
        fs::write(path, rendered).map_err(|err| with_path(err, path))?;
        Ok(())
    }

    fn deserialise(&self, path: &Path) -> Result<Value> {
        let content = fs::read_to_string(path).map_err(|err| with_path(err, path))?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct YamlSerialiser;

impl Serialiser for YamlSerialiser {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn serialise(&self, value: &Value, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let rendered = serde_yaml::to_string(value)?;
        fs::write(path, rendered).map_err(|err| with_path(err, path))?;
        Ok(())
    }

    fn deserialise(&self, path: &Path) -> Result<Value> {
        let content = fs::read_to_string(path).map_err(|err| with_path(err, path))?;
        Ok(serde_yaml::from_str(&content)?)
    }
}

/// Serialiser choice as written in recipes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialiserKind {
    #[default]
    Json,
    Yaml,
}

impl SerialiserKind {
    pub fn build(self) -> Box<dyn Serialiser> {
        match self {
            Self::Json => Box::new(JsonSerialiser),
            Self::Yaml => Box::new(YamlSerialiser),
        }
    }

    /// Guesses the encoding of an existing artifact from its first byte.
    pub fn detect(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|err| with_path(err, path))?;
        Ok(match content.trim_start().chars().next() {
            Some('{') | Some('[') => Self::Json,
            _ => Self::Yaml,
        })
    }
}

pub fn serialise_as<T: Serialize>(serialiser: &dyn Serialiser, object: &T, path: &Path) -> Result<()> {
    serialiser.serialise(&serde_json::to_value(object)?, path)
}

pub fn deserialise_as<T: DeserializeOwned>(serialiser: &dyn Serialiser, path: &Path) -> Result<T> {
    Ok(serde_json::from_value(serialiser.deserialise(path)?)?)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|err| with_path(err, parent))?;
    }
    Ok(())
}
