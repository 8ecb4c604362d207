use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Data;
use crate::error::{PypeError, Result};

/// Loads one data value at the system boundary.
pub trait DataSource: Send + Sync + fmt::Debug {
    fn read(&self) -> Result<Data>;
}

/// Stores one data value at the system boundary.
pub trait DataSink: Send + Sync + fmt::Debug {
    fn write(&self, data: &Data) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct InMemorySource {
    data: Data,
}

impl InMemorySource {
    pub fn new(data: impl Into<Data>) -> Self {
        Self { data: data.into() }
    }
}

impl DataSource for InMemorySource {
    fn read(&self) -> Result<Data> {
        Ok(self.data.clone())
    }
}

/// Reads a natural JSON document, see [`Data::from_json`].
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DataSource for JsonFileSource {
    fn read(&self) -> Result<Data> {
        let content = fs::read_to_string(&self.path).map_err(|err| with_path(err, &self.path))?;
        let value: Value = serde_json::from_str(&content)?;
        Ok(Data::from_json(value))
    }
}

#[derive(Debug, Clone)]
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DataSink for JsonFileSink {
    fn write(&self, data: &Data) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| with_path(err, parent))?;
        }
        let rendered = serde_json::to_string_pretty(&data.to_json())?;
        fs::write(&self.path, rendered).map_err(|err| with_path(err, &self.path))?;
        Ok(())
    }
}

/// Appends one JSON document per line, for request tracking.
#[derive(Debug, Clone)]
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DataSink for JsonLinesSink {
    fn write(&self, data: &Data) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| with_path(err, parent))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| with_path(err, &self.path))?;
        let mut line = serde_json::to_string(&data.to_json())?;
        line.push('\n');
        file.write_all(line.as_bytes())
            .map_err(|err| with_path(err, &self.path))
    }
}

/// Keeps every written value in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    written: Mutex<Vec<Data>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> Vec<Data> {
        self.written.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl DataSink for MemorySink {
    fn write(&self, data: &Data) -> Result<()> {
        self.written
            .lock()
            .map_err(|_| PypeError::config("memory sink lock poisoned"))?
            .push(data.clone());
        Ok(())
    }
}

/// Recipe-level description of a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    Json { path: PathBuf },
    Inline { data: Value },
}

impl SourceSpec {
    /// Relative paths resolve against `base_dir` when given.
    pub fn build(&self, base_dir: Option<&Path>) -> Box<dyn DataSource> {
        match self {
            Self::Json { path } => Box::new(JsonFileSource::new(resolve(path, base_dir))),
            Self::Inline { data } => Box::new(InMemorySource::new(Data::from_json(data.clone()))),
        }
    }
}

/// Recipe-level description of a tracking sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkSpec {
    Json { path: PathBuf },
    JsonLines { path: PathBuf },
}

impl SinkSpec {
    pub fn build(&self, base_dir: Option<&Path>) -> Box<dyn DataSink> {
        match self {
            Self::Json { path } => Box::new(JsonFileSink::new(resolve(path, base_dir))),
            Self::JsonLines { path } => Box::new(JsonLinesSink::new(resolve(path, base_dir))),
        }
    }
}

fn resolve(path: &Path, base_dir: Option<&Path>) -> PathBuf {
    match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

pub(crate) fn with_path(err: std::io::Error, path: &Path) -> PypeError {
    PypeError::Io(std::io::Error::new(
        err.kind(),
        format!("{}: {err}", path.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Column;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn json_sink_output_reads_back_through_source() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested/y.json");
        let data = Data::Array(Column::Float(vec![1.5, 2.5]));

        JsonFileSink::new(&path).write(&data).unwrap();
        let read = JsonFileSource::new(&path).read().unwrap();
        assert_eq!(read, data);
    }

    #[test]
    fn inline_spec_builds_in_memory_source() {
        let spec: SourceSpec = serde_yaml::from_str("type: inline\ndata: [1, 2, 3]\n").unwrap();
        let data = spec.build(None).read().unwrap();
        assert_eq!(data, Data::from_json(json!([1, 2, 3])));
    }

    #[test]
    fn relative_json_spec_resolves_against_base_dir() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("x.json"), "[true, false]").unwrap();
        let spec = SourceSpec::Json {
            path: PathBuf::from("x.json"),
        };
        let data = spec.build(Some(temp.path())).read().unwrap();
        assert_eq!(data, Data::Array(Column::Bool(vec![true, false])));
    }
}
