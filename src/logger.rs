use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use crate::data::source::with_path;
use crate::error::{PypeError, Result};
use crate::evaluate::Metrics;
use crate::serialiser::Serialiser;

pub const METRICS_FILE: &str = "metrics.json";
pub const PARAMETERS_FILE: &str = "parameters.json";

/// Records one experiment run.
pub trait ExperimentLogger: Send + fmt::Debug {
    fn open(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    /// Folder that receives the run's artifacts.
    fn artifact_folder(&self) -> &Path;

    fn log_metrics(&mut self, dataset: &str, metrics: &BTreeMap<String, f64>) -> Result<()>;

    fn log_parameters(&mut self, parameters: &BTreeMap<String, Value>) -> Result<()>;

    /// Copies an auxiliary file next to the artifacts and returns its new
    /// path relative to the artifact folder.
    fn log_file(&mut self, path: &Path) -> Result<PathBuf>;

    fn log_artifact(&mut self, name: &str, value: &Value, serialiser: &dyn Serialiser) -> Result<PathBuf>;
}

/// Writes everything below a local folder.
#[derive(Debug)]
pub struct LocalLogger {
    folder: PathBuf,
    metrics: Metrics,
    parameters: BTreeMap<String, Value>,
    open: bool,
}

impl LocalLogger {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            metrics: Metrics::new(),
            parameters: BTreeMap::new(),
            open: false,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(PypeError::config("logger used outside an open run"))
        }
    }

    fn write_json(&self, name: &str, value: &Value) -> Result<()> {
        let path = self.folder.join(name);
        fs::write(&path, serde_json::to_string_pretty(value)?).map_err(|err| with_path(err, &path))
    }
}

impl ExperimentLogger for LocalLogger {
    fn open(&mut self) -> Result<()> {
        fs::create_dir_all(&self.folder).map_err(|err| with_path(err, &self.folder))?;
        self.metrics.clear();
        self.parameters.clear();
        self.open = true;
        info!(folder = %self.folder.display(), "Experiment run opened");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.write_json(METRICS_FILE, &serde_json::to_value(&self.metrics)?)?;
        self.write_json(PARAMETERS_FILE, &serde_json::to_value(&self.parameters)?)?;
        info!(folder = %self.folder.display(), "Experiment run closed");
        Ok(())
    }

    fn artifact_folder(&self) -> &Path {
        &self.folder
    }

    fn log_metrics(&mut self, dataset: &str, metrics: &BTreeMap<String, f64>) -> Result<()> {
        self.ensure_open()?;
        self.metrics
            .entry(dataset.to_string())
            .or_default()
            .extend(metrics.iter().map(|(name, value)| (name.clone(), *value)));
        Ok(())
    }

    fn log_parameters(&mut self, parameters: &BTreeMap<String, Value>) -> Result<()> {
        self.ensure_open()?;
        self.parameters
            .extend(parameters.iter().map(|(key, value)| (key.clone(), value.clone())));
        Ok(())
    }

    fn log_file(&mut self, path: &Path) -> Result<PathBuf> {
        self.ensure_open()?;
        let file_name = path
            .file_name()
            .ok_or_else(|| PypeError::config(format!("`{}` is not a file", path.display())))?;
        let relative = PathBuf::from("extra_files").join(file_name);
        let destination = self.folder.join(&relative);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|err| with_path(err, parent))?;
        }
        fs::copy(path, &destination).map_err(|err| with_path(err, path))?;
        Ok(relative)
    }

    fn log_artifact(&mut self, name: &str, value: &Value, serialiser: &dyn Serialiser) -> Result<PathBuf> {
        self.ensure_open()?;
        let path = self.folder.join(name);
        serialiser.serialise(value, &path)?;
        Ok(path)
    }
}

/// Keeps a logger open for its lifetime and closes it when dropped, so an
/// early return through `?` still flushes the run.
pub struct LoggerScope<'a> {
    logger: &'a mut dyn ExperimentLogger,
    closed: bool,
}

impl<'a> LoggerScope<'a> {
    pub fn open(logger: &'a mut dyn ExperimentLogger) -> Result<Self> {
        logger.open()?;
        Ok(Self {
            logger,
            closed: false,
        })
    }

    pub fn logger(&mut self) -> &mut dyn ExperimentLogger {
        &mut *self.logger
    }

    /// Closes the logger, surfacing any error from the final flush.
    pub fn finish(mut self) -> Result<()> {
        self.closed = true;
        self.logger.close()
    }
}

impl Drop for LoggerScope<'_> {
    fn drop(&mut self) {
        if !self.closed
            && let Err(err) = self.logger.close()
        {
            warn!(error = %err, "Failed to close experiment logger");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn dropped_scope_still_writes_metrics() {
        let temp = tempdir().unwrap();
        let mut logger = LocalLogger::new(temp.path().join("run"));
        {
            let mut scope = LoggerScope::open(&mut logger).unwrap();
            scope
                .logger()
                .log_metrics("test", &BTreeMap::from([("mse".to_string(), 0.25)]))
                .unwrap();
        }
        let written: Value =
            serde_json::from_str(&fs::read_to_string(temp.path().join("run").join(METRICS_FILE)).unwrap())
                .unwrap();
        assert_eq!(written["test"]["mse"], 0.25);
    }

    #[test]
    fn closed_logger_rejects_writes() {
        let temp = tempdir().unwrap();
        let mut logger = LocalLogger::new(temp.path());
        assert!(logger.log_parameters(&BTreeMap::new()).is_err());
    }

    #[test]
    fn extra_files_are_copied_under_the_run() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("notes.txt");
        fs::write(&source, "hello").unwrap();
        let mut logger = LocalLogger::new(temp.path().join("out"));
        logger.open().unwrap();
        let relative = logger.log_file(&source).unwrap();
        assert_eq!(relative, PathBuf::from("extra_files/notes.txt"));
        assert_eq!(
            fs::read_to_string(temp.path().join("out").join(&relative)).unwrap(),
            "hello"
        );
    }
}
