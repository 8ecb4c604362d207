use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub total_duration_ms: f64,
    pub gate_passes: u64,
    pub gate_failures: u64,
    pub predictions: u64,
    pub prediction_failures: u64,
}

#[derive(Debug, Default, Serialize, Clone, PartialEq)]
pub struct StageMetrics {
    pub calls: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

/// Shared, cloneable collector of run and serving counters.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Times a stage until the returned guard is dropped.
    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_total_duration(&self, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.total_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn record_gate_pass(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.gate_passes += 1;
        }
    }

    pub fn record_gate_failure(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.gate_failures += 1;
        }
    }

    pub fn record_prediction(&self, ok: bool) {
        if let Ok(mut guard) = self.inner.lock() {
            if ok {
                guard.predictions += 1;
            } else {
                guard.prediction_failures += 1;
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            metrics.max_duration_ms = metrics.max_duration_ms.max(duration_ms);
        }
        debug!(stage = self.stage.as_str(), duration_ms, "Stage duration recorded");
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        total_duration_ms = snapshot.total_duration_ms,
        stage_count = snapshot.stages.len(),
        gate_passes = snapshot.gate_passes,
        gate_failures = snapshot.gate_failures,
        "Experiment metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        counter(
            &mut output,
            "pype_gate_passes_total",
            "Total number of metric gate passes",
            self.gate_passes,
        );
        counter(
            &mut output,
            "pype_gate_failures_total",
            "Total number of metric gate failures",
            self.gate_failures,
        );
        counter(
            &mut output,
            "pype_predictions_total",
            "Successful prediction requests",
            self.predictions,
        );
        counter(
            &mut output,
            "pype_prediction_failures_total",
            "Rejected or failed prediction requests",
            self.prediction_failures,
        );
        output.push_str("# HELP pype_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE pype_stage_calls_total counter\n");
        output.push_str(
            "# HELP pype_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE pype_stage_duration_seconds_total counter\n");
        output.push_str("# HELP pype_stage_duration_seconds_max Maximum stage duration in seconds\n");
        output.push_str("# TYPE pype_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            let _ = writeln!(
                output,
                "pype_stage_calls_total{{stage=\"{stage}\"}} {}",
                metrics.calls
            );
            let _ = writeln!(
                output,
                "pype_stage_duration_seconds_total{{stage=\"{stage}\"}} {:.6}",
                metrics.total_duration_ms / 1_000.0
            );
            let _ = writeln!(
                output,
                "pype_stage_duration_seconds_max{{stage=\"{stage}\"}} {:.6}",
                metrics.max_duration_ms / 1_000.0
            );
        }
        output.push_str("# HELP pype_run_duration_seconds Total experiment duration\n");
        output.push_str("# TYPE pype_run_duration_seconds gauge\n");
        let _ = writeln!(
            output,
            "pype_run_duration_seconds {:.6}",
            self.total_duration_ms / 1_000.0
        );
        output
    }
}

fn counter(output: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    let _ = writeln!(output, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_record_on_drop() {
        let collector = MetricsCollector::new();
        {
            let _timer = collector.start_stage("fit");
        }
        {
            let _timer = collector.start_stage("fit");
        }
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.stages["fit"].calls, 2);
    }

    #[test]
    fn prometheus_output_uses_project_prefix() {
        let collector = MetricsCollector::new();
        collector.record_prediction(true);
        collector.record_prediction(false);
        drop(collector.start_stage("evaluate"));
        let text = collector.snapshot().to_prometheus();
        assert!(text.contains("pype_predictions_total 1"));
        assert!(text.contains("pype_prediction_failures_total 1"));
        assert!(text.contains("pype_stage_calls_total{stage=\"evaluate\"} 1"));
    }
}
