//! In-process pipeline metrics.
//!
//! A [`MetricsCollector`] is created once per process and handed to the
//! processor, the scanners and the HTTP layer as an `Arc`. Counters and
//! gauges are keyed by metric name plus an ordered label set.

use std::fmt::Write as _;
use std::time::Duration;

use dashmap::DashMap;

pub const SCANNER_BUILT: &str = "cartograph_scanner_built_total";
pub const SCANNER_JOB_STATUS: &str = "cartograph_scanner_job_status_total";
pub const RESOURCES_DISCOVERED: &str = "cartograph_resources_discovered";
pub const PROCESS_ERRORS: &str = "cartograph_process_errors_total";
pub const BATCH_PERSIST_LATENCY: &str = "cartograph_batch_persist_seconds";
pub const SCAN_DURATION: &str = "cartograph_scan_duration_seconds";
pub const RESOURCE_COUNT: &str = "cartograph_resource_count";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Running,
    Finished,
    Failed,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureType {
    Scan,
    Persist,
    Version,
    Relation,
}

impl FailureType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FailureType::Scan => "scan",
            FailureType::Persist => "persist",
            FailureType::Version => "version",
            FailureType::Relation => "relation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub name: &'static str,
    pub labels: Vec<(&'static str, String)>,
}

impl MetricKey {
    fn new(name: &'static str, labels: &[(&'static str, &str)]) -> Self {
        Self {
            name,
            labels: labels
                .iter()
                .map(|(k, v)| (*k, (*v).to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub key: MetricKey,
    pub value: f64,
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: DashMap<MetricKey, u64>,
    gauges: DashMap<MetricKey, f64>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scanner_built(&self, kind: &str) {
        self.incr(SCANNER_BUILT, &[("kind", kind)], 1);
    }

    pub fn scanner_job_status(&self, name: &str, kind: &str, status: JobStatus) {
        self.incr(
            SCANNER_JOB_STATUS,
            &[("name", name), ("kind", kind), ("status", status.as_str())],
            1,
        );
    }

    pub fn resources_discovered(
        &self,
        name: &str,
        kind: &str,
        version: i32,
        total: u64,
    ) {
        let version = version.to_string();
        self.set(
            RESOURCES_DISCOVERED,
            &[("name", name), ("kind", kind), ("version", &version)],
            total as f64,
        );
    }

    pub fn process_error(&self, failure: FailureType) {
        self.incr(PROCESS_ERRORS, &[("failure_type", failure.as_str())], 1);
    }

    pub fn batch_persist_latency(&self, elapsed: Duration) {
        self.set(BATCH_PERSIST_LATENCY, &[], elapsed.as_secs_f64());
    }

    pub fn scan_duration(&self, name: &str, kind: &str, elapsed: Duration) {
        self.set(
            SCAN_DURATION,
            &[("name", name), ("kind", kind)],
            elapsed.as_secs_f64(),
        );
    }

    pub fn resource_count(&self, source: &str, kind: &str, total: i64) {
        self.set(
            RESOURCE_COUNT,
            &[("source", source), ("kind", kind)],
            total as f64,
        );
    }

    /// Current counter value, zero when never incremented.
    pub fn counter(&self, name: &'static str, labels: &[(&'static str, &str)]) -> u64 {
        self.counters
            .get(&MetricKey::new(name, labels))
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn gauge(
        &self,
        name: &'static str,
        labels: &[(&'static str, &str)],
    ) -> Option<f64> {
        self.gauges.get(&MetricKey::new(name, labels)).map(|v| *v)
    }

    /// All samples, sorted by name and labels.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut samples: Vec<MetricSample> = self
            .counters
            .iter()
            .map(|entry| MetricSample {
                key: entry.key().clone(),
                value: *entry.value() as f64,
            })
            .chain(self.gauges.iter().map(|entry| MetricSample {
                key: entry.key().clone(),
                value: *entry.value(),
            }))
            .collect();
        samples.sort_by(|a, b| a.key.cmp(&b.key));
        samples
    }

    /// Prometheus text exposition of [`MetricsCollector::snapshot`].
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for sample in self.snapshot() {
            out.push_str(sample.key.name);
            if !sample.key.labels.is_empty() {
                out.push('{');
                for (i, (label, value)) in sample.key.labels.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
                    let _ = write!(out, "{label}=\"{escaped}\"");
                }
                out.push('}');
            }
            let _ = writeln!(out, " {}", sample.value);
        }
        out
    }

    fn incr(&self, name: &'static str, labels: &[(&'static str, &str)], by: u64) {
        *self.counters.entry(MetricKey::new(name, labels)).or_insert(0) += by;
    }

    fn set(&self, name: &'static str, labels: &[(&'static str, &str)], value: f64) {
        self.gauges.insert(MetricKey::new(name, labels), value);
    }
}
