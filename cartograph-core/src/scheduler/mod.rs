//! Triggers discovery jobs.
//!
//! [`CronScheduler`] fires each job on its own schedule until shutdown and
//! never overlaps a job with itself. [`StaticScheduler`] runs every job once
//! in registration order. [`plan_order`] decides that order from the
//! advisory `depends_on` lists.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cartograph_model::SourceConfig;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{DiscoveryError, SchedulerError};
use crate::processor::Processor;
use crate::scanner::Scanner;

pub mod cron;
pub mod one_shot;

pub use self::cron::CronScheduler;
pub use one_shot::StaticScheduler;

const EVERY_PREFIX: &str = "@every";

/// Parsed schedule expression.
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    /// `@every <duration>`, for example `@every 15m`.
    Every(Duration),
    /// Cron expression with a leading seconds field.
    Cron(Box<::cron::Schedule>),
}

impl ScheduleSpec {
    pub fn parse(expression: &str) -> Result<Self, SchedulerError> {
        let expression = expression.trim();
        let invalid = |message: String| SchedulerError::InvalidSchedule {
            expression: expression.to_string(),
            message,
        };

        if let Some(rest) = expression.strip_prefix(EVERY_PREFIX) {
            let period = humantime::parse_duration(rest.trim())
                .map_err(|err| invalid(err.to_string()))?;
            if period.is_zero() {
                return Err(invalid("period must be positive".into()));
            }
            return Ok(Self::Every(period));
        }

        ::cron::Schedule::from_str(expression)
            .map(|schedule| Self::Cron(Box::new(schedule)))
            .map_err(|err| invalid(err.to_string()))
    }

    /// First fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(period) => {
                let period = chrono::Duration::from_std(*period).ok()?;
                now.checked_add_signed(period)
            }
            Self::Cron(schedule) => schedule.after(&now).next(),
        }
    }

    /// Time to wait from now until the next fire.
    pub fn next_delay(&self) -> Option<Duration> {
        match self {
            Self::Every(period) => Some(*period),
            Self::Cron(_) => {
                let now = Utc::now();
                let next = self.next_after(now)?;
                Some((next - now).to_std().unwrap_or_default())
            }
        }
    }
}

/// Unit of scheduled work.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self);
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Adds a job. `schedule` is ignored by policies that do not repeat.
    fn register(
        &mut self,
        job: Arc<dyn Job>,
        schedule: Option<ScheduleSpec>,
    ) -> Result<(), SchedulerError>;

    /// Drives the registered jobs until they are done or `shutdown` fires.
    async fn run(&self, shutdown: CancellationToken);
}

/// Scans one source and persists its output through the processor.
pub struct ScanJob {
    scanner: Arc<dyn Scanner>,
    processor: Arc<Processor>,
}

impl std::fmt::Debug for ScanJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanJob")
            .field("scanner", &self.scanner.name())
            .finish_non_exhaustive()
    }
}

impl ScanJob {
    pub fn new(scanner: Arc<dyn Scanner>, processor: Arc<Processor>) -> Self {
        Self { scanner, processor }
    }
}

#[async_trait]
impl Job for ScanJob {
    fn name(&self) -> &str {
        self.scanner.name()
    }

    async fn run(&self) {
        let outcome = self
            .processor
            .run_scanners(std::slice::from_ref(&self.scanner))
            .await
            .and_then(|report| report.into_result());
        match outcome {
            Ok(report) => info!(
                job = self.name(),
                resources.persisted = report.resources_persisted,
                "scheduled scan finished"
            ),
            Err(DiscoveryError::PartialFailure { .. }) => {
                warn!(job = self.name(), "scheduled scan partially failed")
            }
            Err(err) => error!(job = self.name(), error = %err, "scheduled scan failed"),
        }
    }
}

/// Orders sources so each comes after the sources it depends on.
///
/// The sort is stable with respect to the input order. Unknown dependencies
/// are ignored. When a cycle is found the remaining sources keep their
/// input order.
pub fn plan_order(sources: &[SourceConfig]) -> Vec<SourceConfig> {
    let known: HashSet<&str> = sources.iter().map(|s| s.name.as_str()).collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut pending: Vec<&SourceConfig> = sources.iter().collect();
    let mut ordered = Vec::with_capacity(sources.len());

    while !pending.is_empty() {
        let ready = pending.iter().position(|source| {
            source.depends_on.iter().all(|dep| {
                !known.contains(dep.as_str()) || placed.contains(dep.as_str())
            })
        });
        match ready {
            Some(index) => {
                let source = pending.remove(index);
                placed.insert(source.name.as_str());
                ordered.push(source.clone());
            }
            None => {
                let names: Vec<&str> =
                    pending.iter().map(|s| s.name.as_str()).collect();
                warn!(sources = ?names, "dependency cycle, keeping declared order");
                ordered.extend(pending.drain(..).cloned());
            }
        }
    }
    ordered
}
