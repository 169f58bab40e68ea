use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Job, ScheduleSpec, Scheduler};
use crate::error::SchedulerError;

/// Recurring policy. One task per job; a job runs inline in its own task,
/// so a slow run delays its next fire instead of overlapping it.
#[derive(Default)]
pub struct CronScheduler {
    jobs: Vec<(Arc<dyn Job>, ScheduleSpec)>,
}

impl std::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronScheduler")
            .field(
                "jobs",
                &self.jobs.iter().map(|(job, _)| job.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl CronScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

async fn drive(job: Arc<dyn Job>, spec: ScheduleSpec, shutdown: CancellationToken) {
    loop {
        let Some(delay) = spec.next_delay() else {
            warn!(job = job.name(), "schedule has no upcoming fire time");
            return;
        };
        debug!(job = job.name(), delay_ms = delay.as_millis() as u64, "job armed");

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = job.run() => {}
        }
    }
}

#[async_trait]
impl Scheduler for CronScheduler {
    fn register(
        &mut self,
        job: Arc<dyn Job>,
        schedule: Option<ScheduleSpec>,
    ) -> Result<(), SchedulerError> {
        match schedule {
            Some(spec) => {
                self.jobs.push((job, spec));
                Ok(())
            }
            None => Err(SchedulerError::InvalidSchedule {
                expression: String::new(),
                message: format!("job '{}' has no schedule", job.name()),
            }),
        }
    }

    async fn run(&self, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();
        for (job, spec) in &self.jobs {
            tasks.spawn(drive(Arc::clone(job), spec.clone(), shutdown.clone()));
        }
        info!(jobs = self.jobs.len(), "recurring scheduler started");

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "scheduled job task ended abnormally");
            }
        }
        info!("recurring scheduler stopped");
    }
}
