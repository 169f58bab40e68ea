use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Job, ScheduleSpec, Scheduler};
use crate::error::SchedulerError;

/// One-shot policy: every registered job runs once, sequentially, in
/// registration order.
#[derive(Default)]
pub struct StaticScheduler {
    jobs: Vec<Arc<dyn Job>>,
}

impl std::fmt::Debug for StaticScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticScheduler")
            .field(
                "jobs",
                &self.jobs.iter().map(|job| job.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl StaticScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Scheduler for StaticScheduler {
    fn register(
        &mut self,
        job: Arc<dyn Job>,
        _schedule: Option<ScheduleSpec>,
    ) -> Result<(), SchedulerError> {
        self.jobs.push(job);
        Ok(())
    }

    async fn run(&self, shutdown: CancellationToken) {
        for job in &self.jobs {
            if shutdown.is_cancelled() {
                info!(job = job.name(), "shutdown requested, skipping remaining jobs");
                return;
            }
            info!(job = job.name(), "running job");
            job.run().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct RecordingJob {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Job for RecordingJob {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self) {
            self.log.lock().await.push(self.name.clone());
        }
    }

    #[tokio::test]
    async fn runs_each_job_once_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = StaticScheduler::new();
        for name in ["base", "rds", "ecr"] {
            scheduler
                .register(
                    Arc::new(RecordingJob {
                        name: name.into(),
                        log: log.clone(),
                    }),
                    None,
                )
                .unwrap();
        }

        scheduler.run(CancellationToken::new()).await;
        assert_eq!(*log.lock().await, vec!["base", "rds", "ecr"]);
    }

    #[tokio::test]
    async fn cancelled_token_skips_everything() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = StaticScheduler::new();
        scheduler
            .register(
                Arc::new(RecordingJob {
                    name: "fs".into(),
                    log: log.clone(),
                }),
                None,
            )
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        scheduler.run(token).await;
        assert!(log.lock().await.is_empty());
    }
}
