//! Discovery pipeline.
//!
//! Every scanner runs in its own task and streams into one bounded channel.
//! A single consumer task drains the channel into batches of
//! [`ProcessorConfig::batch_size`] and persists them. Failures are recorded
//! and the run keeps going; the [`RunReport`] tells success from partial
//! failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cartograph_model::Resource;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::error::DiscoveryError;
use crate::metrics::{FailureType, JobStatus, MetricsCollector};
use crate::scanner::{ResourceSink, Scanner};
use crate::storage::Storage;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Resources per `persist` call. Values below one are treated as one.
    pub batch_size: usize,
    pub channel_capacity: usize,
    /// Deadline for a whole run.
    pub run_timeout: Option<Duration>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            run_timeout: None,
        }
    }
}

impl ProcessorConfig {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            ..Self::default()
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }
}

/// What one discovery run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub resources_emitted: u64,
    pub resources_persisted: u64,
    pub batches_persisted: usize,
    pub failed_batches: usize,
    /// Names of scanners that returned an error or whose task died.
    pub failed_scanners: Vec<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed_batches == 0 && self.failed_scanners.is_empty()
    }

    pub fn into_result(self) -> Result<Self, DiscoveryError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(DiscoveryError::PartialFailure {
                failed_scanners: self.failed_scanners.len(),
                failed_batches: self.failed_batches,
            })
        }
    }
}

#[derive(Debug)]
struct ScannerOutcome {
    name: String,
    emitted: u64,
    failed: bool,
}

#[derive(Debug, Default)]
struct ConsumerOutcome {
    persisted: u64,
    batches: usize,
    failed_batches: usize,
}

/// Fans scanner output into batched persistence.
pub struct Processor {
    config: ProcessorConfig,
    storage: Arc<dyn Storage>,
    metrics: Arc<MetricsCollector>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Processor {
    pub fn new(
        config: ProcessorConfig,
        storage: Arc<dyn Storage>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            storage,
            metrics,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Runs every scanner once and persists their output.
    ///
    /// Scanner and batch failures end up in the report. Only a missed
    /// deadline is returned as an error, after all tasks were aborted.
    pub async fn run_scanners(
        &self,
        scanners: &[Arc<dyn Scanner>],
    ) -> Result<RunReport, DiscoveryError> {
        let (sink, rx) = ResourceSink::channel(self.config.channel_capacity);
        let mut consumer = tokio::spawn(consume(
            rx,
            Arc::clone(&self.storage),
            Arc::clone(&self.metrics),
            self.config.batch_size.max(1),
        ));

        let mut producers = JoinSet::new();
        for scanner in scanners {
            producers.spawn(run_scanner(
                Arc::clone(scanner),
                sink.scoped(),
                Arc::clone(&self.storage),
                Arc::clone(&self.metrics),
            ));
        }
        // Producers hold the only remaining senders.
        drop(sink);

        info!(scanners = scanners.len(), "discovery run started");
        let run = collect(&mut producers, &mut consumer);
        let report = match self.config.run_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, run).await {
                Ok(report) => report,
                Err(_) => {
                    producers.abort_all();
                    consumer.abort();
                    error!(timeout = ?deadline, "discovery run timed out");
                    return Err(DiscoveryError::Timeout(deadline));
                }
            },
            None => run.await,
        };

        self.refresh_resource_counts().await;
        info!(
            resources.emitted = report.resources_emitted,
            resources.persisted = report.resources_persisted,
            batches.persisted = report.batches_persisted,
            batches.failed = report.failed_batches,
            scanners.failed = report.failed_scanners.len(),
            "discovery run finished"
        );
        Ok(report)
    }

    /// Publishes latest-version resource totals as gauges.
    pub async fn refresh_resource_counts(&self) {
        match self.storage.resource_counts().await {
            Ok(counts) => {
                for count in counts {
                    self.metrics.resource_count(
                        &count.source,
                        &count.kind,
                        count.total_count,
                    );
                }
            }
            Err(err) => warn!(error = %err, "unable to refresh resource counts"),
        }
    }
}

async fn collect(
    producers: &mut JoinSet<ScannerOutcome>,
    consumer: &mut JoinHandle<ConsumerOutcome>,
) -> RunReport {
    let mut report = RunReport::default();
    while let Some(joined) = producers.join_next().await {
        match joined {
            Ok(outcome) => {
                report.resources_emitted += outcome.emitted;
                if outcome.failed {
                    report.failed_scanners.push(outcome.name);
                }
            }
            Err(err) => {
                error!(error = %err, "scanner task panicked or was cancelled");
                report.failed_scanners.push(String::from("<panicked>"));
            }
        }
    }
    report.failed_scanners.sort();

    match consumer.await {
        Ok(outcome) => {
            report.resources_persisted = outcome.persisted;
            report.batches_persisted = outcome.batches;
            report.failed_batches = outcome.failed_batches;
        }
        Err(err) => {
            error!(error = %err, "consumer task failed");
            report.failed_batches += 1;
        }
    }
    report
}

async fn run_scanner(
    scanner: Arc<dyn Scanner>,
    sink: ResourceSink,
    storage: Arc<dyn Storage>,
    metrics: Arc<MetricsCollector>,
) -> ScannerOutcome {
    let name = scanner.name().to_string();
    let kind = scanner.kind().to_string();

    let version = match storage.next_version_for_resource(&name, &kind).await {
        Ok(version) => version,
        Err(err) => {
            metrics.process_error(FailureType::Version);
            metrics.scanner_job_status(&name, &kind, JobStatus::Failed);
            error!(
                scanner.name = %name,
                scanner.kind = %kind,
                error = %err,
                "unable to allocate scan version"
            );
            return ScannerOutcome {
                name,
                emitted: 0,
                failed: true,
            };
        }
    };

    metrics.scanner_job_status(&name, &kind, JobStatus::Running);
    info!(scanner.name = %name, scanner.kind = %kind, version, "scanner started");
    let started = Instant::now();
    let result = scanner.scan(&sink, version).await;
    let emitted = sink.emitted();

    metrics.scan_duration(&name, &kind, started.elapsed());
    metrics.resources_discovered(&name, &kind, version, emitted);

    let failed = match result {
        Ok(()) => {
            metrics.scanner_job_status(&name, &kind, JobStatus::Finished);
            info!(
                scanner.name = %name,
                scanner.kind = %kind,
                total_resource_discovered = emitted,
                "scanner finished"
            );
            false
        }
        Err(err) => {
            metrics.scanner_job_status(&name, &kind, JobStatus::Failed);
            metrics.process_error(FailureType::Scan);
            error!(
                scanner.name = %name,
                scanner.kind = %kind,
                emitted,
                error = %err,
                "scanner failed"
            );
            true
        }
    };

    ScannerOutcome {
        name,
        emitted,
        failed,
    }
}

async fn consume(
    mut rx: mpsc::Receiver<Resource>,
    storage: Arc<dyn Storage>,
    metrics: Arc<MetricsCollector>,
    batch_size: usize,
) -> ConsumerOutcome {
    let mut outcome = ConsumerOutcome::default();
    let mut batch = Vec::with_capacity(batch_size);

    while let Some(resource) = rx.recv().await {
        batch.push(resource);
        if batch.len() >= batch_size {
            flush(&mut batch, storage.as_ref(), &metrics, &mut outcome).await;
        }
    }
    if !batch.is_empty() {
        flush(&mut batch, storage.as_ref(), &metrics, &mut outcome).await;
    }
    outcome
}

async fn flush(
    batch: &mut Vec<Resource>,
    storage: &dyn Storage,
    metrics: &MetricsCollector,
    outcome: &mut ConsumerOutcome,
) {
    let started = Instant::now();
    match storage.persist(batch).await {
        Ok(()) => {
            metrics.batch_persist_latency(started.elapsed());
            outcome.persisted += batch.len() as u64;
            outcome.batches += 1;
            debug!(batch.size = batch.len(), "batch flushed");
        }
        Err(err) => {
            metrics.process_error(FailureType::Persist);
            outcome.failed_batches += 1;
            error!(batch.size = batch.len(), error = %err, "batch persist failed");
        }
    }
    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ScanError, StorageError};
    use crate::metrics::PROCESS_ERRORS;
    use crate::storage::{InMemoryStorage, MockStorage};
    use async_trait::async_trait;
    use cartograph_model::{
        MetadataCount, RelationCriteria, RelationEdge, ResourceCount,
        ResourceFilter,
    };
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug)]
    struct StubScanner {
        name: String,
        count: usize,
        fail_after: Option<usize>,
        hang: bool,
    }

    impl StubScanner {
        fn emitting(name: &str, count: usize) -> Self {
            Self {
                name: name.into(),
                count,
                fail_after: None,
                hang: false,
            }
        }
    }

    #[async_trait]
    impl Scanner for StubScanner {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> &str {
            "file_system"
        }

        fn schedule(&self) -> Option<&str> {
            None
        }

        async fn scan(
            &self,
            output: &ResourceSink,
            version: i32,
        ) -> Result<(), ScanError> {
            for i in 0..self.count {
                if self.fail_after == Some(i) {
                    return Err(ScanError::Provider("boom".into()));
                }
                let external_id = format!("{}/{i}", self.name);
                output
                    .emit(Resource::new(
                        self.kind(),
                        Resource::derive_uuid(self.kind(), &external_id),
                        external_id.clone(),
                        external_id,
                        self.name.clone(),
                        version,
                    ))
                    .await?;
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    /// Records every persisted batch and optionally sleeps in `persist`.
    #[derive(Debug, Default)]
    struct RecordingStorage {
        delay: Duration,
        batches: Mutex<Vec<Vec<String>>>,
        persisted: Arc<AtomicU64>,
    }

    impl RecordingStorage {
        fn slow(delay: Duration, persisted: Arc<AtomicU64>) -> Self {
            Self {
                delay,
                persisted,
                ..Self::default()
            }
        }

        fn external_ids(&self) -> Vec<Vec<String>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Storage for RecordingStorage {
        async fn prepare(&self) -> crate::error::Result<()> {
            Ok(())
        }

        async fn persist(&self, resources: &[Resource]) -> crate::error::Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.batches.lock().unwrap().push(
                resources.iter().map(|r| r.external_id.clone()).collect(),
            );
            self.persisted
                .fetch_add(resources.len() as u64, Ordering::SeqCst);
            Ok(())
        }

        async fn find(
            &self,
            _filter: &ResourceFilter,
        ) -> crate::error::Result<Vec<Resource>> {
            Ok(Vec::new())
        }

        async fn next_version_for_resource(
            &self,
            _source: &str,
            _kind: &str,
        ) -> crate::error::Result<i32> {
            Ok(1)
        }

        async fn store_relation(
            &self,
            _criteria: &RelationCriteria,
        ) -> crate::error::Result<u64> {
            Ok(0)
        }

        async fn get_relations(&self) -> crate::error::Result<Vec<RelationEdge>> {
            Ok(Vec::new())
        }

        async fn resource_counts(&self) -> crate::error::Result<Vec<ResourceCount>> {
            Ok(Vec::new())
        }

        async fn metadata_counts(&self) -> crate::error::Result<Vec<MetadataCount>> {
            Ok(Vec::new())
        }
    }

    /// Emits `count` resources and tracks how far it ever got ahead of
    /// persistence.
    #[derive(Debug)]
    struct EagerScanner {
        count: usize,
        persisted: Arc<AtomicU64>,
        max_lead: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Scanner for EagerScanner {
        fn name(&self) -> &str {
            "eager"
        }

        fn kind(&self) -> &str {
            "file_system"
        }

        fn schedule(&self) -> Option<&str> {
            None
        }

        async fn scan(
            &self,
            output: &ResourceSink,
            version: i32,
        ) -> Result<(), ScanError> {
            for i in 0..self.count {
                let external_id = format!("eager/{i}");
                output
                    .emit(Resource::new(
                        self.kind(),
                        Resource::derive_uuid(self.kind(), &external_id),
                        external_id.clone(),
                        external_id,
                        "eager",
                        version,
                    ))
                    .await?;
                let persisted = self.persisted.load(Ordering::SeqCst);
                let lead = output.emitted().saturating_sub(persisted);
                self.max_lead.fetch_max(lead, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    fn scanners(list: Vec<StubScanner>) -> Vec<Arc<dyn Scanner>> {
        list.into_iter()
            .map(|s| Arc::new(s) as Arc<dyn Scanner>)
            .collect()
    }

    #[tokio::test]
    async fn persists_in_ceil_n_over_b_batches() {
        let storage = Arc::new(InMemoryStorage::new());
        let processor = Processor::new(
            ProcessorConfig::new(3),
            storage.clone(),
            Arc::new(MetricsCollector::new()),
        );

        let report = processor
            .run_scanners(&scanners(vec![
                StubScanner::emitting("one", 4),
                StubScanner::emitting("two", 3),
            ]))
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.resources_emitted, 7);
        assert_eq!(report.resources_persisted, 7);
        let batches = storage.batches().await;
        assert_eq!(batches.len(), 3);
        assert_eq!(batches.iter().sum::<usize>(), 7);
        assert_eq!(storage.find(&ResourceFilter::new()).await.unwrap().len(), 7);
    }

    #[tokio::test]
    async fn batch_size_one_persists_each_resource() {
        let storage = Arc::new(InMemoryStorage::new());
        let processor = Processor::new(
            ProcessorConfig::new(1),
            storage.clone(),
            Arc::new(MetricsCollector::new()),
        );
        processor
            .run_scanners(&scanners(vec![StubScanner::emitting("one", 5)]))
            .await
            .unwrap();
        assert_eq!(storage.batches().await, vec![1; 5]);
    }

    #[tokio::test]
    async fn failing_scanner_keeps_emitted_resources() {
        let storage = Arc::new(InMemoryStorage::new());
        let metrics = Arc::new(MetricsCollector::new());
        let processor = Processor::new(
            ProcessorConfig::new(2),
            storage.clone(),
            metrics.clone(),
        );
        let mut failing = StubScanner::emitting("broken", 10);
        failing.fail_after = Some(3);

        let report = processor
            .run_scanners(&scanners(vec![failing, StubScanner::emitting("ok", 2)]))
            .await
            .unwrap();

        assert_eq!(report.failed_scanners, vec!["broken".to_string()]);
        assert_eq!(report.resources_persisted, 5);
        let broken = ResourceFilter::new().with_meta_data("Scanner-Label", "broken");
        assert_eq!(storage.find(&broken).await.unwrap().len(), 3);
        assert_eq!(metrics.counter(PROCESS_ERRORS, &[("failure_type", "scan")]), 1);
        assert!(matches!(
            report.into_result(),
            Err(DiscoveryError::PartialFailure {
                failed_scanners: 1,
                failed_batches: 0
            })
        ));
    }

    #[tokio::test]
    async fn failed_batch_does_not_stop_later_batches() {
        let mut storage = MockStorage::new();
        storage
            .expect_next_version_for_resource()
            .returning(|_, _| Ok(1));
        let mut calls = 0;
        storage.expect_persist().times(3).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(StorageError::Internal("disk full".into()))
            } else {
                Ok(())
            }
        });
        storage.expect_resource_counts().returning(|| Ok(Vec::new()));

        let processor = Processor::new(
            ProcessorConfig::new(2),
            Arc::new(storage),
            Arc::new(MetricsCollector::new()),
        );
        let report = processor
            .run_scanners(&scanners(vec![StubScanner::emitting("one", 6)]))
            .await
            .unwrap();

        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.batches_persisted, 2);
        assert_eq!(report.resources_persisted, 4);
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn version_failure_marks_scanner_failed() {
        let mut storage = MockStorage::new();
        storage
            .expect_next_version_for_resource()
            .returning(|_, _| Err(StorageError::Internal("down".into())));
        storage.expect_persist().never();
        storage.expect_resource_counts().returning(|| Ok(Vec::new()));

        let processor = Processor::new(
            ProcessorConfig::default(),
            Arc::new(storage),
            Arc::new(MetricsCollector::new()),
        );
        let report = processor
            .run_scanners(&scanners(vec![StubScanner::emitting("one", 2)]))
            .await
            .unwrap();
        assert_eq!(report.failed_scanners, vec!["one".to_string()]);
        assert_eq!(report.resources_emitted, 0);
    }

    #[tokio::test]
    async fn batches_keep_each_scanner_emission_order() {
        let storage = Arc::new(RecordingStorage::default());
        let processor = Processor::new(
            ProcessorConfig::new(3),
            storage.clone(),
            Arc::new(MetricsCollector::new()),
        );

        processor
            .run_scanners(&scanners(vec![
                StubScanner::emitting("one", 7),
                StubScanner::emitting("two", 5),
            ]))
            .await
            .unwrap();

        let persisted: Vec<String> =
            storage.external_ids().into_iter().flatten().collect();
        assert_eq!(persisted.len(), 12);
        for (name, count) in [("one", 7), ("two", 5)] {
            let prefix = format!("{name}/");
            let seen: Vec<&str> = persisted
                .iter()
                .filter(|id| id.starts_with(&prefix))
                .map(String::as_str)
                .collect();
            let expected: Vec<String> =
                (0..count).map(|i| format!("{name}/{i}")).collect();
            assert_eq!(seen, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_storage_throttles_scanners() {
        const CAPACITY: usize = 1;
        const BATCH: usize = 2;
        let persisted = Arc::new(AtomicU64::new(0));
        let max_lead = Arc::new(AtomicU64::new(0));
        let storage = Arc::new(RecordingStorage::slow(
            Duration::from_millis(50),
            persisted.clone(),
        ));
        let processor = Processor::new(
            ProcessorConfig::new(BATCH).with_channel_capacity(CAPACITY),
            storage.clone(),
            Arc::new(MetricsCollector::new()),
        );
        let scanner: Arc<dyn Scanner> = Arc::new(EagerScanner {
            count: 20,
            persisted: persisted.clone(),
            max_lead: max_lead.clone(),
        });

        let report = processor.run_scanners(&[scanner]).await.unwrap();

        assert_eq!(report.resources_persisted, 20);
        assert_eq!(storage.external_ids().len(), 10);
        // Queued items plus the batch being persisted.
        let bound = (CAPACITY + BATCH) as u64;
        let lead = max_lead.load(Ordering::SeqCst);
        assert!(lead <= bound, "scanner ran {lead} resources ahead of storage");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_the_run() {
        let storage = Arc::new(InMemoryStorage::new());
        let processor = Processor::new(
            ProcessorConfig::new(10)
                .with_run_timeout(Some(Duration::from_secs(5))),
            storage,
            Arc::new(MetricsCollector::new()),
        );
        let mut stuck = StubScanner::emitting("stuck", 1);
        stuck.hang = true;

        let err = processor
            .run_scanners(&scanners(vec![stuck]))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Timeout(d) if d == Duration::from_secs(5)));
    }
}
