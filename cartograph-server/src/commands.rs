use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use cartograph_config::{AppConfig, ConfigLoader};
use cartograph_core::{
    metrics::MetricsCollector,
    processor::{Processor, RunReport},
    relation::{RelationBuilder, RelationReport},
    scanner::{Scanner, ScannerRegistry},
    scheduler::{
        CronScheduler, ScanJob, ScheduleSpec, Scheduler, StaticScheduler, plan_order,
    },
    storage::{PostgresStorage, Storage},
};
use cartograph_model::SourceConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{AppState, router};

const MAX_DB_CONNECTIONS: u32 = 10;

/// Loads and validates the configuration at `path`.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    ConfigLoader::new(path)
        .load_validated()
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// Connects to the configured database and migrates it.
pub async fn connect_storage(config: &AppConfig) -> Result<Arc<PostgresStorage>> {
    let url = config.database_url().context("no usable storage engine")?;
    let storage = PostgresStorage::connect(&url, MAX_DB_CONNECTIONS)
        .await
        .context("failed to connect to database")?;
    storage
        .prepare()
        .await
        .context("failed to prepare database schema")?;
    info!(engine = %config.storage.default_engine, "storage ready");
    Ok(Arc::new(storage))
}

/// Sources in dependency order with their scanners.
fn build_scanners(
    config: &AppConfig,
    metrics: Arc<MetricsCollector>,
) -> Result<Vec<(SourceConfig, Arc<dyn Scanner>)>> {
    let sources = plan_order(&config.source_configs()?);
    let scanners = ScannerRegistry::new(metrics)
        .build_all(&sources)
        .context("failed to set up scanners")?;
    Ok(sources.into_iter().zip(scanners).collect())
}

/// One full discovery pass over every source.
pub async fn discover(
    config: &AppConfig,
    storage: Arc<dyn Storage>,
    metrics: Arc<MetricsCollector>,
) -> Result<RunReport> {
    let scanners: Vec<_> = build_scanners(config, metrics.clone())?
        .into_iter()
        .map(|(_, scanner)| scanner)
        .collect();
    let processor = Processor::new(config.processor_config()?, storage, metrics);

    info!(
        discovery.name = %config.discovery.name,
        scanners = scanners.len(),
        "discovery started"
    );
    let report = processor.run_scanners(&scanners).await?.into_result()?;
    info!(
        resources.persisted = report.resources_persisted,
        batches = report.batches_persisted,
        "discovery finished"
    );
    Ok(report)
}

/// Applies every configured relation criteria.
pub async fn relate(
    config: &AppConfig,
    storage: Arc<dyn Storage>,
    metrics: Arc<MetricsCollector>,
) -> Result<RelationReport> {
    let report = RelationBuilder::new(storage, metrics)
        .store_relations(&config.relations.criteria)
        .await;
    if let Some(failure) = report.failures.first() {
        bail!(
            "{} of {} relation criteria failed, first: {failure}",
            report.failures.len(),
            config.relations.criteria.len()
        );
    }
    info!(edges.inserted = report.total_inserted(), "relations stored");
    Ok(report)
}

/// Runs scan jobs until `shutdown` fires. With `once` every source runs a
/// single time in dependency order; otherwise sources with a schedule run
/// on it and the rest are skipped.
pub async fn schedule(
    config: &AppConfig,
    storage: Arc<dyn Storage>,
    metrics: Arc<MetricsCollector>,
    once: bool,
    shutdown: CancellationToken,
) -> Result<()> {
    let processor = Arc::new(Processor::new(
        config.processor_config()?,
        storage,
        metrics.clone(),
    ));
    let mut scheduler: Box<dyn Scheduler> = if once {
        Box::new(StaticScheduler::new())
    } else {
        Box::new(CronScheduler::new())
    };

    let mut registered = 0usize;
    for (source, scanner) in build_scanners(config, metrics)? {
        let spec = source
            .schedule
            .as_deref()
            .map(ScheduleSpec::parse)
            .transpose()
            .with_context(|| format!("source '{}' has an invalid schedule", source.name))?;
        if spec.is_none() && !once {
            warn!(source = %source.name, "source has no schedule, skipping");
            continue;
        }
        scheduler.register(Arc::new(ScanJob::new(scanner, processor.clone())), spec)?;
        registered += 1;
    }
    if registered == 0 {
        bail!("no source has a schedule; use --once to run every source now");
    }

    info!(jobs = registered, once, "scheduler started");
    scheduler.run(shutdown).await;
    info!("scheduler stopped");
    Ok(())
}

/// Serves the query API until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "query API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("query API server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartograph_core::storage::InMemoryStorage;
    use cartograph_model::ResourceFilter;

    fn config_for(root: &Path, schedule: Option<&str>) -> AppConfig {
        let schedule = schedule
            .map(|s| format!("    schedule: \"{s}\"\n"))
            .unwrap_or_default();
        let yaml = format!(
            r#"
organization:
  name: Acme
discovery:
  name: local
storage:
  batch_size: 10
  default_engine: postgresql
  engines:
    postgresql: {{host: localhost, port: 5432, user: app, password: pw, db: inv}}
source:
  home:
    type: file_system
    configuration:
      root_directory: {root}
{schedule}relations:
  criteria:
    - name: files-in-home
      kind: file_system
      metadata_key: Scanner-Label
      metadata_value: home
      related_kind: file_system
      related_metadata_key: Scanner-Label
      related_metadata_value: home
"#,
            root = root.display(),
        );
        ConfigLoader::from_yaml(&yaml).unwrap()
    }

    #[tokio::test]
    async fn discover_persists_the_filesystem_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let config = config_for(dir.path(), None);
        let storage = Arc::new(InMemoryStorage::new());
        let metrics = Arc::new(MetricsCollector::new());

        let report = discover(&config, storage.clone(), metrics).await.unwrap();
        assert_eq!(report.resources_persisted, 2);
        assert_eq!(storage.find(&ResourceFilter::new()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn schedule_without_any_schedule_needs_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path(), None);
        let storage = Arc::new(InMemoryStorage::new());
        let metrics = Arc::new(MetricsCollector::new());

        let err = schedule(
            &config,
            storage.clone(),
            metrics.clone(),
            false,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("--once"));

        schedule(&config, storage.clone(), metrics, true, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(storage.find(&ResourceFilter::new()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recurring_schedule_returns_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path(), Some("@every 1h"));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        schedule(
            &config,
            Arc::new(InMemoryStorage::new()),
            Arc::new(MetricsCollector::new()),
            false,
            shutdown,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn relate_reports_inserted_edges() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let config = config_for(dir.path(), None);
        let storage = Arc::new(InMemoryStorage::new());
        let metrics = Arc::new(MetricsCollector::new());

        discover(&config, storage.clone(), metrics.clone()).await.unwrap();
        let report = relate(&config, storage, metrics).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.inserted.len(), 1);
    }
}
