use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cartograph_model::{SourceConfig, SourceType};
use tracing::info;

use super::Scanner;
use super::aws::{
    AwsEc2Scanner, AwsEcrScanner, AwsRdsScanner, AwsS3Scanner, SHARED_KEYS,
};
use super::fs::FsScanner;
use super::github::GitHubRepositoryScanner;
use crate::error::{DiscoveryError, ScanError};
use crate::metrics::MetricsCollector;

pub type ScannerFactory = Arc<
    dyn Fn(&SourceConfig) -> Result<Arc<dyn Scanner>, ScanError> + Send + Sync,
>;

/// Maps source types to scanner constructors.
#[derive(Clone)]
pub struct ScannerRegistry {
    factories: HashMap<SourceType, ScannerFactory>,
    metrics: Arc<MetricsCollector>,
}

impl fmt::Debug for ScannerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> =
            self.factories.keys().map(SourceType::as_str).collect();
        types.sort_unstable();
        f.debug_struct("ScannerRegistry")
            .field("types", &types)
            .finish_non_exhaustive()
    }
}

fn boxed<S, F>(build: F) -> ScannerFactory
where
    S: Scanner + 'static,
    F: Fn(&SourceConfig) -> Result<S, ScanError> + Send + Sync + 'static,
{
    Arc::new(move |source: &SourceConfig| {
        Ok(Arc::new(build(source)?) as Arc<dyn Scanner>)
    })
}

impl ScannerRegistry {
    /// Registry without any constructors.
    pub fn empty(metrics: Arc<MetricsCollector>) -> Self {
        Self {
            factories: HashMap::new(),
            metrics,
        }
    }

    /// Registry with the built-in source types.
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        let mut registry = Self::empty(metrics);
        registry.register(SourceType::FileSystem, boxed(FsScanner::from_source));
        registry.register(
            SourceType::GitHubRepository,
            boxed(GitHubRepositoryScanner::from_source),
        );
        registry.register(SourceType::AwsS3, boxed(AwsS3Scanner::from_source));
        registry.register(SourceType::AwsRds, boxed(AwsRdsScanner::from_source));
        registry.register(SourceType::AwsEc2, boxed(AwsEc2Scanner::from_source));
        registry.register(SourceType::AwsEcr, boxed(AwsEcrScanner::from_source));
        registry
    }

    pub fn register(&mut self, source_type: SourceType, factory: ScannerFactory) {
        self.factories.insert(source_type, factory);
    }

    /// Builds one scanner. `config_from` must already be resolved.
    pub fn build(
        &self,
        source: &SourceConfig,
    ) -> Result<Arc<dyn Scanner>, DiscoveryError> {
        let setup_error = |message: String| DiscoveryError::Setup {
            source_name: source.name.clone(),
            message,
        };
        let factory = self.factories.get(&source.source_type).ok_or_else(|| {
            setup_error(format!(
                "no scanner registered for type {}",
                source.source_type
            ))
        })?;
        let scanner = (**factory)(source).map_err(|err| setup_error(err.to_string()))?;

        self.metrics.scanner_built(scanner.kind());
        info!(
            scanner.name = %scanner.name(),
            scanner.kind = %scanner.kind(),
            "scanner has been set up"
        );
        Ok(scanner)
    }

    /// Builds scanners for every source, in the given order.
    pub fn build_all(
        &self,
        sources: &[SourceConfig],
    ) -> Result<Vec<Arc<dyn Scanner>>, DiscoveryError> {
        sources
            .iter()
            .map(|source| {
                let resolved = resolve_shared_config(source, sources)?;
                self.build(&resolved)
            })
            .collect()
    }
}

/// Copies credentials and region from the source named by `config_from`
/// into `source`, without overriding keys it sets itself.
pub fn resolve_shared_config(
    source: &SourceConfig,
    sources: &[SourceConfig],
) -> Result<SourceConfig, DiscoveryError> {
    let Some(parent_name) = source.config_from() else {
        return Ok(source.clone());
    };
    let parent = sources
        .iter()
        .find(|candidate| candidate.name == parent_name)
        .ok_or_else(|| DiscoveryError::Setup {
            source_name: source.name.clone(),
            message: format!("config_from references unknown source '{parent_name}'"),
        })?;

    let mut resolved = source.clone();
    for key in SHARED_KEYS {
        if resolved.get(key).is_none()
            && let Some(value) = parent.get(key)
        {
            resolved
                .configuration
                .insert(key.to_string(), value.to_string());
        }
    }
    Ok(resolved)
}
