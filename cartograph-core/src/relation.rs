use std::sync::Arc;

use cartograph_model::RelationCriteria;
use tracing::{error, info};

use crate::error::RelationError;
use crate::metrics::{FailureType, MetricsCollector};
use crate::storage::Storage;

/// Result of applying a set of criteria.
#[derive(Debug, Default)]
pub struct RelationReport {
    /// New edges per criteria name, in input order.
    pub inserted: Vec<(String, u64)>,
    pub failures: Vec<RelationError>,
}

impl RelationReport {
    pub fn total_inserted(&self) -> u64 {
        self.inserted.iter().map(|(_, n)| n).sum()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Materializes relation criteria into edges, one transaction each.
#[derive(Clone)]
pub struct RelationBuilder {
    storage: Arc<dyn Storage>,
    metrics: Arc<MetricsCollector>,
}

impl std::fmt::Debug for RelationBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationBuilder").finish_non_exhaustive()
    }
}

impl RelationBuilder {
    pub fn new(storage: Arc<dyn Storage>, metrics: Arc<MetricsCollector>) -> Self {
        Self { storage, metrics }
    }

    /// Applies every criteria. A failing criteria is reported and the rest
    /// still run.
    pub async fn store_relations(
        &self,
        criteria: &[RelationCriteria],
    ) -> RelationReport {
        let mut report = RelationReport::default();
        for item in criteria {
            match self.storage.store_relation(item).await {
                Ok(inserted) => {
                    info!(
                        relation.name = %item.name,
                        relation.kind = %item.kind,
                        relation.related_kind = %item.related_kind,
                        inserted,
                        "relation stored"
                    );
                    report.inserted.push((item.name.clone(), inserted));
                }
                Err(source) => {
                    self.metrics.process_error(FailureType::Relation);
                    error!(
                        relation.name = %item.name,
                        error = %source,
                        "relation failed"
                    );
                    report.failures.push(RelationError {
                        criteria: item.name.clone(),
                        source,
                    });
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::metrics::PROCESS_ERRORS;
    use crate::storage::MockStorage;
    use mockall::predicate::function;

    fn criteria(name: &str) -> RelationCriteria {
        RelationCriteria {
            name: name.into(),
            kind: "AWS_EC2".into(),
            metadata_key: "vpc".into(),
            metadata_value: "vpc-1".into(),
            related_kind: "AWS_RDS".into(),
            related_metadata_key: "vpc".into(),
            related_metadata_value: "vpc-1".into(),
        }
    }

    #[tokio::test]
    async fn failing_criteria_does_not_stop_the_rest() {
        let mut storage = MockStorage::new();
        storage
            .expect_store_relation()
            .with(function(|c: &RelationCriteria| c.name == "bad"))
            .returning(|_| Err(StorageError::Internal("deadlock".into())));
        storage
            .expect_store_relation()
            .with(function(|c: &RelationCriteria| c.name == "good"))
            .returning(|_| Ok(4));

        let metrics = Arc::new(MetricsCollector::new());
        let builder = RelationBuilder::new(Arc::new(storage), metrics.clone());
        let report = builder
            .store_relations(&[criteria("bad"), criteria("good")])
            .await;

        assert_eq!(report.inserted, vec![("good".to_string(), 4)]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].criteria, "bad");
        assert_eq!(report.total_inserted(), 4);
        assert!(!report.is_success());
        assert_eq!(
            metrics.counter(PROCESS_ERRORS, &[("failure_type", "relation")]),
            1
        );
    }
}
