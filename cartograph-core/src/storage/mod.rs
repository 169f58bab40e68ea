//! Relational persistence for discovered resources.
//!
//! [`Storage`] is the port the processor, the relation builder and the HTTP
//! API depend on. [`PostgresStorage`] is the production backend and
//! [`InMemoryStorage`] mirrors its semantics for tests and local runs.

use async_trait::async_trait;
use cartograph_model::{
    MetadataCount, RelationCriteria, RelationEdge, Resource, ResourceCount,
    ResourceFilter,
};

use crate::error::{Result, StorageError};

pub mod memory;
pub mod postgres;
pub mod query;

pub use memory::InMemoryStorage;
pub use postgres::PostgresStorage;
pub use query::ResourceQuery;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Storage: Send + Sync {
    /// Creates or migrates the schema. Safe to call repeatedly.
    async fn prepare(&self) -> Result<()>;

    /// Upserts a batch atomically.
    ///
    /// Resources are keyed by external id, metadata by (resource, key) with
    /// the new value winning, and `related_with` entries become edges to
    /// already stored resources. Missing targets and existing edges are
    /// skipped. Any failure rolls the whole batch back.
    async fn persist(&self, resources: &[Resource]) -> Result<()>;

    /// Resources matching every set predicate, one per uuid, with their
    /// metadata and first-level relations.
    async fn find(&self, filter: &ResourceFilter) -> Result<Vec<Resource>>;

    /// Atomically allocates the next scan version for (source, kind).
    async fn next_version_for_resource(
        &self,
        source: &str,
        kind: &str,
    ) -> Result<i32>;

    /// Materializes one criteria as edges and returns how many were new.
    async fn store_relation(&self, criteria: &RelationCriteria) -> Result<u64>;

    async fn get_relations(&self) -> Result<Vec<RelationEdge>>;

    /// Resource totals for the latest version of every (source, kind).
    async fn resource_counts(&self) -> Result<Vec<ResourceCount>>;

    /// Metadata pairs shared by more than two latest-version resources.
    async fn metadata_counts(&self) -> Result<Vec<MetadataCount>>;
}

/// Minimum number of resources sharing a metadata pair before it shows up
/// in [`Storage::metadata_counts`].
pub const METADATA_COUNT_THRESHOLD: i64 = 2;

/// Rejects criteria with an empty field before any SQL runs.
pub fn validate_criteria(criteria: &RelationCriteria) -> Result<()> {
    match criteria.fields().iter().find(|(_, value)| value.trim().is_empty()) {
        Some((field, _)) => Err(StorageError::InvalidQuery(format!(
            "relation criteria '{}' is missing {field}",
            criteria.name
        ))),
        None => Ok(()),
    }
}
