//! Core data model definitions shared across Cartograph crates.
#![allow(missing_docs)]

pub mod api;
pub mod error;
pub mod filter;
pub mod kinds;
pub mod relation;
pub mod resource;
pub mod source;

// Intentionally curated re-exports for downstream consumers.
pub use api::{ListResourceResponse, RelationView, ResourceView};
pub use error::{ModelError, Result as ModelResult};
pub use filter::{
    DEFAULT_PAGE, DEFAULT_PER_PAGE, MAX_PER_PAGE, Pagination, ResourceFilter,
};
pub use kinds::{META_KEY_SCANNER_LABEL, ResourceKind, SourceType};
pub use relation::{MetadataCount, RelationCriteria, RelationEdge, ResourceCount};
pub use resource::{MetaData, MetaDataList, Resource};
pub use source::{CONFIG_FROM, FIELD_TAGS, SourceConfig};
