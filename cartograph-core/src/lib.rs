//! # Cartograph Core
//!
//! Discovery engine for the Cartograph resource inventory: source scanners,
//! the batching pipeline that persists their output, relational storage,
//! relation materialization and schedules.
//!
//! ## Architecture
//!
//! - [`scanner`]: the [`scanner::Scanner`] capability, its adapters
//!   (filesystem, GitHub, AWS) and the registry that builds them from
//!   source configuration
//! - [`processor`]: concurrent scanners fanned into one batching consumer
//! - [`storage`]: the [`storage::Storage`] port with PostgreSQL and
//!   in-memory backends
//! - [`relation`]: applies relation criteria as edges
//! - [`scheduler`]: recurring and one-shot policies
//! - [`metrics`]: in-process counters and gauges
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cartograph_core::{
//!     metrics::MetricsCollector,
//!     processor::{Processor, ProcessorConfig},
//!     scanner::ScannerRegistry,
//!     storage::InMemoryStorage,
//! };
//! use cartograph_model::{SourceConfig, SourceType};
//!
//! async fn discover() -> Result<(), Box<dyn std::error::Error>> {
//!     let metrics = Arc::new(MetricsCollector::new());
//!     let registry = ScannerRegistry::new(metrics.clone());
//!     let sources = vec![
//!         SourceConfig::new("home", SourceType::FileSystem)
//!             .with_config("root_directory", "/srv/data"),
//!     ];
//!     let scanners = registry.build_all(&sources)?;
//!
//!     let storage = Arc::new(InMemoryStorage::new());
//!     let processor = Processor::new(ProcessorConfig::new(50), storage, metrics);
//!     processor.run_scanners(&scanners).await?.into_result()?;
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]

/// Error types for scans, storage, relations and runs
pub mod error;

/// In-process metrics collector
pub mod metrics;

/// Scanner fan-in and batched persistence
pub mod processor;

/// Relation criteria materialization
pub mod relation;

/// Backoff for transient provider failures
pub mod retry;

/// Source adapters and their registry
pub mod scanner;

/// Recurring and one-shot job policies
pub mod scheduler;

/// Persistence port and backends
pub mod storage;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use error::{
    DiscoveryError, RelationError, Result, ScanError, SchedulerError,
    StorageError,
};
