//! Configuration for Cartograph.
//!
//! A single YAML document describes the organization, storage engines,
//! discovery sources and relation criteria. [`ConfigLoader`] parses it and
//! [`ConfigValidator`] checks it, naming the offending field on failure.

#![allow(missing_docs)]

pub mod error;
pub mod loader;
pub mod models;
pub mod validation;

pub use error::{ConfigError, Result};
pub use loader::ConfigLoader;
pub use models::{
    AppConfig, Discovery, Organization, PostgresEngine, RelationSet,
    SourceEntry, StorageConfig,
};
pub use validation::ConfigValidator;
