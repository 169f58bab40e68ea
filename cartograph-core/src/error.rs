use std::time::Duration;

use thiserror::Error;

/// Failure of a single source scan. Never aborts other sources.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Provider request failed: {0}")]
    Provider(String),

    #[error("Provider throttled the request: {0}")]
    Throttled(String),

    #[error("Provider rejected the request: {0}")]
    Rejected(String),

    #[error("Invalid provider response: {0}")]
    Decode(String),

    #[error("Invalid source configuration: {0}")]
    Config(String),

    #[error("Resource sink closed before the scan completed")]
    SinkClosed,

    #[error("Scan task failed: {0}")]
    Task(String),
}

impl ScanError {
    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, ScanError::Throttled(_) | ScanError::Provider(_))
    }
}

impl From<reqwest::Error> for ScanError {
    fn from(err: reqwest::Error) -> Self {
        ScanError::Provider(err.to_string())
    }
}

impl From<quick_xml::DeError> for ScanError {
    fn from(err: quick_xml::DeError) -> Self {
        ScanError::Decode(err.to_string())
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(err: serde_json::Error) -> Self {
        ScanError::Decode(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<cartograph_model::ModelError> for StorageError {
    fn from(err: cartograph_model::ModelError) -> Self {
        StorageError::InvalidQuery(err.to_string())
    }
}

/// Failure while materializing one relation criteria.
#[derive(Error, Debug)]
#[error("relation '{criteria}' failed: {source}")]
pub struct RelationError {
    pub criteria: String,
    #[source]
    pub source: StorageError,
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid schedule '{expression}': {message}")]
    InvalidSchedule { expression: String, message: String },

    #[error("Schedule '{0}' has no upcoming fire time")]
    Exhausted(String),
}

/// Outcome of a discovery run that did not fully succeed.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Discovery run exceeded its deadline of {0:?}")]
    Timeout(Duration),

    #[error(
        "Discovery run partially failed: {failed_scanners} scanner(s) and {failed_batches} batch(es) failed"
    )]
    PartialFailure {
        failed_scanners: usize,
        failed_batches: usize,
    },

    #[error("Scanner setup failed for source '{source_name}': {message}")]
    Setup {
        source_name: String,
        message: String,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, StorageError>;
