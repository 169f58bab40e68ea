//! Cloud provider adapters.
//!
//! Each scanner talks to its service through a small API trait so the
//! mapping logic can be exercised without network access. [`AwsClient`]
//! implements every trait over signed HTTPS requests.

use std::collections::BTreeMap;
use std::fmt;

use cartograph_model::SourceConfig;

use crate::error::ScanError;

pub mod client;
pub mod ec2;
pub mod ecr;
pub mod rds;
pub mod s3;
pub mod sigv4;

pub use client::AwsClient;
pub use ec2::{AwsEc2Scanner, Ec2Api, Ec2Instance};
pub use ecr::{AwsEcrScanner, EcrApi, EcrRepository};
pub use rds::{AwsRdsScanner, RdsApi, RdsInstance};
pub use s3::{AwsS3Scanner, S3Api, S3Bucket};

/// Page size requested from paginated AWS APIs.
pub const PAGE_SIZE: u32 = 100;

/// Credential and location keys a cloud source may inherit through
/// `config_from`.
pub const SHARED_KEYS: [&str; 4] =
    ["access_key", "secret_key", "session_token", "region"];

#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Connection settings resolved from a cloud source's configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsSettings {
    pub region: String,
    pub account_id: Option<String>,
    pub credentials: AwsCredentials,
    /// Overrides the regional service endpoint, for local emulators.
    pub endpoint: Option<String>,
}

impl AwsSettings {
    pub fn from_source(source: &SourceConfig) -> Result<Self, ScanError> {
        let require = |key: &str| {
            source.get(key).map(str::to_string).ok_or_else(|| {
                ScanError::Config(format!(
                    "source '{}' requires {key}",
                    source.name
                ))
            })
        };

        Ok(Self {
            region: require("region")?,
            account_id: source.get("account_id").map(str::to_string),
            credentials: AwsCredentials {
                access_key_id: require("access_key")?,
                secret_access_key: require("secret_key")?,
                session_token: source.get("session_token").map(str::to_string),
            },
            endpoint: source.get("endpoint").map(str::to_string),
        })
    }

    pub fn require_account_id(&self) -> Result<&str, ScanError> {
        self.account_id.as_deref().ok_or_else(|| {
            ScanError::Config("account_id is required for this source".into())
        })
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}

/// Tag key/value pairs as returned by most AWS APIs.
pub type Tags = BTreeMap<String, String>;
