use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Metadata key stamped on every resource with the configured source name.
pub const META_KEY_SCANNER_LABEL: &str = "Scanner-Label";

/// Resource kinds produced by the built-in scanners.
///
/// Stored resources carry the kind as a plain string so that external
/// producers can introduce kinds of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    FileSystem,
    GitHubRepository,
    AwsS3,
    AwsRds,
    AwsEc2,
    AwsEcr,
}

impl ResourceKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::FileSystem => "file_system",
            ResourceKind::GitHubRepository => "GitHubRepository",
            ResourceKind::AwsS3 => "AWS_S3",
            ResourceKind::AwsRds => "AWS_RDS",
            ResourceKind::AwsEc2 => "AWS_EC2",
            ResourceKind::AwsEcr => "AWS_ECR",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configured source types, as written in the `type` field of a source.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum SourceType {
    #[serde(rename = "file_system")]
    FileSystem,
    #[serde(rename = "github_repository")]
    GitHubRepository,
    #[serde(rename = "aws_s3")]
    AwsS3,
    #[serde(rename = "aws_rds")]
    AwsRds,
    #[serde(rename = "aws_ec2")]
    AwsEc2,
    #[serde(rename = "aws_ecr")]
    AwsEcr,
}

impl SourceType {
    pub const ALL: [SourceType; 6] = [
        SourceType::FileSystem,
        SourceType::GitHubRepository,
        SourceType::AwsS3,
        SourceType::AwsRds,
        SourceType::AwsEc2,
        SourceType::AwsEcr,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            SourceType::FileSystem => "file_system",
            SourceType::GitHubRepository => "github_repository",
            SourceType::AwsS3 => "aws_s3",
            SourceType::AwsRds => "aws_rds",
            SourceType::AwsEc2 => "aws_ec2",
            SourceType::AwsEcr => "aws_ecr",
        }
    }

    /// Kind of the resources a source of this type emits.
    pub const fn resource_kind(&self) -> ResourceKind {
        match self {
            SourceType::FileSystem => ResourceKind::FileSystem,
            SourceType::GitHubRepository => ResourceKind::GitHubRepository,
            SourceType::AwsS3 => ResourceKind::AwsS3,
            SourceType::AwsRds => ResourceKind::AwsRds,
            SourceType::AwsEc2 => ResourceKind::AwsEc2,
            SourceType::AwsEcr => ResourceKind::AwsEcr,
        }
    }

    pub const fn is_aws(&self) -> bool {
        matches!(
            self,
            SourceType::AwsS3
                | SourceType::AwsRds
                | SourceType::AwsEc2
                | SourceType::AwsEcr
        )
    }

    /// Configuration keys a source of this type must provide.
    ///
    /// AWS credentials are not listed here since they may be inherited
    /// through `config_from`.
    pub const fn required_keys(&self) -> &'static [&'static str] {
        match self {
            SourceType::FileSystem => &["root_directory"],
            SourceType::GitHubRepository => &["token", "user_or_org"],
            SourceType::AwsS3 => &["region"],
            SourceType::AwsRds | SourceType::AwsEc2 | SourceType::AwsEcr => {
                &["region", "account_id"]
            }
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceType::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s)
            .ok_or_else(|| ModelError::UnknownSourceType(s.to_string()))
    }
}
