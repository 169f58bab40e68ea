use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use cartograph_model::{FIELD_TAGS, Resource, ResourceKind, SourceConfig};
use tracing::{info, warn};

use super::{AwsClient, AwsSettings, Tags};
use crate::error::ScanError;
use crate::scanner::{FieldMapper, ResourceSink, Scanner};

pub const FIELD_BUCKET_NAME: &str = "bucketName";
pub const FIELD_REGION: &str = "region";
pub const FIELD_ARN: &str = "arn";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3Bucket {
    pub name: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait S3Api: Send + Sync {
    async fn list_buckets(&self) -> Result<Vec<S3Bucket>, ScanError>;

    /// Bucket tags; an untagged bucket yields an empty set.
    async fn bucket_tags(&self, bucket: &str) -> Result<Tags, ScanError>;
}

#[derive(Clone)]
pub struct AwsS3Scanner {
    name: String,
    region: String,
    fields: Vec<String>,
    schedule: Option<String>,
    api: Arc<dyn S3Api>,
}

impl fmt::Debug for AwsS3Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsS3Scanner")
            .field("name", &self.name)
            .field("region", &self.region)
            .field("fields", &self.fields)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl AwsS3Scanner {
    pub fn new(
        name: impl Into<String>,
        region: impl Into<String>,
        fields: Vec<String>,
        api: Arc<dyn S3Api>,
    ) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            fields,
            schedule: None,
            api,
        }
    }

    pub fn from_source(source: &SourceConfig) -> Result<Self, ScanError> {
        let settings = AwsSettings::from_source(source)?;
        let mut scanner = Self::new(
            source.name.clone(),
            settings.region.clone(),
            source.fields.clone(),
            Arc::new(AwsClient::new(settings)),
        );
        scanner.schedule = source.schedule.clone();
        Ok(scanner)
    }

    async fn tags_for(&self, bucket: &str) -> Tags {
        if !self.fields.iter().any(|f| f == FIELD_TAGS) {
            return Tags::new();
        }
        match self.api.bucket_tags(bucket).await {
            Ok(tags) => tags,
            Err(err) => {
                warn!(
                    scanner.name = %self.name,
                    bucket,
                    error = %err,
                    "unable to read bucket tags"
                );
                Tags::new()
            }
        }
    }

    fn to_resource(&self, bucket: &S3Bucket, tags: Tags, version: i32) -> Resource {
        let kind = ResourceKind::AwsS3.as_str();
        let mut resource = Resource::new(
            kind,
            Resource::derive_uuid(kind, &bucket.name),
            bucket.name.clone(),
            bucket.name.clone(),
            self.name.clone(),
            version,
        );
        let meta = FieldMapper::new(&self.fields)
            .field(FIELD_BUCKET_NAME, || bucket.name.clone())
            .field(FIELD_REGION, || self.region.clone())
            .field(FIELD_ARN, || format!("arn:aws:s3:::{}", bucket.name))
            .tags(move || tags.clone())
            .meta_data();
        resource.extend_meta_data(&meta);
        resource
    }
}

#[async_trait]
impl Scanner for AwsS3Scanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        ResourceKind::AwsS3.as_str()
    }

    fn schedule(&self) -> Option<&str> {
        self.schedule.as_deref()
    }

    async fn scan(
        &self,
        output: &ResourceSink,
        version: i32,
    ) -> Result<(), ScanError> {
        let buckets = self.api.list_buckets().await?;
        for bucket in &buckets {
            let tags = self.tags_for(&bucket.name).await;
            output.emit(self.to_resource(bucket, tags, version)).await?;
        }

        info!(
            scanner.name = %self.name,
            scanner.kind = self.kind(),
            total_resource_discovered = buckets.len(),
            "scan completed"
        );
        Ok(())
    }
}
