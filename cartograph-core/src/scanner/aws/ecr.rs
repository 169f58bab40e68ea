use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use cartograph_model::{FIELD_TAGS, Resource, ResourceKind, SourceConfig};
use tracing::{info, warn};

use super::{AwsClient, AwsSettings, Page, Tags};
use crate::error::ScanError;
use crate::scanner::{FieldMapper, ResourceSink, Scanner};

pub const FIELD_REPOSITORY_NAME: &str = "repositoryName";
pub const FIELD_REPOSITORY_ARN: &str = "repositoryArn";
pub const FIELD_REGISTRY_ID: &str = "registryID";
pub const FIELD_REPOSITORY_URI: &str = "repositoryURI";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EcrRepository {
    pub name: String,
    pub arn: String,
    pub registry_id: String,
    pub uri: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EcrApi: Send + Sync {
    async fn describe_repositories(
        &self,
        next_token: Option<String>,
    ) -> Result<Page<EcrRepository>, ScanError>;

    async fn repository_tags(&self, arn: &str) -> Result<Tags, ScanError>;
}

/// Container registry repositories, keyed by repository ARN.
#[derive(Clone)]
pub struct AwsEcrScanner {
    name: String,
    fields: Vec<String>,
    schedule: Option<String>,
    api: Arc<dyn EcrApi>,
}

impl fmt::Debug for AwsEcrScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsEcrScanner")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl AwsEcrScanner {
    pub fn new(
        name: impl Into<String>,
        fields: Vec<String>,
        api: Arc<dyn EcrApi>,
    ) -> Self {
        Self {
            name: name.into(),
            fields,
            schedule: None,
            api,
        }
    }

    pub fn from_source(source: &SourceConfig) -> Result<Self, ScanError> {
        let settings = AwsSettings::from_source(source)?;
        settings.require_account_id()?;
        let mut scanner = Self::new(
            source.name.clone(),
            source.fields.clone(),
            Arc::new(AwsClient::new(settings)),
        );
        scanner.schedule = source.schedule.clone();
        Ok(scanner)
    }

    async fn tags_for(&self, arn: &str) -> Tags {
        if !self.fields.iter().any(|f| f == FIELD_TAGS) {
            return Tags::new();
        }
        self.api.repository_tags(arn).await.unwrap_or_else(|err| {
            warn!(
                scanner.name = %self.name,
                arn,
                error = %err,
                "unable to read repository tags"
            );
            Tags::new()
        })
    }

    fn to_resource(
        &self,
        repository: &EcrRepository,
        tags: Tags,
        version: i32,
    ) -> Resource {
        let kind = ResourceKind::AwsEcr.as_str();
        let mut resource = Resource::new(
            kind,
            Resource::derive_uuid(kind, &repository.arn),
            repository.name.clone(),
            repository.arn.clone(),
            self.name.clone(),
            version,
        );
        let meta = FieldMapper::new(&self.fields)
            .field(FIELD_REPOSITORY_NAME, || repository.name.clone())
            .field(FIELD_REPOSITORY_ARN, || repository.arn.clone())
            .field(FIELD_REGISTRY_ID, || repository.registry_id.clone())
            .field(FIELD_REPOSITORY_URI, || repository.uri.clone())
            .tags(move || tags.clone())
            .meta_data();
        resource.extend_meta_data(&meta);
        resource
    }
}

#[async_trait]
impl Scanner for AwsEcrScanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        ResourceKind::AwsEcr.as_str()
    }

    fn schedule(&self) -> Option<&str> {
        self.schedule.as_deref()
    }

    async fn scan(
        &self,
        output: &ResourceSink,
        version: i32,
    ) -> Result<(), ScanError> {
        let mut total = 0usize;
        let mut next_token = None;
        loop {
            let page = self.api.describe_repositories(next_token.take()).await?;
            for repository in &page.items {
                let tags = self.tags_for(&repository.arn).await;
                output
                    .emit(self.to_resource(repository, tags, version))
                    .await?;
                total += 1;
            }
            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        info!(
            scanner.name = %self.name,
            scanner.kind = self.kind(),
            total_resource_discovered = total,
            "scan completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_arn_is_the_external_id() {
        let mut api = MockEcrApi::new();
        api.expect_describe_repositories().times(1).returning(|_| {
            Ok(Page::last(vec![EcrRepository {
                name: "api".into(),
                arn: "arn:aws:ecr:eu-west-1:123456789012:repository/api".into(),
                registry_id: "123456789012".into(),
                uri: "123456789012.dkr.ecr.eu-west-1.amazonaws.com/api".into(),
            }]))
        });
        api.expect_repository_tags().times(1).returning(|_| {
            Ok(Tags::from([("owner".to_string(), "platform".to_string())]))
        });

        let scanner = AwsEcrScanner::new(
            "ecr",
            vec![
                FIELD_REPOSITORY_URI.to_string(),
                FIELD_REGISTRY_ID.to_string(),
                FIELD_TAGS.to_string(),
            ],
            Arc::new(api),
        );
        let (sink, mut rx) = ResourceSink::channel(2);
        scanner.scan(&sink, 1).await.unwrap();
        drop(sink);

        let repo = rx.recv().await.unwrap();
        assert_eq!(repo.name, "api");
        assert_eq!(
            repo.external_id,
            "arn:aws:ecr:eu-west-1:123456789012:repository/api"
        );
        assert_eq!(repo.find_meta_value(FIELD_REGISTRY_ID), Some("123456789012"));
        assert_eq!(repo.find_meta_value("tag_owner"), Some("platform"));
        assert_eq!(repo.find_meta_value(FIELD_REPOSITORY_NAME), None);
    }
}
