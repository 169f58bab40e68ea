use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use cartograph_model::{Resource, ResourceKind, SourceConfig};
use tracing::info;

use super::{AwsClient, AwsSettings, Page, Tags};
use crate::error::ScanError;
use crate::scanner::{FieldMapper, ResourceSink, Scanner};

pub const FIELD_INSTANCE_ID: &str = "instanceID";
pub const FIELD_REGION: &str = "region";
pub const FIELD_ARN: &str = "arn";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RdsInstance {
    pub identifier: String,
    pub tags: Tags,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RdsApi: Send + Sync {
    async fn describe_db_instances(
        &self,
        marker: Option<String>,
    ) -> Result<Page<RdsInstance>, ScanError>;
}

#[derive(Clone)]
pub struct AwsRdsScanner {
    name: String,
    region: String,
    account_id: String,
    fields: Vec<String>,
    schedule: Option<String>,
    api: Arc<dyn RdsApi>,
}

impl fmt::Debug for AwsRdsScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsRdsScanner")
            .field("name", &self.name)
            .field("region", &self.region)
            .field("account_id", &self.account_id)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

impl AwsRdsScanner {
    pub fn new(
        name: impl Into<String>,
        region: impl Into<String>,
        account_id: impl Into<String>,
        fields: Vec<String>,
        api: Arc<dyn RdsApi>,
    ) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            account_id: account_id.into(),
            fields,
            schedule: None,
            api,
        }
    }

    pub fn from_source(source: &SourceConfig) -> Result<Self, ScanError> {
        let settings = AwsSettings::from_source(source)?;
        let account_id = settings.require_account_id()?.to_string();
        let mut scanner = Self::new(
            source.name.clone(),
            settings.region.clone(),
            account_id,
            source.fields.clone(),
            Arc::new(AwsClient::new(settings)),
        );
        scanner.schedule = source.schedule.clone();
        Ok(scanner)
    }

    fn arn(&self, identifier: &str) -> String {
        format!(
            "arn:aws:rds:{}:{}:db:{identifier}",
            self.region, self.account_id
        )
    }

    fn to_resource(&self, instance: &RdsInstance, version: i32) -> Resource {
        let kind = ResourceKind::AwsRds.as_str();
        let mut resource = Resource::new(
            kind,
            Resource::derive_uuid(kind, &instance.identifier),
            instance.identifier.clone(),
            instance.identifier.clone(),
            self.name.clone(),
            version,
        );
        let meta = FieldMapper::new(&self.fields)
            .field(FIELD_INSTANCE_ID, || instance.identifier.clone())
            .field(FIELD_REGION, || self.region.clone())
            .field(FIELD_ARN, || self.arn(&instance.identifier))
            .tags(|| instance.tags.clone())
            .meta_data();
        resource.extend_meta_data(&meta);
        resource
    }
}

#[async_trait]
impl Scanner for AwsRdsScanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        ResourceKind::AwsRds.as_str()
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
        let mut marker = None;
        loop {
            let page = self.api.describe_db_instances(marker.take()).await?;
            for instance in &page.items {
                output.emit(self.to_resource(instance, version)).await?;
                total += 1;
            }
            match page.next_token {
                Some(token) if !token.is_empty() => marker = Some(token),
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
    async fn builds_arn_from_region_and_account() {
        let mut api = MockRdsApi::new();
        api.expect_describe_db_instances().times(1).returning(|_| {
            Ok(Page::last(vec![RdsInstance {
                identifier: "orders-db".into(),
                tags: Tags::from([("env".to_string(), "prod".to_string())]),
            }]))
        });

        let scanner = AwsRdsScanner::new(
            "rds",
            "us-east-1",
            "123456789012",
            vec![
                FIELD_ARN.to_string(),
                FIELD_INSTANCE_ID.to_string(),
                "tags".to_string(),
            ],
            Arc::new(api),
        );
        let (sink, mut rx) = ResourceSink::channel(2);
        scanner.scan(&sink, 9).await.unwrap();
        drop(sink);

        let db = rx.recv().await.unwrap();
        assert_eq!(db.kind, "AWS_RDS");
        assert_eq!(db.external_id, "orders-db");
        assert_eq!(
            db.find_meta_value(FIELD_ARN),
            Some("arn:aws:rds:us-east-1:123456789012:db:orders-db")
        );
        assert_eq!(db.find_meta_value(FIELD_INSTANCE_ID), Some("orders-db"));
        assert_eq!(db.find_meta_value("tag_env"), Some("prod"));
        assert_eq!(db.find_meta_value(FIELD_REGION), None);
        assert!(rx.recv().await.is_none());
    }
}
