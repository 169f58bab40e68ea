use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use cartograph_model::{Resource, ResourceKind, SourceConfig};
use tracing::info;

use super::{AwsClient, AwsSettings, Page, Tags};
use crate::error::ScanError;
use crate::scanner::{FieldMapper, ResourceSink, Scanner};

pub const FIELD_INSTANCE_ID: &str = "instanceId";
pub const FIELD_IMAGE_ID: &str = "imageId";
pub const FIELD_PRIVATE_DNS_NAME: &str = "privateDNSName";
pub const FIELD_INSTANCE_TYPE: &str = "instanceType";
pub const FIELD_ARCHITECTURE: &str = "architecture";
pub const FIELD_INSTANCE_LIFECYCLE: &str = "instanceLifecycle";
pub const FIELD_INSTANCE_STATE: &str = "instanceState";
pub const FIELD_VPC_ID: &str = "vpcId";

/// Instance states requested from the API; every lifecycle state.
pub const INSTANCE_STATES: [&str; 6] = [
    "running",
    "pending",
    "shutting-down",
    "terminated",
    "stopping",
    "stopped",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ec2Instance {
    pub instance_id: String,
    pub image_id: String,
    pub private_dns_name: String,
    pub instance_type: String,
    pub architecture: String,
    pub instance_lifecycle: String,
    pub state: String,
    pub vpc_id: String,
    pub tags: Tags,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Ec2Api: Send + Sync {
    async fn describe_instances(
        &self,
        next_token: Option<String>,
    ) -> Result<Page<Ec2Instance>, ScanError>;
}

#[derive(Clone)]
pub struct AwsEc2Scanner {
    name: String,
    fields: Vec<String>,
    schedule: Option<String>,
    api: Arc<dyn Ec2Api>,
}

impl fmt::Debug for AwsEc2Scanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsEc2Scanner")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl AwsEc2Scanner {
    pub fn new(
        name: impl Into<String>,
        fields: Vec<String>,
        api: Arc<dyn Ec2Api>,
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

    fn to_resource(&self, instance: &Ec2Instance, version: i32) -> Resource {
        let kind = ResourceKind::AwsEc2.as_str();
        let mut resource = Resource::new(
            kind,
            Resource::derive_uuid(kind, &instance.instance_id),
            instance.instance_id.clone(),
            instance.instance_id.clone(),
            self.name.clone(),
            version,
        );
        let meta = FieldMapper::new(&self.fields)
            .field(FIELD_INSTANCE_ID, || instance.instance_id.clone())
            .field(FIELD_IMAGE_ID, || instance.image_id.clone())
            .field(FIELD_PRIVATE_DNS_NAME, || instance.private_dns_name.clone())
            .field(FIELD_INSTANCE_TYPE, || instance.instance_type.clone())
            .field(FIELD_ARCHITECTURE, || instance.architecture.clone())
            .field(FIELD_INSTANCE_LIFECYCLE, || {
                instance.instance_lifecycle.clone()
            })
            .field(FIELD_INSTANCE_STATE, || instance.state.clone())
            .field(FIELD_VPC_ID, || instance.vpc_id.clone())
            .tags(|| instance.tags.clone())
            .meta_data();
        resource.extend_meta_data(&meta);
        resource
    }
}

#[async_trait]
impl Scanner for AwsEc2Scanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        ResourceKind::AwsEc2.as_str()
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
            let page = self.api.describe_instances(next_token.take()).await?;
            for instance in &page.items {
                output.emit(self.to_resource(instance, version)).await?;
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
