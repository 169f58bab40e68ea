//! Signed HTTPS client for the AWS query (XML) and JSON protocols.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use super::ec2::{Ec2Api, Ec2Instance, INSTANCE_STATES};
use super::ecr::{EcrApi, EcrRepository};
use super::rds::{RdsApi, RdsInstance};
use super::s3::{S3Api, S3Bucket};
use super::sigv4::{self, SigningScope};
use super::{AwsSettings, PAGE_SIZE, Page, Tags};
use crate::error::ScanError;
use crate::retry::{RetryPolicy, retry_with_backoff};

const EC2_API_VERSION: &str = "2016-11-15";
const RDS_API_VERSION: &str = "2014-10-31";
const ECR_TARGET_PREFIX: &str = "AmazonEC2ContainerRegistry_V20150921";
const JSON_CONTENT_TYPE: &str = "application/x-amz-json-1.1";

#[derive(Debug, Clone)]
pub struct AwsClient {
    http: reqwest::Client,
    settings: AwsSettings,
    retry: RetryPolicy,
}

/// A request before signing.
#[derive(Debug, Clone)]
struct AwsRequest {
    service: &'static str,
    method: Method,
    url: Url,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl AwsClient {
    pub fn new(settings: AwsSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self, host_prefix: &str) -> Result<Url, ScanError> {
        let raw = match &self.settings.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!(
                "https://{host_prefix}.{}.amazonaws.com/",
                self.settings.region
            ),
        };
        Url::parse(&raw)
            .map_err(|err| ScanError::Config(format!("invalid endpoint {raw}: {err}")))
    }

    fn query_url(
        &self,
        host_prefix: &str,
        params: &[(&str, String)],
    ) -> Result<Url, ScanError> {
        let mut url = self.endpoint(host_prefix)?;
        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
        Ok(url)
    }

    async fn send_once(&self, request: &AwsRequest) -> Result<String, ScanError> {
        let signed = sigv4::sign(
            &self.settings.credentials,
            SigningScope {
                region: &self.settings.region,
                service: request.service,
                time: Utc::now(),
            },
            request.method.as_str(),
            &request.url,
            &request.headers,
            &request.body,
        );

        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .body(request.body.clone());
        for (name, value) in request.headers.iter().chain(signed.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_failure(request.service, status, body))
        }
    }

    async fn send(&self, request: AwsRequest) -> Result<String, ScanError> {
        debug!(service = request.service, url = %request.url, "aws request");
        retry_with_backoff(self.retry, request.service, || self.send_once(&request))
            .await
    }

    async fn ecr_call(
        &self,
        action: &str,
        payload: serde_json::Value,
    ) -> Result<String, ScanError> {
        let request = AwsRequest {
            service: "ecr",
            method: Method::POST,
            url: self.endpoint("api.ecr")?,
            headers: vec![
                ("content-type".into(), JSON_CONTENT_TYPE.into()),
                ("x-amz-target".into(), format!("{ECR_TARGET_PREFIX}.{action}")),
            ],
            body: serde_json::to_vec(&payload)?,
        };
        self.send(request).await
    }
}

/// Maps a non-success response to a retryable or permanent error.
fn classify_failure(service: &str, status: StatusCode, body: String) -> ScanError {
    const THROTTLING_CODES: [&str; 5] = [
        "Throttling",
        "ThrottlingException",
        "RequestLimitExceeded",
        "TooManyRequestsException",
        "SlowDown",
    ];

    let message = format!("{service} responded {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || THROTTLING_CODES.iter().any(|code| body.contains(code))
    {
        ScanError::Throttled(message)
    } else if status.is_server_error() {
        ScanError::Provider(message)
    } else {
        ScanError::Rejected(message)
    }
}

fn non_empty(token: Option<String>) -> Option<String> {
    token.filter(|t| !t.trim().is_empty())
}

// EC2 query protocol payloads.

#[derive(Debug, Deserialize)]
struct ItemSet<T> {
    #[serde(rename = "item", default = "Vec::new")]
    items: Vec<T>,
}

impl<T> Default for ItemSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeInstancesResponse {
    #[serde(default)]
    reservation_set: ItemSet<Reservation>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Reservation {
    #[serde(default)]
    instances_set: ItemSet<InstanceXml>,
}

#[derive(Debug, Default, Deserialize)]
struct TagXml {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct InstanceStateXml {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceXml {
    instance_id: String,
    #[serde(default)]
    image_id: String,
    #[serde(default)]
    private_dns_name: String,
    #[serde(default)]
    instance_type: String,
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    instance_lifecycle: String,
    #[serde(default)]
    instance_state: InstanceStateXml,
    #[serde(default)]
    vpc_id: String,
    #[serde(default)]
    tag_set: ItemSet<TagXml>,
}

pub(crate) fn parse_describe_instances(xml: &str) -> Result<Page<Ec2Instance>, ScanError> {
    let response: DescribeInstancesResponse = quick_xml::de::from_str(xml)?;
    let items = response
        .reservation_set
        .items
        .into_iter()
        .flat_map(|reservation| reservation.instances_set.items)
        .map(|instance| Ec2Instance {
            instance_id: instance.instance_id,
            image_id: instance.image_id,
            private_dns_name: instance.private_dns_name,
            instance_type: instance.instance_type,
            architecture: instance.architecture,
            instance_lifecycle: instance.instance_lifecycle,
            state: instance.instance_state.name,
            vpc_id: instance.vpc_id,
            tags: instance
                .tag_set
                .items
                .into_iter()
                .map(|tag| (tag.key, tag.value))
                .collect(),
        })
        .collect();
    Ok(Page {
        items,
        next_token: non_empty(response.next_token),
    })
}

// RDS query protocol payloads.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeDbInstancesResponse {
    #[serde(rename = "DescribeDBInstancesResult")]
    result: DescribeDbInstancesResult,
}

#[derive(Debug, Deserialize)]
struct DescribeDbInstancesResult {
    #[serde(rename = "DBInstances", default)]
    instances: DbInstanceList,
    #[serde(rename = "Marker", default)]
    marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DbInstanceList {
    #[serde(rename = "DBInstance", default)]
    items: Vec<DbInstanceXml>,
}

#[derive(Debug, Deserialize)]
struct DbInstanceXml {
    #[serde(rename = "DBInstanceIdentifier")]
    identifier: String,
    #[serde(rename = "TagList", default)]
    tag_list: TagList,
}

#[derive(Debug, Default, Deserialize)]
struct TagList {
    #[serde(rename = "Tag", default)]
    items: Vec<PascalTag>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PascalTag {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}

pub(crate) fn parse_describe_db_instances(
    xml: &str,
) -> Result<Page<RdsInstance>, ScanError> {
    let response: DescribeDbInstancesResponse = quick_xml::de::from_str(xml)?;
    let items = response
        .result
        .instances
        .items
        .into_iter()
        .map(|instance| RdsInstance {
            identifier: instance.identifier,
            tags: instance
                .tag_list
                .items
                .into_iter()
                .map(|tag| (tag.key, tag.value))
                .collect(),
        })
        .collect();
    Ok(Page {
        items,
        next_token: non_empty(response.result.marker),
    })
}

// S3 REST payloads.

#[derive(Debug, Deserialize)]
struct ListAllMyBucketsResult {
    #[serde(rename = "Buckets", default)]
    buckets: BucketList,
}

#[derive(Debug, Default, Deserialize)]
struct BucketList {
    #[serde(rename = "Bucket", default)]
    items: Vec<BucketXml>,
}

#[derive(Debug, Deserialize)]
struct BucketXml {
    #[serde(rename = "Name")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct Tagging {
    #[serde(rename = "TagSet", default)]
    tag_set: TagList,
}

pub(crate) fn parse_list_buckets(xml: &str) -> Result<Vec<S3Bucket>, ScanError> {
    let result: ListAllMyBucketsResult = quick_xml::de::from_str(xml)?;
    Ok(result
        .buckets
        .items
        .into_iter()
        .map(|bucket| S3Bucket { name: bucket.name })
        .collect())
}

pub(crate) fn parse_bucket_tagging(xml: &str) -> Result<Tags, ScanError> {
    let tagging: Tagging = quick_xml::de::from_str(xml)?;
    Ok(tagging
        .tag_set
        .items
        .into_iter()
        .map(|tag| (tag.key, tag.value))
        .collect())
}

// ECR JSON payloads.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeRepositoriesOutput {
    #[serde(default)]
    repositories: Vec<RepositoryJson>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryJson {
    repository_name: String,
    repository_arn: String,
    #[serde(default)]
    registry_id: String,
    #[serde(default)]
    repository_uri: String,
}

#[derive(Debug, Deserialize)]
struct ListTagsOutput {
    #[serde(default)]
    tags: Vec<PascalTag>,
}

pub(crate) fn parse_describe_repositories(
    body: &str,
) -> Result<Page<EcrRepository>, ScanError> {
    let output: DescribeRepositoriesOutput = serde_json::from_str(body)?;
    Ok(Page {
        items: output
            .repositories
            .into_iter()
            .map(|repo| EcrRepository {
                name: repo.repository_name,
                arn: repo.repository_arn,
                registry_id: repo.registry_id,
                uri: repo.repository_uri,
            })
            .collect(),
        next_token: non_empty(output.next_token),
    })
}

#[async_trait]
impl Ec2Api for AwsClient {
    async fn describe_instances(
        &self,
        next_token: Option<String>,
    ) -> Result<Page<Ec2Instance>, ScanError> {
        let state_keys: Vec<String> = (1..=INSTANCE_STATES.len())
            .map(|i| format!("Filter.1.Value.{i}"))
            .collect();
        let mut params = vec![
            ("Action", "DescribeInstances".to_string()),
            ("Version", EC2_API_VERSION.to_string()),
            ("MaxResults", PAGE_SIZE.to_string()),
            ("Filter.1.Name", "instance-state-name".to_string()),
        ];
        for (key, state) in state_keys.iter().zip(INSTANCE_STATES) {
            params.push((key.as_str(), state.to_string()));
        }
        if let Some(token) = next_token {
            params.push(("NextToken", token));
        }

        let request = AwsRequest {
            service: "ec2",
            method: Method::GET,
            url: self.query_url("ec2", &params)?,
            headers: Vec::new(),
            body: Vec::new(),
        };
        parse_describe_instances(&self.send(request).await?)
    }
}

#[async_trait]
impl RdsApi for AwsClient {
    async fn describe_db_instances(
        &self,
        marker: Option<String>,
    ) -> Result<Page<RdsInstance>, ScanError> {
        let mut params = vec![
            ("Action", "DescribeDBInstances".to_string()),
            ("Version", RDS_API_VERSION.to_string()),
            ("MaxRecords", PAGE_SIZE.to_string()),
        ];
        if let Some(marker) = marker {
            params.push(("Marker", marker));
        }

        let request = AwsRequest {
            service: "rds",
            method: Method::GET,
            url: self.query_url("rds", &params)?,
            headers: Vec::new(),
            body: Vec::new(),
        };
        parse_describe_db_instances(&self.send(request).await?)
    }
}

#[async_trait]
impl S3Api for AwsClient {
    async fn list_buckets(&self) -> Result<Vec<S3Bucket>, ScanError> {
        let request = AwsRequest {
            service: "s3",
            method: Method::GET,
            url: self.endpoint("s3")?,
            headers: Vec::new(),
            body: Vec::new(),
        };
        parse_list_buckets(&self.send(request).await?)
    }

    async fn bucket_tags(&self, bucket: &str) -> Result<Tags, ScanError> {
        let mut url = self.endpoint("s3")?;
        url.path_segments_mut()
            .map_err(|_| {
                ScanError::Config("s3 endpoint cannot carry a path".into())
            })?
            .pop_if_empty()
            .push(bucket);
        url.set_query(Some("tagging"));

        let request = AwsRequest {
            service: "s3",
            method: Method::GET,
            url,
            headers: Vec::new(),
            body: Vec::new(),
        };
        match self.send(request).await {
            Ok(body) => parse_bucket_tagging(&body),
            Err(ScanError::Rejected(message)) if message.contains("NoSuchTagSet") => {
                Ok(Tags::new())
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl EcrApi for AwsClient {
    async fn describe_repositories(
        &self,
        next_token: Option<String>,
    ) -> Result<Page<EcrRepository>, ScanError> {
        let mut payload = json!({ "maxResults": PAGE_SIZE });
        if let Some(token) = next_token {
            payload["nextToken"] = json!(token);
        }
        let body = self.ecr_call("DescribeRepositories", payload).await?;
        parse_describe_repositories(&body)
    }

    async fn repository_tags(&self, arn: &str) -> Result<Tags, ScanError> {
        let body = self
            .ecr_call("ListTagsForResource", json!({ "resourceArn": arn }))
            .await?;
        let output: ListTagsOutput = serde_json::from_str(&body)?;
        Ok(output
            .tags
            .into_iter()
            .map(|tag| (tag.key, tag.value))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_describe_instances_page() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<DescribeInstancesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
    <requestId>8f7724cf-496f-496e-8fe3-example</requestId>
    <reservationSet>
        <item>
            <reservationId>r-1234567890abcdef0</reservationId>
            <instancesSet>
                <item>
                    <instanceId>i-1234567890abcdef0</instanceId>
                    <imageId>ami-bff32ccc</imageId>
                    <instanceState>
                        <code>16</code>
                        <name>running</name>
                    </instanceState>
                    <privateDnsName>ip-192-168-1-88.eu-west-1.compute.internal</privateDnsName>
                    <instanceType>t2.micro</instanceType>
                    <vpcId>vpc-1a2b3c4d</vpcId>
                    <architecture>x86_64</architecture>
                    <tagSet>
                        <item>
                            <key>Name</key>
                            <value>web</value>
                        </item>
                    </tagSet>
                </item>
            </instancesSet>
        </item>
    </reservationSet>
    <nextToken>abc</nextToken>
</DescribeInstancesResponse>"#;

        let page = parse_describe_instances(xml).unwrap();
        assert_eq!(page.next_token.as_deref(), Some("abc"));
        assert_eq!(page.items.len(), 1);
        let instance = &page.items[0];
        assert_eq!(instance.instance_id, "i-1234567890abcdef0");
        assert_eq!(instance.state, "running");
        assert_eq!(instance.vpc_id, "vpc-1a2b3c4d");
        assert_eq!(instance.instance_lifecycle, "");
        assert_eq!(instance.tags.get("Name").map(String::as_str), Some("web"));
    }

    #[test]
    fn parses_empty_describe_instances() {
        let xml = r#"<DescribeInstancesResponse xmlns="http://ec2.amazonaws.com/doc/2016-11-15/">
    <requestId>x</requestId>
    <reservationSet/>
</DescribeInstancesResponse>"#;
        let page = parse_describe_instances(xml).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next_token, None);
    }

    #[test]
    fn parses_db_instances_with_marker() {
        let xml = r#"<DescribeDBInstancesResponse xmlns="http://rds.amazonaws.com/doc/2014-10-31/">
  <DescribeDBInstancesResult>
    <DBInstances>
      <DBInstance>
        <DBInstanceIdentifier>orders</DBInstanceIdentifier>
        <Engine>postgres</Engine>
        <TagList>
          <Tag><Key>env</Key><Value>prod</Value></Tag>
        </TagList>
      </DBInstance>
      <DBInstance>
        <DBInstanceIdentifier>billing</DBInstanceIdentifier>
      </DBInstance>
    </DBInstances>
    <Marker>next-marker</Marker>
  </DescribeDBInstancesResult>
  <ResponseMetadata><RequestId>r</RequestId></ResponseMetadata>
</DescribeDBInstancesResponse>"#;
        let page = parse_describe_db_instances(xml).unwrap();
        assert_eq!(page.next_token.as_deref(), Some("next-marker"));
        let ids: Vec<_> = page.items.iter().map(|i| i.identifier.as_str()).collect();
        assert_eq!(ids, vec!["orders", "billing"]);
        assert_eq!(page.items[0].tags.get("env").map(String::as_str), Some("prod"));
        assert!(page.items[1].tags.is_empty());
    }

    #[test]
    fn parses_bucket_listing_and_tags() {
        let xml = r#"<ListAllMyBucketsResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Owner><ID>owner</ID></Owner>
  <Buckets>
    <Bucket><Name>logs</Name><CreationDate>2019-12-11T23:32:47+00:00</CreationDate></Bucket>
    <Bucket><Name>assets</Name><CreationDate>2019-12-11T23:32:47+00:00</CreationDate></Bucket>
  </Buckets>
</ListAllMyBucketsResult>"#;
        let buckets = parse_list_buckets(xml).unwrap();
        assert_eq!(
            buckets,
            vec![
                S3Bucket { name: "logs".into() },
                S3Bucket { name: "assets".into() }
            ]
        );

        let tagging = r#"<Tagging><TagSet><Tag><Key>team</Key><Value>infra</Value></Tag></TagSet></Tagging>"#;
        let tags = parse_bucket_tagging(tagging).unwrap();
        assert_eq!(tags.get("team").map(String::as_str), Some("infra"));
    }

    #[test]
    fn parses_ecr_repositories() {
        let body = r#"{
            "repositories": [{
                "repositoryArn": "arn:aws:ecr:eu-west-1:123456789012:repository/api",
                "registryId": "123456789012",
                "repositoryName": "api",
                "repositoryUri": "123456789012.dkr.ecr.eu-west-1.amazonaws.com/api",
                "createdAt": 1.6e9
            }]
        }"#;
        let page = parse_describe_repositories(body).unwrap();
        assert_eq!(page.items[0].name, "api");
        assert_eq!(page.next_token, None);
    }

    #[test]
    fn throttling_is_retryable() {
        let throttled = classify_failure(
            "ec2",
            StatusCode::SERVICE_UNAVAILABLE,
            "<Code>RequestLimitExceeded</Code>".into(),
        );
        assert!(matches!(throttled, ScanError::Throttled(_)));
        assert!(throttled.is_transient());

        let denied = classify_failure(
            "ec2",
            StatusCode::FORBIDDEN,
            "<Code>UnauthorizedOperation</Code>".into(),
        );
        assert!(!denied.is_transient());
    }
}
