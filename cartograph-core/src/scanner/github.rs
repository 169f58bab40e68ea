use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use cartograph_model::{Resource, ResourceKind, SourceConfig};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, LINK, USER_AGENT};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::{FieldMapper, ResourceSink, Scanner};
use crate::error::ScanError;
use crate::retry::{RetryPolicy, retry_with_backoff};

pub const FIELD_COMPANY: &str = "company";
pub const FIELD_HOMEPAGE: &str = "homepage";
pub const FIELD_LANGUAGE: &str = "language";
pub const FIELD_ORGANIZATION: &str = "organization";
pub const FIELD_STARS: &str = "stars";
pub const FIELD_GIT_URL: &str = "git_url";
pub const FIELD_OWNER_NAME: &str = "owner_name";
pub const FIELD_OWNER_LOGIN: &str = "owner_login";
pub const FIELD_TOPICS: &str = "topics";

const DEFAULT_API_URL: &str = "https://api.github.com";
const PER_PAGE: u32 = 100;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RepositoryOwner {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RepositoryOrganization {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Subset of the repository payload the scanner maps to metadata.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Repository {
    pub full_name: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub stargazers_count: u64,
    #[serde(default)]
    pub git_url: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub owner: Option<RepositoryOwner>,
    #[serde(default)]
    pub organization: Option<RepositoryOrganization>,
}

/// Repository listing for a user or organization, across all pages.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GitHubClient: Send + Sync {
    async fn list_repositories(
        &self,
        user_or_org: &str,
    ) -> Result<Vec<Repository>, ScanError>;
}

/// REST client for the GitHub API.
#[derive(Clone)]
pub struct HttpGitHubClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    retry: RetryPolicy,
}

impl fmt::Debug for HttpGitHubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpGitHubClient")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .field("retry", &self.retry)
            .finish()
    }
}

impl HttpGitHubClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_API_URL.to_string(),
            token: token.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch_page(
        &self,
        url: &str,
    ) -> Result<(Vec<Repository>, Option<String>), ScanError> {
        let response = self
            .http
            .get(url)
            .header(USER_AGENT, "cartograph")
            .header(ACCEPT, "application/vnd.github+json")
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let rate_limited = response
                .headers()
                .get("x-ratelimit-remaining")
                .is_some_and(|v| v.as_bytes() == b"0");
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, rate_limited, body));
        }

        let next = next_page_url(response.headers());
        let repos = response.json::<Vec<Repository>>().await.map_err(|err| {
            ScanError::Decode(format!("repository page: {err}"))
        })?;
        Ok((repos, next))
    }
}

fn classify_status(
    status: StatusCode,
    rate_limited: bool,
    body: String,
) -> ScanError {
    let message = format!("GitHub responded {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && rate_limited)
    {
        ScanError::Throttled(message)
    } else if status.is_server_error() {
        ScanError::Provider(message)
    } else {
        ScanError::Rejected(message)
    }
}

/// Target of the `rel="next"` entry of a `Link` header.
fn next_page_url(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let mut segments = part.split(';');
        let target = segments.next()?.trim();
        let is_next = segments.any(|s| s.trim() == "rel=\"next\"");
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

#[async_trait]
impl GitHubClient for HttpGitHubClient {
    async fn list_repositories(
        &self,
        user_or_org: &str,
    ) -> Result<Vec<Repository>, ScanError> {
        let mut next = Some(format!(
            "{}/users/{}/repos?per_page={PER_PAGE}&page=1",
            self.base_url,
            urlencoding::encode(user_or_org)
        ));
        let mut repos = Vec::new();

        while let Some(url) = next.take() {
            let (page, following) =
                retry_with_backoff(self.retry, "github.list_repositories", || {
                    self.fetch_page(&url)
                })
                .await?;
            debug!(url = %url, count = page.len(), "repository page fetched");
            repos.extend(page);
            next = following;
        }
        Ok(repos)
    }
}

/// Emits one resource per repository owned by the configured user or
/// organization.
#[derive(Clone)]
pub struct GitHubRepositoryScanner {
    name: String,
    user_or_org: String,
    fields: Vec<String>,
    schedule: Option<String>,
    client: Arc<dyn GitHubClient>,
}

impl fmt::Debug for GitHubRepositoryScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubRepositoryScanner")
            .field("name", &self.name)
            .field("user_or_org", &self.user_or_org)
            .field("fields", &self.fields)
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

impl GitHubRepositoryScanner {
    pub fn new(
        name: impl Into<String>,
        user_or_org: impl Into<String>,
        fields: Vec<String>,
        client: Arc<dyn GitHubClient>,
    ) -> Self {
        Self {
            name: name.into(),
            user_or_org: user_or_org.into(),
            fields,
            schedule: None,
            client,
        }
    }

    pub fn from_source(source: &SourceConfig) -> Result<Self, ScanError> {
        let require = |key: &str| {
            source.get(key).ok_or_else(|| {
                ScanError::Config(format!(
                    "source '{}' requires {key}",
                    source.name
                ))
            })
        };
        let client = HttpGitHubClient::new(require("token")?);
        let mut scanner = Self::new(
            source.name.clone(),
            require("user_or_org")?,
            source.fields.clone(),
            Arc::new(client),
        );
        scanner.schedule = source.schedule.clone();
        Ok(scanner)
    }

    fn to_resource(&self, repo: &Repository, version: i32) -> Resource {
        let mut resource = Resource::new(
            ResourceKind::GitHubRepository.as_str(),
            Uuid::new_v4(),
            repo.full_name.clone(),
            repo.full_name.clone(),
            self.name.clone(),
            version,
        );

        let owner = repo.owner.clone().unwrap_or_default();
        let meta = FieldMapper::new(&self.fields)
            .field(FIELD_COMPANY, || owner.company.clone().unwrap_or_default())
            .field(FIELD_LANGUAGE, || repo.language.clone().unwrap_or_default())
            .field(FIELD_HOMEPAGE, || repo.homepage.clone().unwrap_or_default())
            .field(FIELD_ORGANIZATION, || {
                repo.organization
                    .as_ref()
                    .map(|org| org.name.clone().unwrap_or_else(|| org.login.clone()))
                    .unwrap_or_default()
            })
            .field(FIELD_STARS, || repo.stargazers_count.to_string())
            .field(FIELD_GIT_URL, || repo.git_url.clone().unwrap_or_default())
            .field(FIELD_OWNER_NAME, || owner.name.clone().unwrap_or_default())
            .field(FIELD_OWNER_LOGIN, || owner.login.clone())
            .field(FIELD_TOPICS, || {
                serde_json::to_string(&repo.topics).unwrap_or_default()
            })
            .meta_data();
        resource.extend_meta_data(&meta);
        resource
    }
}

#[async_trait]
impl Scanner for GitHubRepositoryScanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        ResourceKind::GitHubRepository.as_str()
    }

    fn schedule(&self) -> Option<&str> {
        self.schedule.as_deref()
    }

    async fn scan(
        &self,
        output: &ResourceSink,
        version: i32,
    ) -> Result<(), ScanError> {
        let repos = self.client.list_repositories(&self.user_or_org).await?;
        for repo in &repos {
            output.emit(self.to_resource(repo, version)).await?;
        }
        info!(
            scanner.name = %self.name,
            scanner.kind = self.kind(),
            total_resource_discovered = repos.len(),
            "scan completed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn repo(full_name: &str) -> Repository {
        Repository {
            full_name: full_name.to_string(),
            language: Some("Rust".into()),
            stargazers_count: 42,
            topics: vec!["cmdb".into(), "inventory".into()],
            owner: Some(RepositoryOwner {
                login: "acme".into(),
                name: None,
                company: Some("Acme Inc".into()),
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn emits_one_resource_per_repository() {
        let mut client = MockGitHubClient::new();
        client
            .expect_list_repositories()
            .times(1)
            .returning(|_| Ok(vec![repo("acme/api"), repo("acme/web")]));

        let scanner = GitHubRepositoryScanner::new(
            "gh",
            "acme",
            vec![
                FIELD_STARS.to_string(),
                FIELD_TOPICS.to_string(),
                FIELD_COMPANY.to_string(),
                FIELD_OWNER_LOGIN.to_string(),
                FIELD_OWNER_NAME.to_string(),
            ],
            Arc::new(client),
        );

        let (sink, mut rx) = ResourceSink::channel(8);
        scanner.scan(&sink, 4).await.unwrap();
        drop(sink);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, "GitHubRepository");
        assert_eq!(first.name, "acme/api");
        assert_eq!(first.external_id, "acme/api");
        assert_eq!(first.version, 4);
        assert_eq!(first.find_meta_value(FIELD_STARS), Some("42"));
        assert_eq!(
            first.find_meta_value(FIELD_TOPICS),
            Some(r#"["cmdb","inventory"]"#)
        );
        assert_eq!(first.find_meta_value(FIELD_COMPANY), Some("Acme Inc"));
        assert_eq!(first.find_meta_value(FIELD_OWNER_LOGIN), Some("acme"));
        assert_eq!(first.find_meta_value(FIELD_OWNER_NAME), None);
        assert_eq!(first.find_meta_value(FIELD_LANGUAGE), None);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.external_id, "acme/web");
        assert_ne!(first.uuid, second.uuid);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn client_failure_is_reported() {
        let mut client = MockGitHubClient::new();
        client
            .expect_list_repositories()
            .returning(|_| Err(ScanError::Rejected("401".into())));

        let scanner =
            GitHubRepositoryScanner::new("gh", "acme", Vec::new(), Arc::new(client));
        let (sink, _rx) = ResourceSink::channel(1);
        assert!(matches!(
            scanner.scan(&sink, 1).await,
            Err(ScanError::Rejected(_))
        ));
    }

    #[test]
    fn link_header_next_page() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                "<https://api.github.com/user/1/repos?page=2>; rel=\"next\", \
                 <https://api.github.com/user/1/repos?page=5>; rel=\"last\"",
            ),
        );
        assert_eq!(
            next_page_url(&headers).as_deref(),
            Some("https://api.github.com/user/1/repos?page=2")
        );

        headers.insert(
            LINK,
            HeaderValue::from_static(
                "<https://api.github.com/user/1/repos?page=1>; rel=\"prev\"",
            ),
        );
        assert_eq!(next_page_url(&headers), None);
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, false, String::new()),
            ScanError::Throttled(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, true, String::new()),
            ScanError::Throttled(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, false, String::new()),
            ScanError::Rejected(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, false, String::new()),
            ScanError::Provider(_)
        ));
    }
}
