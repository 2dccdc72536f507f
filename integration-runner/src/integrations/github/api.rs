use catalog_sync::error::SyncError;
use catalog_sync::http::{ApiClient, RequestError};
use reqwest::header::{HeaderMap, LINK};
use serde_json::Value;
use tracing::debug;

/// One page of a list endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    /// Absolute URL of the following page, from `Link: <...>; rel="next"`
    pub next: Option<String>,
}

/// HTTP client for the GitHub REST API.
///
/// Requests go through the shared [`ApiClient`], so they wait on the
/// integration's rate limiter and feed `X-RateLimit-*` headers back into it.
/// Records are kept as raw JSON; the mapping decides which fields matter.
#[derive(Clone)]
pub struct GitHubClient {
    api: ApiClient,
    base_url: String,
    token: Option<String>,
    per_page: u32,
}

impl GitHubClient {
    pub fn new(api: ApiClient, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            api,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            per_page: 100,
        }
    }

    pub fn with_per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page.clamp(1, 100);
        self
    }

    /// First page of the repositories to sync.
    pub fn repositories_url(&self, organization: Option<&str>) -> String {
        match organization {
            Some(org) => format!(
                "{}/orgs/{}/repos?per_page={}",
                self.base_url,
                urlencoding::encode(org),
                self.per_page
            ),
            None => format!(
                "{}/user/repos?sort=updated&per_page={}",
                self.base_url, self.per_page
            ),
        }
    }

    /// First page of a repository's issues (`state` is open, closed or all).
    pub fn issues_url(&self, full_name: &str, state: &str) -> String {
        format!(
            "{}/repos/{}/issues?state={}&per_page={}",
            self.base_url,
            full_name,
            urlencoding::encode(state),
            self.per_page
        )
    }

    pub fn pulls_url(&self, full_name: &str, state: &str) -> String {
        format!(
            "{}/repos/{}/pulls?state={}&per_page={}",
            self.base_url,
            full_name,
            urlencoding::encode(state),
            self.per_page
        )
    }

    /// Fetch one page of a list endpoint.
    pub async fn page(&self, url: &str) -> Result<Page, SyncError> {
        let response = self.api.send(self.get(url)).await?;
        let next = next_link(response.headers());
        let items = response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| RequestError::Decode(e.to_string()))?;
        debug!(url = %url, count = items.len(), has_next = next.is_some(), "Fetched page");
        Ok(Page { items, next })
    }

    /// Fetch a single resource. `None` when GitHub answers 404 (deleted or
    /// no longer visible to the token).
    pub async fn resource(&self, path: &str) -> Result<Option<Value>, SyncError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        match self.api.send_json::<Value>(self.get(&url)).await {
            Ok(value) => Ok(Some(value)),
            Err(RequestError::Status { status: 404, .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn repository(&self, full_name: &str) -> Result<Option<Value>, SyncError> {
        self.resource(&format!("repos/{}", full_name)).await
    }

    pub async fn issue(&self, full_name: &str, number: u64) -> Result<Option<Value>, SyncError> {
        self.resource(&format!("repos/{}/issues/{}", full_name, number))
            .await
    }

    pub async fn pull_request(
        &self,
        full_name: &str,
        number: u64,
    ) -> Result<Option<Value>, SyncError> {
        self.resource(&format!("repos/{}/pulls/{}", full_name, number))
            .await
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self
            .api
            .http()
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Extract the `rel="next"` target from a `Link` header.
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|p| {
            let p = p.trim();
            p == "rel=\"next\"" || p == "rel=next"
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}
