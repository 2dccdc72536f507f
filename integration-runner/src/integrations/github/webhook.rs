use super::api::GitHubClient;
use super::producer::{tag_repository, KIND_ISSUE, KIND_PULL_REQUEST, KIND_REPOSITORY};
use async_trait::async_trait;
use catalog_sync::error::SyncError;
use catalog_sync::event::{require_field, require_str, LiveEvent};
use catalog_sync::webhook::{RawUpdate, WebhookProcessor};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_HEADER: &str = "x-github-event";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// `sha256=<hex>` signature of `body`, as GitHub sends it.
pub fn sign(secret: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Check `X-Hub-Signature-256` against the raw body in constant time.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> Result<(), SyncError> {
    let header =
        header.ok_or_else(|| SyncError::Auth("missing X-Hub-Signature-256 header".to_string()))?;
    let digest = header
        .strip_prefix("sha256=")
        .ok_or_else(|| SyncError::Auth("unsupported signature format".to_string()))?;
    let expected =
        hex::decode(digest).map_err(|_| SyncError::Auth("signature is not hex".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SyncError::Auth(e.to_string()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| SyncError::Auth("signature mismatch".to_string()))
}

/// Parts every GitHub processor shares: the API client and delivery secret.
#[derive(Clone)]
pub struct GitHubWebhook {
    client: GitHubClient,
    secret: Option<String>,
}

impl GitHubWebhook {
    pub fn new(client: GitHubClient, secret: Option<String>) -> Self {
        Self { client, secret }
    }

    fn authenticate(&self, event: &LiveEvent) -> Result<(), SyncError> {
        match &self.secret {
            Some(secret) => verify_signature(secret, &event.body, event.header(SIGNATURE_HEADER)),
            None => Ok(()),
        }
    }
}

fn event_type(event: &LiveEvent) -> Option<&str> {
    event.header(EVENT_HEADER)
}

fn action(event: &LiveEvent) -> Option<&str> {
    event.payload.get("action").and_then(Value::as_str)
}

fn validation(e: impl std::fmt::Display) -> SyncError {
    SyncError::Validation(e.to_string())
}

fn number(payload: &Value, path: &str) -> Result<u64, SyncError> {
    require_field(payload, path)
        .map_err(validation)?
        .as_u64()
        .ok_or_else(|| SyncError::Validation(format!("{} must be a number", path)))
}

/// `push` and `repository` events → the repository kind.
pub struct RepositoryWebhookProcessor {
    github: GitHubWebhook,
}

impl RepositoryWebhookProcessor {
    pub fn new(github: GitHubWebhook) -> Self {
        Self { github }
    }
}

#[async_trait]
impl WebhookProcessor for RepositoryWebhookProcessor {
    fn name(&self) -> &str {
        "github-repository"
    }

    fn should_process(&self, event: &LiveEvent) -> bool {
        matches!(event_type(event), Some("push") | Some("repository"))
    }

    fn matching_kinds(&self, _event: &LiveEvent) -> Vec<String> {
        vec![KIND_REPOSITORY.to_string()]
    }

    async fn authenticate(&self, event: &LiveEvent) -> Result<(), SyncError> {
        self.github.authenticate(event)
    }

    async fn validate(&self, event: &LiveEvent) -> Result<(), SyncError> {
        require_str(&event.payload, "repository.full_name")
            .map(|_| ())
            .map_err(validation)
    }

    async fn fetch(&self, event: &LiveEvent, _kind: &str) -> Result<RawUpdate, SyncError> {
        let sent = require_field(&event.payload, "repository").map_err(validation)?;
        if event_type(event) == Some("repository") && action(event) == Some("deleted") {
            return Ok(RawUpdate::deleted(vec![sent.clone()]));
        }

        let full_name = require_str(&event.payload, "repository.full_name").map_err(validation)?;
        match self.github.client.repository(full_name).await? {
            Some(repository) => Ok(RawUpdate::updated(vec![repository])),
            None => {
                debug!(repository = %full_name, "Repository no longer visible, deleting");
                Ok(RawUpdate::deleted(vec![sent.clone()]))
            }
        }
    }
}

/// `issues` events → the issue kind.
pub struct IssueWebhookProcessor {
    github: GitHubWebhook,
}

impl IssueWebhookProcessor {
    pub fn new(github: GitHubWebhook) -> Self {
        Self { github }
    }
}

#[async_trait]
impl WebhookProcessor for IssueWebhookProcessor {
    fn name(&self) -> &str {
        "github-issue"
    }

    fn should_process(&self, event: &LiveEvent) -> bool {
        event_type(event) == Some("issues")
    }

    fn matching_kinds(&self, _event: &LiveEvent) -> Vec<String> {
        vec![KIND_ISSUE.to_string()]
    }

    async fn authenticate(&self, event: &LiveEvent) -> Result<(), SyncError> {
        self.github.authenticate(event)
    }

    async fn validate(&self, event: &LiveEvent) -> Result<(), SyncError> {
        require_str(&event.payload, "repository.full_name").map_err(validation)?;
        number(&event.payload, "issue.number").map(|_| ())
    }

    async fn fetch(&self, event: &LiveEvent, _kind: &str) -> Result<RawUpdate, SyncError> {
        let sent = tag_repository(
            require_field(&event.payload, "issue")
                .map_err(validation)?
                .clone(),
        );
        if action(event) == Some("deleted") {
            return Ok(RawUpdate::deleted(vec![sent]));
        }

        let full_name = require_str(&event.payload, "repository.full_name").map_err(validation)?;
        let issue_number = number(&event.payload, "issue.number")?;
        match self.github.client.issue(full_name, issue_number).await? {
            Some(issue) => Ok(RawUpdate::updated(vec![tag_repository(issue)])),
            None => Ok(RawUpdate::deleted(vec![sent])),
        }
    }
}

/// `pull_request` events → the pull-request kind.
pub struct PullRequestWebhookProcessor {
    github: GitHubWebhook,
}

impl PullRequestWebhookProcessor {
    pub fn new(github: GitHubWebhook) -> Self {
        Self { github }
    }
}

#[async_trait]
impl WebhookProcessor for PullRequestWebhookProcessor {
    fn name(&self) -> &str {
        "github-pull-request"
    }

    fn should_process(&self, event: &LiveEvent) -> bool {
        event_type(event) == Some("pull_request")
    }

    fn matching_kinds(&self, _event: &LiveEvent) -> Vec<String> {
        vec![KIND_PULL_REQUEST.to_string()]
    }

    async fn authenticate(&self, event: &LiveEvent) -> Result<(), SyncError> {
        self.github.authenticate(event)
    }

    async fn validate(&self, event: &LiveEvent) -> Result<(), SyncError> {
        require_str(&event.payload, "repository.full_name").map_err(validation)?;
        number(&event.payload, "pull_request.number").map(|_| ())
    }

    async fn fetch(&self, event: &LiveEvent, _kind: &str) -> Result<RawUpdate, SyncError> {
        let full_name = require_str(&event.payload, "repository.full_name").map_err(validation)?;
        let pr_number = number(&event.payload, "pull_request.number")?;
        match self.github.client.pull_request(full_name, pr_number).await? {
            Some(pr) => Ok(RawUpdate::updated(vec![tag_repository(pr)])),
            None => {
                let sent = require_field(&event.payload, "pull_request")
                    .map_err(validation)?
                    .clone();
                Ok(RawUpdate::deleted(vec![tag_repository(sent)]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::github::producer::REPOSITORY_FIELD;
    use catalog_sync::config::RateLimitConfig;
    use catalog_sync::http::ApiClient;
    use catalog_sync::rate_limit::RateLimiter;
    use mockito::Server;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    const SECRET: &str = "It's a Secret to Everybody";

    fn github(url: &str, secret: Option<&str>) -> GitHubWebhook {
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default()));
        let api = ApiClient::new(limiter, Duration::from_secs(5)).unwrap();
        GitHubWebhook::new(
            GitHubClient::new(api, url, None),
            secret.map(str::to_string),
        )
    }

    fn delivery(event: &str, payload: Value, signature: Option<String>) -> LiveEvent {
        let body = payload.to_string().into_bytes();
        let mut headers = vec![("X-GitHub-Event".to_string(), event.to_string())];
        if let Some(signature) = signature {
            headers.push(("X-Hub-Signature-256".to_string(), signature));
        }
        LiveEvent::from_request("github", headers, body).unwrap()
    }

    fn signed(event: &str, payload: Value) -> LiveEvent {
        let signature = sign(SECRET, payload.to_string().as_bytes());
        delivery(event, payload, Some(signature))
    }

    #[test]
    fn test_signature_known_vector() {
        // Example delivery from GitHub's webhook documentation
        assert_eq!(
            sign(SECRET, b"Hello, World!"),
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17"
        );
        assert!(verify_signature(
            SECRET,
            b"Hello, World!",
            Some("sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17")
        )
        .is_ok());
    }

    #[test]
    fn test_signature_rejections() {
        let body = b"{}";
        assert!(matches!(
            verify_signature(SECRET, body, None),
            Err(SyncError::Auth(_))
        ));
        assert!(verify_signature(SECRET, body, Some("sha1=abc")).is_err());
        assert!(verify_signature(SECRET, body, Some("sha256=zz")).is_err());
        assert!(verify_signature(SECRET, body, Some(&sign("other", body))).is_err());
    }

    #[tokio::test]
    async fn test_authenticate_with_and_without_secret() {
        let payload = json!({"repository": {"full_name": "acme/api"}});
        let processor = RepositoryWebhookProcessor::new(github("http://127.0.0.1:9", Some(SECRET)));

        assert!(processor.authenticate(&signed("push", payload.clone())).await.is_ok());
        assert!(processor
            .authenticate(&delivery("push", payload.clone(), None))
            .await
            .is_err());

        let open = RepositoryWebhookProcessor::new(github("http://127.0.0.1:9", None));
        assert!(open.authenticate(&delivery("push", payload, None)).await.is_ok());
    }

    #[test]
    fn test_routing_by_event_header() {
        let gh = github("http://127.0.0.1:9", None);
        let repo = RepositoryWebhookProcessor::new(gh.clone());
        let issue = IssueWebhookProcessor::new(gh.clone());
        let pr = PullRequestWebhookProcessor::new(gh);
        let payload = json!({"repository": {"full_name": "acme/api"}});

        let push = delivery("push", payload.clone(), None);
        assert!(repo.should_process(&push));
        assert!(!issue.should_process(&push));

        let issues = delivery("issues", payload.clone(), None);
        assert!(issue.should_process(&issues));
        assert!(!pr.should_process(&issues));

        let star = delivery("star", payload, None);
        assert!(!repo.should_process(&star) && !issue.should_process(&star) && !pr.should_process(&star));
    }

    #[tokio::test]
    async fn test_issue_validation() {
        let processor = IssueWebhookProcessor::new(github("http://127.0.0.1:9", None));
        let missing = delivery("issues", json!({"repository": {"full_name": "acme/api"}}), None);
        assert!(matches!(
            processor.validate(&missing).await,
            Err(SyncError::Validation(_))
        ));

        let wrong_type = delivery(
            "issues",
            json!({"repository": {"full_name": "acme/api"}, "issue": {"number": "7"}}),
            None,
        );
        assert!(processor.validate(&wrong_type).await.is_err());
    }

    #[tokio::test]
    async fn test_repository_fetches_current_state() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/repos/acme/api")
            .with_status(200)
            .with_body(r#"{"full_name": "acme/api", "stargazers_count": 42}"#)
            .create_async()
            .await;

        let processor = RepositoryWebhookProcessor::new(github(&server.url(), None));
        let event = delivery(
            "push",
            json!({"repository": {"full_name": "acme/api", "stargazers_count": 1}}),
            None,
        );

        let update = processor.fetch(&event, KIND_REPOSITORY).await.unwrap();
        assert_eq!(update.updated.len(), 1);
        assert_eq!(update.updated[0]["stargazers_count"], 42);
        assert!(update.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_repository_needs_no_fetch() {
        let processor = RepositoryWebhookProcessor::new(github("http://127.0.0.1:9", None));
        let event = delivery(
            "repository",
            json!({"action": "deleted", "repository": {"full_name": "acme/old"}}),
            None,
        );

        let update = processor.fetch(&event, KIND_REPOSITORY).await.unwrap();
        assert!(update.updated.is_empty());
        assert_eq!(update.deleted[0]["full_name"], "acme/old");
    }

    #[tokio::test]
    async fn test_issue_gone_upstream_becomes_delete() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/repos/acme/api/issues/7")
            .with_status(404)
            .create_async()
            .await;

        let processor = IssueWebhookProcessor::new(github(&server.url(), None));
        let event = delivery(
            "issues",
            json!({
                "action": "edited",
                "repository": {"full_name": "acme/api"},
                "issue": {"number": 7, "repository_url": "https://api.github.com/repos/acme/api"}
            }),
            None,
        );

        let update = processor.fetch(&event, KIND_ISSUE).await.unwrap();
        assert!(update.updated.is_empty());
        assert_eq!(update.deleted[0]["number"], 7);
        assert_eq!(update.deleted[0][REPOSITORY_FIELD], "acme/api");
    }

    #[tokio::test]
    async fn test_pull_request_upstream_error_propagates() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/repos/acme/api/pulls/3")
            .with_status(503)
            .create_async()
            .await;

        let processor = PullRequestWebhookProcessor::new(github(&server.url(), None));
        let event = delivery(
            "pull_request",
            json!({"repository": {"full_name": "acme/api"}, "pull_request": {"number": 3}}),
            None,
        );

        let err = processor.fetch(&event, KIND_PULL_REQUEST).await.unwrap_err();
        assert!(err.is_transient());
    }
}
