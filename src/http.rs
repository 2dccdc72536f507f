//! Outbound HTTP execution through a shared rate limiter.
//!
//! Every call gets a bounded timeout, waits for a limiter slot, feeds quota
//! headers back into the limiter and classifies failures as transient
//! (network, timeout, 5xx, 429) or terminal (other 4xx).

use crate::rate_limit::{RateLimitError, RateLimiter, ServerRateLimit};
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Outbound request failure
#[derive(Debug, Clone, PartialEq)]
pub enum RequestError {
    /// Connection refused, reset, DNS failure
    Network(String),
    /// The bounded per-call timeout elapsed
    Timeout,
    /// Non-success status other than rate limiting
    Status { status: u16, body: String },
    /// 429, or a 403 with an exhausted quota
    RateLimited { retry_after: Option<Duration> },
    /// Response body could not be decoded
    Decode(String),
    /// Limiter shut down
    Limiter(RateLimitError),
}

impl RequestError {
    pub fn is_transient(&self) -> bool {
        match self {
            RequestError::Network(_) | RequestError::Timeout | RequestError::RateLimited { .. } => {
                true
            }
            RequestError::Status { status, .. } => *status >= 500,
            RequestError::Decode(_) | RequestError::Limiter(_) => false,
        }
    }

    /// HTTP status, when the server answered
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Status { status, .. } => Some(*status),
            RequestError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::Network(msg) => write!(f, "network error: {}", msg),
            RequestError::Timeout => write!(f, "request timed out"),
            RequestError::Status { status, body } => write!(f, "status {}: {}", status, body),
            RequestError::RateLimited { .. } => write!(f, "rate limit exceeded"),
            RequestError::Decode(msg) => write!(f, "invalid response body: {}", msg),
            RequestError::Limiter(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<reqwest::Error> for RequestError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RequestError::Timeout
        } else if e.is_decode() {
            RequestError::Decode(e.to_string())
        } else {
            RequestError::Network(e.to_string())
        }
    }
}

/// Pooled HTTP client bound to one rate limiter.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    limiter: Arc<RateLimiter>,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(limiter: Arc<RateLimiter>, timeout: Duration) -> Result<Self, RequestError> {
        let http = Client::builder()
            .user_agent("catalog-sync/0.1")
            .build()
            .map_err(|e| RequestError::Network(e.to_string()))?;
        Ok(Self {
            http,
            limiter,
            timeout,
        })
    }

    /// Underlying client, for building requests
    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Send a request and return the successful response.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, RequestError> {
        let _guard = self
            .limiter
            .acquire()
            .await
            .map_err(RequestError::Limiter)?;

        let response = request.timeout(self.timeout).send().await?;

        let quota = server_rate_limit(response.headers(), chrono::Utc::now().timestamp());
        self.limiter.observe(&quota);

        check_status(response, &quota).await
    }

    /// Send a request and decode a JSON body.
    pub async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, RequestError> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RequestError::Decode(e.to_string()))
    }
}

async fn check_status(response: Response, quota: &ServerRateLimit) -> Result<Response, RequestError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let quota_exhausted = quota.remaining == Some(0);
    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN && quota_exhausted)
    {
        let retry_after = quota.retry_after.or(quota.reset_after);
        warn!(
            status = status.as_u16(),
            retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
            "Upstream rate limit hit"
        );
        return Err(RequestError::RateLimited { retry_after });
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string());
    Err(RequestError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Parse quota headers (`X-RateLimit-*`, `RateLimit-*`, `Retry-After`).
///
/// `reset` values larger than a day are treated as epoch seconds and
/// converted relative to `now_epoch`.
pub fn server_rate_limit(headers: &HeaderMap, now_epoch: i64) -> ServerRateLimit {
    let number = |names: &[&str]| -> Option<u64> {
        names.iter().find_map(|name| {
            headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| *v >= 0.0)
                .map(|v| v as u64)
        })
    };

    let reset_after = number(&["x-ratelimit-reset", "ratelimit-reset"]).map(|reset| {
        if reset > 86_400 {
            Duration::from_secs((reset as i64 - now_epoch).max(0) as u64)
        } else {
            Duration::from_secs(reset)
        }
    });

    ServerRateLimit {
        limit: number(&["x-ratelimit-limit", "ratelimit-limit"]),
        remaining: number(&["x-ratelimit-remaining", "ratelimit-remaining"]),
        reset_after,
        retry_after: number(&["retry-after"]).map(Duration::from_secs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use mockito::Server;
    use reqwest::header::HeaderValue;

    fn client() -> ApiClient {
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default()));
        ApiClient::new(limiter, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_parse_quota_headers_epoch_reset() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-limit", HeaderValue::from_static("5000"));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("12"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1700000060"));

        let quota = server_rate_limit(&headers, 1_700_000_000);
        assert_eq!(quota.limit, Some(5000));
        assert_eq!(quota.remaining, Some(12));
        assert_eq!(quota.reset_after, Some(Duration::from_secs(60)));
        assert_eq!(quota.retry_after, None);
    }

    #[test]
    fn test_parse_quota_headers_relative_reset() {
        let mut headers = HeaderMap::new();
        headers.insert("ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("ratelimit-reset", HeaderValue::from_static("30"));
        headers.insert("retry-after", HeaderValue::from_static("7"));

        let quota = server_rate_limit(&headers, 1_700_000_000);
        assert_eq!(quota.remaining, Some(0));
        assert_eq!(quota.reset_after, Some(Duration::from_secs(30)));
        assert_eq!(quota.retry_after, Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_transience() {
        assert!(RequestError::Timeout.is_transient());
        assert!(RequestError::Network("reset".into()).is_transient());
        assert!(RequestError::Status {
            status: 502,
            body: String::new()
        }
        .is_transient());
        assert!(!RequestError::Status {
            status: 422,
            body: String::new()
        }
        .is_transient());
    }

    #[tokio::test]
    async fn test_send_success() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/ok")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"value": 1}"#)
            .create_async()
            .await;

        let api = client();
        let body: serde_json::Value = api
            .send_json(api.http().get(format!("{}/ok", server.url())))
            .await
            .unwrap();
        assert_eq!(body["value"], 1);
    }

    #[tokio::test]
    async fn test_send_classifies_429() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/limited")
            .with_status(429)
            .with_header("retry-after", "0")
            .create_async()
            .await;

        let api = client();
        let err = api
            .send(api.http().get(format!("{}/limited", server.url())))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RequestError::RateLimited {
                retry_after: Some(Duration::ZERO)
            }
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_send_classifies_404_as_terminal() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .with_body("not found")
            .create_async()
            .await;

        let api = client();
        let err = api
            .send(api.http().get(format!("{}/missing", server.url())))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_send_network_error_is_transient() {
        let api = client();
        let err = api
            .send(api.http().get("http://127.0.0.1:9"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
