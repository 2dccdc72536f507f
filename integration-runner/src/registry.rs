//! Integration registry - maps the configured integration type to its
//! implementation.

use crate::config::RunnerConfig;
use crate::integrations::github::GitHubIntegration;
use crate::Integration;
use anyhow::{bail, Result};
use catalog_sync::http::ApiClient;
use std::sync::Arc;

/// Integration types this runner can host.
pub fn available_integrations() -> Vec<&'static str> {
    vec!["github"]
}

/// Build the integration named by `integration.integration_type`.
///
/// `api` is the rate-limited client for the third-party API.
pub fn build_integration(config: &RunnerConfig, api: ApiClient) -> Result<Arc<dyn Integration>> {
    match config.sync.integration.integration_type.as_str() {
        "github" => Ok(Arc::new(GitHubIntegration::new(api, &config.github))),
        other => bail!(
            "Unknown integration type '{}' (available: {})",
            other,
            available_integrations().join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_sync::config::RateLimitConfig;
    use catalog_sync::rate_limit::RateLimiter;
    use std::time::Duration;

    fn api() -> ApiClient {
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default()));
        ApiClient::new(limiter, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_github_integration() {
        let integration = build_integration(&RunnerConfig::default(), api()).unwrap();
        assert_eq!(integration.name(), "github");
        assert!(integration.default_mapping().is_some());
    }

    #[test]
    fn test_unknown_integration() {
        let mut config = RunnerConfig::default();
        config.sync.integration.integration_type = "jira".to_string();

        let err = build_integration(&config, api()).err().unwrap();
        assert!(err.to_string().contains("Unknown integration type 'jira'"));
    }
}
