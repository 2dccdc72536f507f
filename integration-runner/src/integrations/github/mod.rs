pub mod api;
pub mod producer;
pub mod webhook;

use crate::config::GitHubConfig;
use crate::Integration;
use catalog_sync::http::ApiClient;
use catalog_sync::mapping::MappingConfig;
use catalog_sync::resync::RawDataProducer;
use catalog_sync::webhook::WebhookProcessor;
use std::sync::Arc;
use tracing::warn;

use self::api::GitHubClient;
use self::producer::GitHubProducer;
use self::webhook::{
    GitHubWebhook, IssueWebhookProcessor, PullRequestWebhookProcessor, RepositoryWebhookProcessor,
};

/// Mapping installed when the catalog has none for this integration.
const DEFAULT_MAPPING: &str = r#"{
  "createMissingRelatedEntities": true,
  "deleteDependentEntities": true,
  "resources": [
    {
      "kind": "repository",
      "selector": {"query": "true"},
      "port": {"entity": {"mappings": {
        "identifier": ".name",
        "title": ".name",
        "blueprint": "\"githubRepository\"",
        "properties": {
          "url": ".html_url",
          "description": ".description",
          "language": ".language",
          "defaultBranch": ".default_branch",
          "stars": ".stargazers_count",
          "archived": ".archived"
        }
      }}}
    },
    {
      "kind": "issue",
      "selector": {"query": "true", "state": "open"},
      "port": {"entity": {"mappings": {
        "identifier": "(.__repository | split(\"/\") | last) + \"-\" + (.number | tostring)",
        "title": ".title",
        "blueprint": "\"githubIssue\"",
        "properties": {
          "state": ".state",
          "creator": ".user.login",
          "labels": "[.labels[].name]",
          "link": ".html_url",
          "createdAt": ".created_at"
        },
        "relations": {
          "repository": ".__repository | split(\"/\") | last"
        }
      }}}
    },
    {
      "kind": "pull-request",
      "selector": {"query": "true", "state": "open"},
      "port": {"entity": {"mappings": {
        "identifier": "(.__repository | split(\"/\") | last) + \"-\" + (.number | tostring)",
        "title": ".title",
        "blueprint": "\"githubPullRequest\"",
        "properties": {
          "status": ".state",
          "creator": ".user.login",
          "link": ".html_url",
          "draft": ".draft"
        },
        "relations": {
          "repository": ".__repository | split(\"/\") | last"
        }
      }}}
    }
  ]
}"#;

/// GitHub: repositories, issues and pull requests, by resync and webhooks.
pub struct GitHubIntegration {
    client: GitHubClient,
    config: GitHubConfig,
}

impl GitHubIntegration {
    pub fn new(api: ApiClient, config: &GitHubConfig) -> Self {
        let client = GitHubClient::new(api, config.base_url.clone(), config.token.clone())
            .with_per_page(config.per_page);
        if config.token.is_none() {
            warn!("No GitHub token configured, only public data will be visible");
        }
        Self {
            client,
            config: config.clone(),
        }
    }
}

impl Integration for GitHubIntegration {
    fn name(&self) -> &str {
        "github"
    }

    fn producer(&self) -> Arc<dyn RawDataProducer> {
        Arc::new(GitHubProducer::new(
            self.client.clone(),
            self.config.organization.clone(),
        ))
    }

    fn processors(&self) -> Vec<Arc<dyn WebhookProcessor>> {
        let github = GitHubWebhook::new(self.client.clone(), self.config.webhook_secret.clone());
        vec![
            Arc::new(RepositoryWebhookProcessor::new(github.clone())),
            Arc::new(IssueWebhookProcessor::new(github.clone())),
            Arc::new(PullRequestWebhookProcessor::new(github)),
        ]
    }

    fn default_mapping(&self) -> Option<MappingConfig> {
        match MappingConfig::from_json(DEFAULT_MAPPING) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(error = %e, "Built-in GitHub mapping is invalid");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_sync::config::RateLimitConfig;
    use catalog_sync::expr::EvalContext;
    use catalog_sync::mapping::{CompiledMapping, EntityMapper};
    use catalog_sync::rate_limit::RateLimiter;
    use serde_json::json;
    use std::time::Duration;

    fn integration() -> GitHubIntegration {
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default()));
        let api = ApiClient::new(limiter, Duration::from_secs(5)).unwrap();
        GitHubIntegration::new(api, &GitHubConfig::default())
    }

    #[test]
    fn test_integration_metadata() {
        let github = integration();
        assert_eq!(github.name(), "github");
        let names: Vec<String> = github
            .processors()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["github-repository", "github-issue", "github-pull-request"]
        );
    }

    #[test]
    fn test_default_mapping_compiles() {
        let config = integration().default_mapping().unwrap();
        let mapping = CompiledMapping::compile(&config).unwrap();
        assert_eq!(mapping.kinds(), vec!["repository", "issue", "pull-request"]);
        assert!(mapping.delete_dependent_entities);
    }

    #[test]
    fn test_default_mapping_maps_issue() {
        let config = integration().default_mapping().unwrap();
        let mapping = CompiledMapping::compile(&config).unwrap();
        let mapper = EntityMapper::new("github/test", EvalContext::default());
        let issue = producer::tag_repository(json!({
            "number": 12,
            "title": "Crash on start",
            "state": "open",
            "user": {"login": "octocat"},
            "labels": [{"name": "bug"}],
            "html_url": "https://github.com/acme/api/issues/12",
            "created_at": "2024-01-01T00:00:00Z",
            "repository_url": "https://api.github.com/repos/acme/api"
        }));

        let entities = mapper
            .map_record(&mapping.resources_for("issue")[0], &issue)
            .unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].identifier, "api-12");
        assert_eq!(entities[0].blueprint, "githubIssue");
        assert_eq!(entities[0].properties["labels"], json!(["bug"]));
    }
}
