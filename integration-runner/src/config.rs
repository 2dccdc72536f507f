use anyhow::{Context, Result};
use catalog_sync::config::{apply_env_overrides, SyncConfig};
use serde::Deserialize;

pub const GITHUB_API_URL: &str = "https://api.github.com";

/// Runner configuration: the engine sections plus connector settings.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RunnerConfig {
    #[serde(flatten)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub github: GitHubConfig,
}

/// GitHub connector settings.
///
/// Secrets are usually supplied through `GITHUB_TOKEN` and
/// `GITHUB_WEBHOOK_SECRET` rather than the file.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_github_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Organization whose repositories are synced; the token's own
    /// repositories when unset
    #[serde(default)]
    pub organization: Option<String>,
    /// Page size for list endpoints (GitHub caps it at 100)
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    /// Shared secret for `X-Hub-Signature-256`; deliveries are not verified
    /// when unset
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

fn default_github_url() -> String {
    GITHUB_API_URL.to_string()
}

fn default_per_page() -> u32 {
    100
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            base_url: default_github_url(),
            token: None,
            organization: None,
            per_page: default_per_page(),
            webhook_secret: None,
        }
    }
}

impl RunnerConfig {
    /// Load from a TOML file, or defaults when `path` is `None`, then apply
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file '{}'", path))?;
                toml::from_str::<RunnerConfig>(&contents)
                    .with_context(|| format!("Failed to parse '{}'", path))?
            }
            None => RunnerConfig::default(),
        };
        apply_env_overrides(&mut config.sync);
        config.apply_github_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_github_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("GITHUB_TOKEN") {
            self.github.token = Some(v);
        }
        if let Some(v) = lookup("GITHUB_WEBHOOK_SECRET") {
            self.github.webhook_secret = Some(v);
        }
        if let Some(v) = lookup("GITHUB_ORGANIZATION") {
            self.github.organization = Some(v);
        }
        if let Some(v) = lookup("GITHUB_API_URL") {
            self.github.base_url = v;
        }
    }
}
