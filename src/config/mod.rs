pub mod runtime;
pub use runtime::apply_env_overrides;

use crate::retry::RetryPolicy;
use serde::Deserialize;
use std::time::Duration;

/// Complete engine configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub integration: IntegrationConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Integration instance identity
#[derive(Debug, Clone, Deserialize)]
pub struct IntegrationConfig {
    /// Unique id of this integration instance in the catalog
    #[serde(default = "default_identifier")]
    pub identifier: String,
    /// Connector type (e.g. "github")
    #[serde(default = "default_integration_type")]
    pub integration_type: String,
    /// Ownership tag written on every entity this instance manages
    #[serde(default)]
    pub datasource: Option<String>,
    /// Minutes between scheduled resyncs (0 disables the schedule)
    #[serde(default = "default_resync_interval")]
    pub resync_interval_minutes: u64,
    /// Run one resync as soon as the process starts
    #[serde(default = "default_resync_on_start")]
    pub resync_on_start: bool,
    /// Mapping file used when the catalog has no mapping for this instance
    #[serde(default)]
    pub mapping_path: Option<String>,
}

fn default_identifier() -> String {
    "my-integration".to_string()
}

fn default_integration_type() -> String {
    "github".to_string()
}

fn default_resync_interval() -> u64 {
    60
}

fn default_resync_on_start() -> bool {
    true
}

impl IntegrationConfig {
    /// Datasource tag, falling back to `{type}/{identifier}`.
    pub fn datasource(&self) -> String {
        self.datasource
            .clone()
            .unwrap_or_else(|| format!("{}/{}", self.integration_type, self.identifier))
    }
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            identifier: default_identifier(),
            integration_type: default_integration_type(),
            datasource: None,
            resync_interval_minutes: default_resync_interval(),
            resync_on_start: default_resync_on_start(),
            mapping_path: None,
        }
    }
}

/// External catalog API
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_url")]
    pub base_url: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Timeout applied to every outbound call (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_catalog_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl CatalogConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: default_catalog_url(),
            client_id: None,
            client_secret: None,
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

/// Outbound request limits, one limiter per API target
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests in flight at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Sustained request rate (token bucket refill)
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    /// Fraction of the server quota kept in reserve before pausing (0..1)
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
}

fn default_max_concurrent() -> usize {
    10
}

fn default_requests_per_second() -> f64 {
    20.0
}

fn default_safety_margin() -> f64 {
    0.05
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            requests_per_second: default_requests_per_second(),
            safety_margin: default_safety_margin(),
        }
    }
}

/// Reconciliation batching and retry
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of owned entities a single pass may delete; a mapping's
    /// `entityDeletionThreshold` takes precedence.
    #[serde(default)]
    pub entity_deletion_threshold: Option<f64>,
}

fn default_batch_size() -> usize {
    20
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            entity_deletion_threshold: None,
        }
    }
}

impl ReconcileConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Live event queue and worker pool
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_workers() -> usize {
    5
}

fn default_queue_capacity() -> usize {
    1000
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl EventsConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// HTTP surface
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum accepted webhook body
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_port() -> u16 {
    8000
}

fn default_body_limit() -> usize {
    1_048_576 // 1 MB
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> anyhow::Result<SyncConfig> {
    use anyhow::Context;
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path))?;
    let config: SyncConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse '{}'", path))?;
    Ok(config)
}
