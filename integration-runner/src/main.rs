use anyhow::{Context, Result};
use integration_runner::runtime::{connect, Runtime};
use integration_runner::RunnerConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "integration_runner=info,catalog_sync=info".into()),
        )
        .init();

    info!("Integration runner starting...");

    // Config file is optional; SYNC_* and GITHUB_* variables override it
    let config_path = std::env::var("SYNC_CONFIG").ok();
    let config = RunnerConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    info!(
        integration = %config.sync.integration.identifier,
        integration_type = %config.sync.integration.integration_type,
        datasource = %config.sync.integration.datasource(),
        catalog_url = %config.sync.catalog.base_url,
        resync_interval_minutes = config.sync.integration.resync_interval_minutes,
        "Configuration loaded"
    );

    let (integration, catalog) = connect(&config)?;
    let runtime = Runtime::build(config, integration, catalog)?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        shutdown.cancel();
    });

    runtime.run(cancel).await?;
    info!("Integration runner stopped");

    Ok(())
}
