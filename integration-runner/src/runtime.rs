//! Process wiring: clients, engine services, workers, scheduler and HTTP.

use crate::api::{self, ApiState};
use crate::config::RunnerConfig;
use crate::registry::build_integration;
use crate::scheduler::ResyncScheduler;
use crate::Integration;
use anyhow::{Context, Result};
use axum::Router;
use futures::future::join_all;
use catalog_sync::catalog::{CatalogClient, HttpCatalogClient};
use catalog_sync::expr::EvalContext;
use catalog_sync::http::ApiClient;
use catalog_sync::mapping::{CompiledMapping, EntityMapper, MappingStore};
use catalog_sync::rate_limit::RateLimiter;
use catalog_sync::resync::ResyncCoordinator;
use catalog_sync::status::{CatalogStatusSink, CompositeStatusSink, LogStatusSink, StatusSink};
use catalog_sync::webhook::{
    self, EventDispatcher, IngressState, LiveEventQueue, LoggingErrorHook, ProcessorRegistry,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Build the catalog client and the configured integration, each behind its
/// own rate limiter.
pub fn connect(config: &RunnerConfig) -> Result<(Arc<dyn Integration>, Arc<dyn CatalogClient>)> {
    let timeout = config.sync.catalog.request_timeout();

    let catalog_limiter = Arc::new(RateLimiter::new(&config.sync.rate_limit));
    let catalog_api =
        ApiClient::new(catalog_limiter, timeout).context("Failed to build catalog HTTP client")?;
    let catalog: Arc<dyn CatalogClient> =
        Arc::new(HttpCatalogClient::new(catalog_api, &config.sync.catalog));

    let upstream_limiter = Arc::new(RateLimiter::new(&config.sync.rate_limit));
    let upstream_api = ApiClient::new(upstream_limiter, timeout)
        .context("Failed to build integration HTTP client")?;
    let integration = build_integration(config, upstream_api)?;

    Ok((integration, catalog))
}

/// Engine services for one integration instance.
pub struct Runtime {
    config: RunnerConfig,
    integration: Arc<dyn Integration>,
    coordinator: Arc<ResyncCoordinator>,
    dispatcher: Arc<EventDispatcher>,
}

impl Runtime {
    /// Wire the resync coordinator and live event dispatcher.
    ///
    /// Fails when the fallback mapping (file or built-in) does not compile.
    pub fn build(
        config: RunnerConfig,
        integration: Arc<dyn Integration>,
        catalog: Arc<dyn CatalogClient>,
    ) -> Result<Self> {
        let identity = &config.sync.integration;
        let datasource = identity.datasource();

        let fallback = match &identity.mapping_path {
            Some(path) => Some(
                MappingStore::load_file(path)
                    .with_context(|| format!("Failed to load mapping file '{}'", path))?,
            ),
            None => integration.default_mapping(),
        };
        if let Some(fallback) = &fallback {
            CompiledMapping::compile(fallback).context("Invalid fallback mapping")?;
        }
        let mappings = Arc::new(MappingStore::new(identity.identifier.clone(), fallback));

        let ctx = EvalContext::from_process();
        let sink: Arc<dyn StatusSink> = Arc::new(CompositeStatusSink::new(vec![
            Arc::new(LogStatusSink),
            Arc::new(CatalogStatusSink::new(
                Arc::clone(&catalog),
                identity.identifier.clone(),
            )),
        ]));

        let coordinator = Arc::new(ResyncCoordinator::new(
            identity.identifier.clone(),
            datasource.clone(),
            Arc::clone(&catalog),
            Arc::clone(&mappings),
            integration.producer(),
            sink,
            config.sync.reconcile.clone(),
            ctx.clone(),
        ));

        let mut registry = ProcessorRegistry::new();
        for processor in integration.processors() {
            registry.register(integration.name(), processor);
        }
        let dispatcher = Arc::new(
            EventDispatcher::new(
                Arc::new(registry),
                catalog,
                mappings,
                EntityMapper::new(datasource, ctx),
                config.sync.events.retry_policy(),
            )
            .with_error_hook(Arc::new(LoggingErrorHook)),
        );

        Ok(Self {
            config,
            integration,
            coordinator,
            dispatcher,
        })
    }

    pub fn coordinator(&self) -> &Arc<ResyncCoordinator> {
        &self.coordinator
    }

    /// Start the live event workers and return the combined router
    /// (webhook ingress + management API) with the worker handles.
    pub fn start_http(&self, cancel: &CancellationToken) -> (Router, Vec<JoinHandle<()>>) {
        let events = &self.config.sync.events;
        let (queue, workers) = LiveEventQueue::start(
            Arc::clone(&self.dispatcher),
            events.workers,
            events.queue_capacity,
            cancel.clone(),
        );

        let ingress = webhook::create_router(
            IngressState {
                queue: queue.clone(),
            },
            self.config.sync.api.body_limit_bytes,
        );
        let management = api::create_router(ApiState {
            coordinator: Arc::clone(&self.coordinator),
            queue,
            cancel: cancel.clone(),
        });

        let router = ingress.merge(management).layer(TraceLayer::new_for_http());
        (router, workers)
    }

    /// Serve until `cancel` fires, then drain the workers, the scheduler
    /// and any running resync before returning.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let (router, workers) = self.start_http(&cancel);

        let identity = &self.config.sync.integration;
        let scheduler = ResyncScheduler::from_minutes(
            Arc::clone(&self.coordinator),
            identity.resync_interval_minutes,
            identity.resync_on_start,
        )
        .start(cancel.clone());

        let port = self.config.sync.api.port;
        let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                cancel.cancel();
                self.drain(workers, scheduler).await;
                return Err(e).with_context(|| format!("Failed to bind port {}", port));
            }
        };
        info!(
            port = port,
            integration = %self.integration.name(),
            webhook_route = %format!("/integration/webhook/{}", self.integration.name()),
            "Integration runner listening"
        );

        let shutdown = cancel.clone();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("HTTP server error");
        cancel.cancel();

        self.drain(workers, scheduler).await;
        served
    }

    async fn drain(&self, workers: Vec<JoinHandle<()>>, scheduler: JoinHandle<()>) {
        info!(workers = workers.len(), "Draining live event workers");
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "Live event worker failed");
            }
        }
        if let Err(e) = scheduler.await {
            warn!(error = %e, "Resync scheduler task failed");
        }
        // manual passes run detached from the API handler
        self.coordinator.state().wait_idle().await;
        info!("Shutdown complete");
    }
}
