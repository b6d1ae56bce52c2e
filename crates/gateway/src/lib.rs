//! HTTP API gateway for Canopy.
//!
//! Exposes the boundary surfaces of the run orchestrator:
//!
//! - `GET  /health`                                  — liveness
//! - `POST /sessions` + CRUD                         — isolation boundaries
//! - `POST /sessions/{sid}/agents` + CRUD            — agent tree editing
//! - `POST /sessions/{sid}/links` + CRUD             — editor edge bookkeeping
//! - `POST /sessions/{sid}/runs`                     — create a pending run
//! - `GET  /sessions/{sid}/runs/{id}`                — run state
//! - `GET  /sessions/{sid}/runs/{id}/stream`         — SSE event stream
//! - `GET  /cache/stats`                             — tree cache visibility
//!
//! Built on Axum. Every agent/link mutation notifies the store's listeners,
//! which keeps the tree cache coherent without the handlers knowing about it.

pub mod routes;

use canopy_config::CanopyConfig;
use canopy_orchestrator::{
    CircuitBreaker, CoordinatorConfig, ExecutorConfig, RecursiveExecutor, RunCoordinator,
    TreeCache,
};
use canopy_provider::GeminiClient;
use canopy_store::AgentStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::info;

/// Shared application state for the gateway.
pub struct AppState {
    pub store: Arc<AgentStore>,
    pub cache: Arc<TreeCache>,
    pub coordinator: Arc<RunCoordinator>,
    pub config: CanopyConfig,
}

pub type SharedState = Arc<AppState>;

/// Assemble the full application state from configuration.
///
/// Builds the provider, store, cache, executor, and coordinator once and
/// wires the cache into the store's mutation listeners.
pub async fn build_state(config: CanopyConfig) -> Result<SharedState, canopy_core::Error> {
    let store = Arc::new(
        AgentStore::open(&config.database_path)
            .await
            .map_err(canopy_core::Error::Store)?,
    );

    let generator = Arc::new(
        GeminiClient::new().with_legacy_models(config.legacy_model_map.clone()),
    );
    let llm_permits = Arc::new(Semaphore::new(config.global_llm_concurrency));

    let cache = Arc::new(TreeCache::new(
        store.clone(),
        generator.clone(),
        llm_permits.clone(),
    ));
    store.add_listener(cache.clone());

    let executor = Arc::new(RecursiveExecutor::new(
        store.clone(),
        generator.clone(),
        Arc::new(CircuitBreaker::new()),
        llm_permits.clone(),
        ExecutorConfig {
            max_depth: config.max_depth,
            max_parallel_per_run: config.max_parallel_per_run,
            agent_timeout: Duration::from_secs(config.agent_timeout_seconds),
            history_window: config.history_window,
            selection_threshold: config.selection_threshold,
        },
    ));

    let coordinator = Arc::new(RunCoordinator::new(
        store.clone(),
        cache.clone(),
        generator,
        executor,
        llm_permits,
        CoordinatorConfig {
            run_timeout: Duration::from_secs(config.run_timeout_seconds),
            channel_capacity: config.channel_capacity,
        },
    ));

    Ok(Arc::new(AppState {
        store,
        cache,
        coordinator,
        config,
    }))
}

/// Start the gateway HTTP server.
pub async fn serve(config: CanopyConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = build_state(config).await?;
    let app = routes::build_router(state);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
