/// Server setup and initialization
///
/// Wires together all components: database, collaborators, registry, engine,
/// approval gate, drip scheduler, trigger dispatcher, tick service and routes.

use crate::{
    api::{create_api_routes, AppState},
    config::Config,
    db::Database,
    drip::{DripScheduler, DripStorage},
    events::EventLog,
    guard::{IdempotencyCache, SlidingWindowLimiter},
    integrations::{build_providers, Providers},
    runtime::{HitlGate, TaskExecutor, TickService, TriggerDispatcher, WorkflowEngine},
    workflow::{TriggerRegistry, WorkflowStorage},
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Build the shared application state over an open database
pub async fn build_state(config: &Config, db: &Database, providers: Providers) -> Result<AppState> {
    let Providers { messaging, ai, webhooks } = providers;
    let events = Arc::new(EventLog::new(config.engine.event_log_capacity));

    tracing::info!("📋 Initializing workflow storage");
    let storage = WorkflowStorage::new(db.pool().clone());

    tracing::info!("📊 Initializing trigger registry");
    let registry = Arc::new(TriggerRegistry::new(storage.clone()));
    registry
        .init_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load templates from storage: {}", e))?;

    tracing::info!("🚀 Initializing workflow engine");
    let executor = TaskExecutor::new(messaging.clone(), ai, webhooks, events.clone());
    let engine = Arc::new(WorkflowEngine::new(
        storage.clone(),
        Arc::clone(&registry),
        executor,
        events.clone(),
    ));
    let gate = HitlGate::new(Arc::clone(&engine));
    let drip = DripScheduler::new(DripStorage::new(db.pool().clone()), messaging, events.clone());

    let idempotency = Arc::new(IdempotencyCache::new(
        Duration::from_secs(config.hitl.idempotency_ttl_secs),
        config.hitl.idempotency_capacity,
    ));
    let limiter = Arc::new(SlidingWindowLimiter::new(
        config.hitl.rate_limit,
        Duration::from_secs(config.hitl.rate_window_secs),
    ));

    let dispatcher = Arc::new(TriggerDispatcher::start(
        Arc::clone(&engine),
        config.engine.dispatch_workers,
        config.engine.dispatch_queue_capacity,
    ));

    tracing::info!("⏰ Initializing tick service");
    let ticks = Arc::new(
        TickService::new(
            Arc::clone(&engine),
            drip.clone(),
            Arc::clone(&idempotency),
            Arc::clone(&limiter),
            config.scheduler.tick_schedule.clone(),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize tick scheduler: {}", e))?,
    );

    Ok(AppState {
        storage,
        registry,
        engine,
        gate,
        drip,
        dispatcher,
        ticks,
        idempotency,
        limiter,
        events,
    })
}

/// Router with health check and every API route
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .merge(create_api_routes(state))
}

/// Open the database, build the state, start background work and return the app
pub async fn create_app(config: Config) -> Result<(Router, AppState)> {
    let db = Database::connect(&config.database.url).await?;
    let providers = build_providers(&config.integrations)?;
    let state = build_state(&config, &db, providers).await?;

    tracing::info!("🚀 Starting tick scheduler");
    let ticks = Arc::clone(&state.ticks);
    tokio::spawn(async move {
        if let Err(e) = ticks.start().await {
            tracing::error!("❌ Failed to start tick scheduler: {}", e);
        }
    });

    tracing::info!("📡 Creating HTTP router with all endpoints");
    let router = create_router(state.clone());

    tracing::info!("✅ Application initialized successfully");
    Ok((router, state))
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting crmflow server...");

    let (app, state) = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("🛑 Shutting down background work");
    if let Err(e) = state.ticks.stop().await {
        tracing::warn!("⚠️ Tick scheduler did not stop cleanly: {}", e);
    }
    state.dispatcher.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
    }
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
