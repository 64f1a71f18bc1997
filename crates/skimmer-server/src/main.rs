use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use skimmer_client::HttpExtractor;
use skimmer_core::{
    DomainPolicyTable, EventBus, JobDefaults, LimiterConfig, MaintenanceConfig, MaintenanceTask,
    PoolConfig, PoolLoad, RateLimiterService, TracingWorkerReporter, WorkerPool, system_clock,
};
use skimmer_db::Backends;
use skimmer_server::routes;
use skimmer_server::state::{AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("skimmer=info".parse()?))
        .with_target(false)
        .init();

    let config = ServerConfig::from_env()?;
    let pool_config = PoolConfig::from_env()?;
    let clock = system_clock();

    let backends = Backends::from_env(clock.clone(), JobDefaults::from_env()?).await?;
    let load = PoolLoad::new(pool_config.workers);
    let limiter = RateLimiterService::new(
        backends.store.clone(),
        DomainPolicyTable::from_env()?,
        Arc::new(load.clone()),
        clock,
        LimiterConfig::from_env()?,
    );
    let events = EventBus::default();

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    if config.run_workers {
        let pool = WorkerPool::new(
            backends.queue.clone(),
            HttpExtractor::new()?,
            backends.content.clone(),
            limiter.clone(),
            events.clone(),
            &pool_config,
            load,
        );
        tracing::info!(workers = pool.size(), backend = backends.queue.name(), "Starting workers");
        pool.spawn(&tracker, &cancel, TracingWorkerReporter);
        MaintenanceTask::new(backends.queue.clone(), limiter.clone(), MaintenanceConfig::from_env()?)
            .spawn(&tracker, &cancel);
    }
    tracker.close();

    let mut state = AppState::new(backends.queue, limiter, events)
        .with_api_keys(config.api_keys)
        .with_sse_poll_interval(config.sse_poll_interval)
        .with_trusted_proxy(config.trust_proxy);
    if let Some(db) = backends.db {
        state = state.with_database(db);
    }
    if state.api_keys.is_empty() {
        tracing::warn!("SKIMMER_API_KEYS not set, /v1 routes are unauthenticated");
    }

    let app = routes::router(Arc::new(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancel.clone()))
    .await?;

    cancel.cancel();
    tracker.wait().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                cancel.cancelled().await;
            }
        }
        () = cancel.cancelled() => {}
    }
    tracing::info!("Shutdown signal received");
    cancel.cancel();
}
