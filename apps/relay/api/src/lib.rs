//! Relay API
//!
//! HTTP front for the async relay: dispatch an operation and wait for the worker's
//! answer, look up request status, plus health, readiness and metrics.

use async_relay::{
    ClientError, HealthProbe, HealthState, RelayConfig, RelayContext, Resilience, RetryPolicy, RouteTable, health_router,
    init_metrics,
};
use axum::{Router, http::Uri};
use eyre::WrapErr;
use redis::aio::ConnectionManager;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, warn};

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod probes;
pub mod shutdown;
pub mod state;

use config::AppConfig;
use error::ApiError;
use probes::DatabaseProbe;
use state::AppState;

/// Full application router: `/api/*`, `/health`, `/ready`, `/metrics`
pub fn router(state: AppState, name: &str, version: &str) -> Router {
    let health = health_router(HealthState {
        gate: state.gate.clone(),
        app_name: name.to_string(),
        app_version: version.to_string(),
    });

    Router::new()
        .nest("/api", api::routes(&state))
        .merge(health)
        .fallback(not_found)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(format!("no route for {}", uri.path()))
}

/// Connect with the health gate's retry budget so a broker that is still starting
/// does not abort the process.
async fn connect_redis(url: &str, relay: &RelayConfig) -> Result<ConnectionManager, ClientError> {
    let policy = RetryPolicy::new(relay.health_gate.max_retries, relay.health_gate.interval);
    Resilience::new("redis-connect", policy)
        .execute_with_retry("connect", || async {
            let client = redis::Client::open(url)?;
            Ok::<_, ClientError>(ConnectionManager::new(client).await?)
        })
        .await
}

/// Lazy pool: the health gate does the waiting for the database
async fn connect_database(url: &str) -> eyre::Result<DatabaseConnection> {
    let mut options = ConnectOptions::new(url);
    options.connect_lazy(true).sqlx_logging(false);
    Database::connect(options)
        .await
        .wrap_err("Invalid database configuration")
}

pub async fn run(config: AppConfig) -> eyre::Result<()> {
    init_metrics();

    info!(instance_id = %config.relay.instance_id, "Connecting to Redis");
    let redis = connect_redis(&config.redis_url, &config.relay)
        .await
        .wrap_err("Redis connection failed")?;
    let db = connect_database(&config.database_url).await?;

    let relay = RelayContext::from_redis(redis, config.relay.clone(), RouteTable::standard());
    let database: Arc<dyn HealthProbe> = Arc::new(DatabaseProbe::new(db.clone()));
    let gate = relay.health_gate(vec![database]);
    gate.run().await.wrap_err("Startup health gate failed")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = {
        let listener = relay.listener();
        tokio::spawn(async move { listener.run(shutdown_rx).await })
    };

    let mut scheduler = if config.jobs.enabled {
        Some(jobs::start(&relay, &gate, &config.jobs).await?)
    } else {
        info!("Scheduled jobs disabled");
        None
    };

    let app = router(AppState::new(relay, gate), &config.name, &config.version);

    let address = config.server.address();
    let tcp = TcpListener::bind(&address)
        .await
        .wrap_err_with(|| format!("Failed to bind {}", address))?;
    info!("Server starting on {}", tcp.local_addr()?);

    let serve_result = axum::serve(tcp, app.into_make_service())
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await;

    let grace = config.server.shutdown_grace;
    info!("Stopping background work (timeout: {:?})", grace);
    let _ = shutdown_tx.send(true);

    let cleanup = async {
        if let Some(scheduler) = scheduler.as_mut()
            && let Err(e) = scheduler.shutdown().await
        {
            warn!(error = %e, "Scheduler did not stop cleanly");
        }
        match listener.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Result listener ended with an error"),
            Err(e) => warn!(error = %e, "Result listener task failed"),
        }
        if let Err(e) = db.close().await {
            warn!(error = %e, "Error closing database pool");
        }
    };
    if tokio::time::timeout(grace, cleanup).await.is_err() {
        warn!("Cleanup exceeded {:?}, forcing shutdown", grace);
    }

    serve_result.wrap_err("Server error")?;
    info!("Relay API shutdown complete");
    Ok(())
}
