//! Application startup and lifecycle management.

use crate::api;
use crate::config::{AllocationConfig, LedgerBackend, MatchingConfig};
use crate::services::{
    get_metrics, init_metrics, AllocationEngine, ContactLocks, Database, EscalationQueue,
    InMemoryEscalationQueue, InMemoryLedger, LedgerStore, ReversalManager,
};
use axum::{
    extract::State, http::StatusCode, middleware, response::IntoResponse, routing::get, Json,
    Router,
};
use serde_json::json;
use service_core::error::AppError;
use service_core::middleware::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AllocationEngine>,
    pub reversals: Arc<ReversalManager>,
    pub ledger: Arc<dyn LedgerStore>,
    pub escalations: Arc<dyn EscalationQueue>,
}

impl AppState {
    /// Wire the engine and reversal manager over one ledger, sharing the
    /// per-contact locks between them.
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        escalations: Arc<dyn EscalationQueue>,
        matching: MatchingConfig,
    ) -> Self {
        let locks = Arc::new(ContactLocks::new());
        let reversals = Arc::new(ReversalManager::new(
            ledger.clone(),
            locks.clone(),
            matching.max_commit_retries,
        ));
        let engine = Arc::new(AllocationEngine::new(
            ledger.clone(),
            escalations.clone(),
            locks,
            matching,
        ));
        Self {
            engine,
            reversals,
            ledger,
            escalations,
        }
    }
}

/// Health check endpoint for Docker/K8s liveness probes.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.ledger.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "allocation-service",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - ledger unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "allocation-service",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness check endpoint for K8s readiness probes.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.ledger.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Metrics endpoint for Prometheus scraping.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Full HTTP router: probes, metrics and the versioned API.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .merge(api::routes())
        .route_layer(middleware::from_fn(api::metrics_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: AllocationConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: AllocationConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: AllocationConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let state = match config.ledger_backend {
            LedgerBackend::Postgres => {
                let url = config.database.url.as_deref().ok_or_else(|| {
                    AppError::ConfigError(anyhow::anyhow!(
                        "DATABASE_URL is required for the postgres ledger backend"
                    ))
                })?;
                let db = Database::new(
                    url,
                    config.database.max_connections,
                    config.database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;

                if run_migrations {
                    db.run_migrations().await.map_err(|e| {
                        tracing::error!(error = %e, "Failed to run migrations");
                        e
                    })?;
                }

                let db = Arc::new(db);
                AppState::new(db.clone(), db, config.matching.clone())
            }
            LedgerBackend::Memory => {
                tracing::warn!("Using in-memory ledger - state is lost on restart");
                AppState::new(
                    Arc::new(InMemoryLedger::new()),
                    Arc::new(InMemoryEscalationQueue::new()),
                    config.matching.clone(),
                )
            }
        };

        Self::bind(&config, state).await
    }

    async fn bind(config: &AllocationConfig, state: AppState) -> Result<Self, AppError> {
        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Allocation service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
        })
    }

    /// Get the HTTP port the application is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        let app = router(self.state);

        tracing::info!(port = self.http_port, "Starting HTTP server");
        axum::serve(self.http_listener, app).await
    }
}
