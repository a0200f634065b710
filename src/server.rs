//! # Server Configuration
//!
//! Router assembly, shared state and the serve loop for the basewatch API.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::access::DbAccess;
use crate::airtable::AirtableApi;
use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::handlers;
use crate::housekeeping::StateSweeper;
use crate::oauth_flow::OAuthFlow;
use crate::telemetry::trace_context_middleware;
use crate::vault::SecretVault;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub flow: Arc<OAuthFlow>,
}

impl AppState {
    /// Wire the lifecycle orchestrator with database-backed role and plan lookups.
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<DatabaseConnection>,
        vault: Arc<dyn SecretVault>,
        airtable: Arc<dyn AirtableApi>,
    ) -> Self {
        let access = Arc::new(DbAccess::new(db.clone()));
        let flow = OAuthFlow::new(config.clone(), db.clone(), vault, airtable, access.clone())
            .with_plan_limits(access);

        Self {
            config,
            db,
            flow: Arc::new(flow),
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/connect", get(handlers::connect::connect))
        .route("/connections", get(handlers::connections::list_connections))
        .route(
            "/connections/{id}",
            get(handlers::connections::get_connection)
                .delete(handlers::connections::delete_connection),
        )
        .route(
            "/connections/{id}/sync",
            post(handlers::connections::sync_connection),
        )
        .route(
            "/connections/{id}/refresh",
            post(handlers::connections::refresh_connection),
        )
        .layer(from_fn_with_state(state.config.clone(), auth_middleware));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/callback", get(handlers::connect::callback))
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Serve until Ctrl+C or SIGTERM, running the OAuth state sweeper alongside.
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
    vault: Arc<dyn SecretVault>,
    airtable: Arc<dyn AirtableApi>,
) -> anyhow::Result<()> {
    let addr = config
        .bind_addr()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {}", e))?;

    let config = Arc::new(config);
    let db = Arc::new(db);
    let state = AppState::new(config.clone(), db.clone(), vault, airtable);

    let shutdown = CancellationToken::new();
    let sweeper = StateSweeper::new(
        db,
        Duration::from_secs(config.oauth_state.sweep_interval_seconds),
    )
    .with_locks(state.flow.locks().clone());
    let sweeper_handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sweeper.run(shutdown).await })
    };

    let app = create_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, profile = %config.profile, "Server listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(err) = sweeper_handle.await {
        tracing::error!(error = ?err, "OAuth state sweeper task failed");
    }

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::readyz,
        crate::handlers::connect::connect,
        crate::handlers::connect::callback,
        crate::handlers::connections::list_connections,
        crate::handlers::connections::get_connection,
        crate::handlers::connections::sync_connection,
        crate::handlers::connections::refresh_connection,
        crate::handlers::connections::delete_connection,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::handlers::connections::ConnectionSummary,
            crate::handlers::connections::ConnectionListResponse,
            crate::handlers::connections::ConnectionDetailResponse,
            crate::handlers::connections::LimitsSummary,
            crate::handlers::connections::WorkspaceView,
            crate::handlers::connections::BaseView,
            crate::handlers::connections::SyncResponse,
            crate::handlers::connections::RefreshResponse,
            crate::handlers::connections::DeleteResponse,
            crate::error::ApiError,
        )
    ),
    modifiers(&SecurityAddon),
    info(
        title = "Basewatch API",
        description = "Airtable connection lifecycle and workspace/base sync",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
