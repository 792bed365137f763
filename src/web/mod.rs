//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::scheduler::{Orchestrator, RetentionManager};
use crate::settings::SettingsHandle;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub orchestrator: Arc<Orchestrator>,
    pub settings: Arc<SettingsHandle>,
    pub retention: Arc<RetentionManager>,
}

/// JSON API server for countertrail.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

        Router::new()
            // Servers
            .route("/api/servers", get(handlers::handle_get_servers).post(handlers::handle_create_server))
            .route(
                "/api/servers/{id}",
                put(handlers::handle_update_server).delete(handlers::handle_delete_server),
            )
            .route("/api/servers/{id}/run", post(handlers::handle_run_now))
            .route(
                "/api/servers/{id}/collectors/{collector_id}/resume",
                post(handlers::handle_resume_collector),
            )
            // Catalogue and configuration
            .route(
                "/api/collectors",
                get(handlers::handle_get_collectors).post(handlers::handle_create_collector),
            )
            .route("/api/collectors/{id}", put(handlers::handle_update_collector))
            .route("/api/alert-rules", get(handlers::handle_get_alert_rules))
            .route("/api/alert-rules/{kind}", put(handlers::handle_update_alert_rule))
            .route("/api/settings", get(handlers::handle_get_settings).put(handlers::handle_update_settings))
            // Data
            .route("/api/query/{table}", get(handlers::handle_query))
            .route("/api/health", get(handlers::handle_health))
            .route("/api/alerts", get(handlers::handle_active_alerts))
            // Control
            .route("/api/pause", post(handlers::handle_pause))
            .route("/api/resume", post(handlers::handle_resume))
            .route("/api/archive", post(handlers::handle_archive))
            .route("/api/status", get(handlers::handle_status))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;

        Ok(())
    }
}
