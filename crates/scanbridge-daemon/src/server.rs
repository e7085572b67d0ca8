//! Web server setup and routing

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use scanbridge_scan::protocol::{INFO_PATH, SESSION_PATH};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api;
use crate::state::AppState;

/// Routes of the scanner endpoint
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(INFO_PATH, get(api::get_info))
        .route(SESSION_PATH, post(api::post_session))
        .route("/api/session", get(api::get_status))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve the scanner until Ctrl-C, then abort any running capture
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let app = router(state.clone());
    run_http(app, &state.config.daemon.bind).await?;
    state.scanner.shutdown().await;
    Ok(())
}

async fn run_http(app: Router, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, protocol = "HTTP", "Starting scanner endpoint");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
            }
        })
        .await?;
    Ok(())
}
