pub mod auth;
pub mod handlers;
pub mod openapi;
pub mod state;
pub mod types;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use tokio::net::TcpListener;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::branch_transfer::documents::MAX_DOCUMENT_BYTES;
use state::AppState;

/// Room for the non-file multipart fields on top of the document itself
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

/// Build the complete router
pub fn router(state: Arc<AppState>) -> Router {
    // ==========================================================================
    // Branch transfer routes - Protected by JWT
    // ==========================================================================
    let transfer_routes = Router::new()
        .route("/request", post(handlers::create_request))
        .route("/requests", get(handlers::list_requests))
        .route(
            "/requests/{request_id}",
            get(handlers::get_request).delete(handlers::cancel_request),
        )
        .route("/requests/{request_id}/conflicts", get(handlers::get_conflicts))
        .route("/requests/{request_id}/approve", post(handlers::approve_request))
        .route("/requests/{request_id}/reject", post(handlers::reject_request))
        .route(
            "/documents/{document_id}/image",
            get(handlers::get_document_image),
        )
        .layer(DefaultBodyLimit::max(MAX_DOCUMENT_BYTES + FORM_OVERHEAD_BYTES))
        .layer(from_fn_with_state(state.clone(), auth::jwt_auth_middleware));

    Router::new()
        // Health check
        .route("/api/v1/health", get(handlers::health_check))
        .nest("/api/v1/branch-transfer", transfer_routes)
        .with_state(state)
        // OpenAPI / Swagger UI (stateless, added after with_state)
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()))
}

/// Start HTTP Gateway server
pub async fn run_server(host: &str, port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = router(state);

    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {} (port already in use?)", addr))?;

    tracing::info!(%addr, "Gateway listening");
    tracing::info!("API Docs: http://{}/docs", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
