//! HTTP bridge over a single tether session.
//!
//! Every route forwards to the shared [`Session`], so browser clients see the
//! same request/response semantics as the line protocol.

pub mod api;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use tether_session::Session;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub struct AppState {
    pub session: Session,
}

pub fn router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/api/chat", post(api::chat))
        .route("/api/commands", post(api::run_command))
        .route(
            "/api/files/{*path}",
            post(api::edit_file).delete(api::delete_file),
        )
        .route("/api/status", get(api::status))
        .route("/api/status/{task_id}", get(api::task_status))
        .route("/api/tasks/{task_id}/cancel", post(api::cancel_task))
        .route("/api/tasks/{task_id}/approval", post(api::approval))
        .layer(cors)
        .with_state(state)
}

const METHODS: [Method; 4] = [Method::GET, Method::POST, Method::DELETE, Method::OPTIONS];

pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(METHODS)
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid --allow-origin value: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods(METHODS)
        .allow_headers(Any))
}
