//! Session Service
//!
//! Rental sessions for remote devices and the secure execution pipeline:
//! uploaded code is scored by the security gate, encrypted at rest, and run
//! by the device owner in a resource-limited, network-less container.

pub mod config;
pub mod handlers;
pub mod service;
pub mod storage;

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::{Config, StorageBackend};
pub use handlers::{AppState, USER_ID_HEADER};
pub use service::{SessionService, Timeframe};
pub use storage::{MemorySessionStore, RedisSessionStore, SessionStore};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/api/sessions", post(handlers::create_session_handler))
        .route("/api/sessions/owner", get(handlers::owner_sessions_handler))
        .route("/api/sessions/renter", get(handlers::renter_sessions_handler))
        .route(
            "/api/sessions/pending-execution",
            get(handlers::pending_executions_handler),
        )
        .route(
            "/api/sessions/security-analytics",
            get(handlers::security_analytics_handler),
        )
        .route(
            "/api/sessions/{session_id}/status",
            put(handlers::update_status_handler),
        )
        .route(
            "/api/sessions/{session_id}/upload",
            post(handlers::upload_handler),
        )
        .route(
            "/api/sessions/{session_id}/execute",
            post(handlers::execute_handler),
        )
        .route(
            "/api/sessions/{session_id}/result",
            get(handlers::result_handler),
        )
        .route(
            "/api/sessions/{session_id}/analysis",
            get(handlers::analysis_handler),
        )
        .route(
            "/api/base-images/status",
            get(handlers::base_image_status_handler),
        )
        .route(
            "/api/base-images/rebuild",
            post(handlers::rebuild_base_images_handler),
        )
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
