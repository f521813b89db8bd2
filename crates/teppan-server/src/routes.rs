//! Route table

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::{self, AppState};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/generate", post(handlers::generate))
        .route("/generate/batch", post(handlers::generate_batch))
        .route("/generate/stream", post(handlers::generate_stream))
        .route(
            "/requests/{id}",
            get(handlers::request_status).delete(handlers::cancel_request),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
