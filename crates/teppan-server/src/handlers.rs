//! HTTP request handlers

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use teppan::{BatchGenerator, ContextSnapshot, Engine, Error, StreamingGenerator};
use tracing::{debug, warn};
use uuid::Uuid;

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub generated_text: String,
}

#[derive(Debug, Deserialize)]
pub struct BatchGenerateRequest {
    pub prompts: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchGenerateResponse {
    pub generated_texts: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Engine error rendered as a JSON body with a matching status
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            Error::WorkerUnavailable(_) | Error::ShutDown | Error::Cancelled(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::WorkerStart(_) | Error::Protocol(_) | Error::Model(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// 200 while the engine is open and its model worker is attached or can be
/// relaunched; 503 once it is shut down, poisoned or done restarting for now
pub async fn health(State(state): State<AppState>) -> StatusCode {
    if state.engine.is_healthy().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let generated_text = state.engine.generate(request.prompt).await?;
    Ok(Json(GenerateResponse { generated_text }))
}

pub async fn generate_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchGenerateRequest>,
) -> Result<Json<BatchGenerateResponse>, ApiError> {
    debug!(prompts = request.prompts.len(), "batch generation");
    let generated_texts = state.engine.generate_batch(request.prompts).await?;
    Ok(Json(BatchGenerateResponse { generated_texts }))
}

/// Stream tokens as server-sent events.
///
/// Each event's data is one JSON-encoded stream event; the response ends
/// after the end or error event. Dropping the connection cancels the request.
pub async fn generate_stream(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let stream = state.engine.generate_stream(request.prompt).await?;
    debug!(request_id = %stream.id(), "stream opened");

    let events = stream.filter_map(|event| async move {
        match Event::default().json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                warn!(error = %e, "failed to encode stream event");
                None
            }
        }
    });
    Ok(Sse::new(events))
}

pub async fn request_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ContextSnapshot>, ApiError> {
    Ok(Json(state.engine.status(id).await?))
}

pub async fn cancel_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.engine.cancel(id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound(id).into())
    }
}
