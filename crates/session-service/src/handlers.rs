//! API handlers for the session service

use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use exec_common::Error;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::service::{
    CreatedSession, ExecuteResponse, PendingExecution, RebuildStarted, ResultResponse,
    SecurityAnalytics, SessionService, SessionView, Timeframe, UploadResponse,
};
use exec_common::AnalysisResult;
use execution_engine::CatalogStatus;

/// Header carrying the authenticated caller id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Shared application state
pub struct AppState {
    pub service: SessionService,
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({
            "error": self.message
        });
        if let Some(details) = self.details {
            body["details"] = details;
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::Validation(_) => ApiError::new(StatusCode::BAD_REQUEST, message),
            Error::Unauthorized(_) => ApiError::new(StatusCode::FORBIDDEN, message),
            Error::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, message),
            Error::SecurityRejected(analysis) => ApiError {
                status: StatusCode::BAD_REQUEST,
                message,
                details: Some(serde_json::json!({ "analysis": analysis })),
            },
            Error::Tamper => ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, message),
            Error::Build { ref output, .. } | Error::Runtime { ref output, .. } => ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                details: (!output.is_empty()).then(|| serde_json::json!({ "output": output })),
                message,
            },
            _ => ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, message),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

/// Caller identity from the [`USER_ID_HEADER`] header
#[derive(Debug, Clone)]
pub struct Actor(pub String);

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Actor(value.to_string()))
            .ok_or_else(|| {
                ApiError::new(
                    StatusCode::UNAUTHORIZED,
                    format!("Missing {} header", USER_ID_HEADER),
                )
            })
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(alias = "deviceId")]
    pub device_id: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub requirements: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default, alias = "forceExecute")]
    pub force_execute: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalyticsQuery {
    pub timeframe: Option<String>,
    #[serde(alias = "deviceId")]
    pub device_id: Option<String>,
}

/// Health check
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "session-service"
    }))
}

/// Renter requests a device
pub async fn create_session_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreatedSession>), ApiError> {
    info!("Session requested by {} for device {}", actor, payload.device_id);

    let created = state
        .service
        .create_session(&actor, &payload.device_id)
        .await?;

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn owner_sessions_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
) -> Result<Json<Vec<SessionView>>, ApiError> {
    Ok(Json(state.service.owner_sessions(&actor).await?))
}

pub async fn renter_sessions_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
) -> Result<Json<Vec<SessionView>>, ApiError> {
    Ok(Json(state.service.renter_sessions(&actor).await?))
}

pub async fn pending_executions_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
) -> Result<Json<Vec<PendingExecution>>, ApiError> {
    Ok(Json(state.service.pending_executions(&actor).await?))
}

pub async fn security_analytics_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<SecurityAnalytics>, ApiError> {
    let timeframe = match query.timeframe.as_deref() {
        Some(value) => value.parse::<Timeframe>()?,
        None => Timeframe::default(),
    };

    let analytics = state
        .service
        .security_analytics(&actor, timeframe, query.device_id.as_deref())
        .await?;

    Ok(Json(analytics))
}

/// Owner accepts, rejects or completes a rental
pub async fn update_status_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(session_id): Path<String>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<SessionView>, ApiError> {
    let session = state
        .service
        .update_status(&actor, &session_id, &payload.status)
        .await?;

    Ok(Json(session))
}

pub async fn upload_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(session_id): Path<String>,
    Json(payload): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, ApiError> {
    info!("Code upload for session {}", session_id);

    let response = state
        .service
        .upload(
            &actor,
            &session_id,
            &payload.code,
            payload.requirements.as_deref(),
        )
        .await?;

    Ok(Json(response))
}

/// Owner triggers execution. The body is optional.
pub async fn execute_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let request: ExecuteRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ExecuteRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            ApiError::new(StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e))
        })?
    };

    info!(
        "Execution requested for session {} (force: {})",
        session_id, request.force_execute
    );

    let response = state
        .service
        .execute(&actor, &session_id, request.force_execute)
        .await?;

    Ok(Json(response))
}

pub async fn result_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(session_id): Path<String>,
) -> Result<Json<ResultResponse>, ApiError> {
    Ok(Json(state.service.result(&actor, &session_id).await?))
}

pub async fn analysis_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Path(session_id): Path<String>,
) -> Result<Json<AnalysisResult>, ApiError> {
    Ok(Json(state.service.analysis(&actor, &session_id).await?))
}

pub async fn base_image_status_handler(
    State(state): State<Arc<AppState>>,
) -> Json<CatalogStatus> {
    Json(state.service.base_image_status().await)
}

pub async fn rebuild_base_images_handler(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
) -> Result<(StatusCode, Json<RebuildStarted>), ApiError> {
    let started = state.service.rebuild_base_images(&actor).await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}
