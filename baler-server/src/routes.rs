//! The HTTP surface: one endpoint that runs the archive pipeline, plus a liveness probe.
//!
//! ## Structure
//! - `POST /folders` — bale up everything under a source prefix into a tar.gz archive at
//!   a destination key.  Blocks until the run reaches a terminal state.
//! - `GET  /healthz` — liveness probe
//!
//! Responses are JSON envelopes: `{"status":"success","message":...}` on completion,
//! `{"status":"error","message":...,"requestId":...}` otherwise.  Internal error detail
//! is logged under the request id, never returned to the caller.
use crate::config::ServerConfig;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use baler::{ArchiveError, ArchiveJobBuilder, SourcePrefix, TargetObject};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, Instrument};
use url::Url;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
}

/// Build and return the router for all routes.
///
/// The router carries shared state (`AppState`) to all handlers.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/folders", post(archive_folder))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveFolderRequest {
    /// Prefix within the configured source bucket whose objects are archived
    #[serde(default)]
    source_key: String,

    /// Key within the configured destination bucket the archive is written to
    #[serde(default)]
    destination_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    status: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

/// An error response with the status code to send it under.
///
/// The message here is what the caller sees; whatever detail exists was already logged.
struct AppError {
    status: StatusCode,
    message: String,
    request_id: String,
}

impl AppError {
    fn bad_request(message: impl Into<String>, request_id: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            request_id: request_id.to_string(),
        }
    }

    fn internal(request_id: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error creating the archive".to_string(),
            request_id: request_id.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ApiResponse {
            status: "error",
            message: self.message,
            request_id: Some(self.request_id),
        });

        (self.status, body).into_response()
    }
}

async fn archive_folder(
    State(state): State<AppState>,
    Json(request): Json<ArchiveFolderRequest>,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("archive_folder", request_id = %request_id);

    async move {
        match run_archive_job(&state, &request, &request_id).await {
            Ok(message) => Json(ApiResponse {
                status: "success",
                message,
                request_id: None,
            })
            .into_response(),
            Err(error) => error.into_response(),
        }
    }
    .instrument(span)
    .await
}

async fn run_archive_job(
    state: &AppState,
    request: &ArchiveFolderRequest,
    request_id: &str,
) -> Result<String, AppError> {
    // Validate before a single remote call is made
    if request.source_key.is_empty() || request.destination_key.is_empty() {
        return Err(AppError::bad_request(
            "sourceKey and destinationKey are required",
            request_id,
        ));
    }

    let config = &state.config;
    let source_url = object_url(&config.source_bucket, &request.source_key)
        .map_err(|message| AppError::bad_request(message, request_id))?;
    let target_url = object_url(&config.dest_bucket, &request.destination_key)
        .map_err(|message| AppError::bad_request(message, request_id))?;

    info!(
        source = %source_url,
        target = %target_url,
        "starting archive run"
    );

    let job = ArchiveJobBuilder::new(
        config.pipeline.clone(),
        SourcePrefix::Url(source_url),
        TargetObject::Url(target_url),
    )
    .build()
    .await
    .map_err(|e| archive_error_response(e, request_id))?;

    let total_objects = job.total_objects();
    let total_bytes = job.total_bytes();

    let summary = job
        .run()
        .await
        .map_err(|e| archive_error_response(e, request_id))?;

    info!(
        objects_archived = summary.objects_archived,
        objects_skipped = summary.objects_skipped,
        bytes_uploaded = summary.upload.bytes_uploaded,
        "archive run finished"
    );

    Ok(format!(
        "archived {} of {} objects ({} source bytes) to '{}'",
        summary.objects_archived, total_objects, total_bytes, request.destination_key
    ))
}

fn archive_error_response(error: ArchiveError, request_id: &str) -> AppError {
    match error {
        ArchiveError::NoObjectsFound { .. } => {
            info!("no objects found under the requested source prefix");
            AppError::bad_request("no objects found under the requested source prefix", request_id)
        }
        error => {
            error!(error = %error, "archive run failed");
            AppError::internal(request_id)
        }
    }
}

fn object_url(bucket: &str, key: &str) -> Result<Url, String> {
    format!("s3://{bucket}/{key}")
        .parse()
        .map_err(|_| format!("'{key}' is not a usable object key"))
}
