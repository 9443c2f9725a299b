use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::{
    auth::verify_bearer,
    error::ApiError,
    generation, provisioning, reconcile,
    models::{
        ApiResponse, CreateTrainingRequest, GenerateRequest, TrainingStatusRequest,
        UploadImagesRequest, UploadImagesResponse,
    },
    replicate::WebhookPayload,
    uploads, AppState,
};

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn upload_images(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<UploadImagesRequest>,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    if payload.user_id.trim().is_empty() || payload.image_urls.is_empty() {
        return ApiError::Validation(
            "Invalid request data. UserId and imageUrls are required.".to_string(),
        )
        .into_response();
    }

    info!(user_id = %payload.user_id, images = payload.image_urls.len(), "upload request received");
    match uploads::ingest_images(&state.deps, payload.user_id.trim(), &payload.image_urls).await {
        Ok(summary) => (
            StatusCode::OK,
            Json(ApiResponse::ok(UploadImagesResponse {
                image_count: summary.images.len(),
                uploaded_images: summary.images,
            })),
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn create_training(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateTrainingRequest>,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    if payload.user_id.trim().is_empty() {
        return ApiError::Validation(
            "Invalid request data. UserId is required.".to_string(),
        )
        .into_response();
    }
    if payload.trigger_word.trim().is_empty() || payload.steps == 0 {
        return ApiError::Validation(
            "Invalid request data. TriggerWord and a positive step count are required."
                .to_string(),
        )
        .into_response();
    }

    info!(user_id = %payload.user_id, trigger_word = %payload.trigger_word, steps = payload.steps, "training request received");
    match provisioning::submit_training(&state.deps, &payload).await {
        Ok(response) => (StatusCode::OK, Json(ApiResponse::ok(response))).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn training_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<TrainingStatusRequest>,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    let user_id = payload.user_id.trim().to_string();
    if user_id.is_empty() {
        return ApiError::Validation("Invalid request data. UserId is required.".to_string())
            .into_response();
    }

    let training_id = match payload.training_id {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => {
            match provisioning::latest_training_id(state.deps.records.as_ref(), &user_id).await {
                Ok(Some(id)) => id,
                Ok(None) => {
                    return ApiError::NotFound(
                        "No training found for this user. Please start a training first."
                            .to_string(),
                    )
                    .into_response();
                }
                Err(err) => return err.into_response(),
            }
        }
    };

    match reconcile::refresh_training(&state.deps, &user_id, &training_id).await {
        Ok(job) => (StatusCode::OK, Json(ApiResponse::ok(job.to_status_response()))).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn generate_image(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<GenerateRequest>,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    if payload.user_id.trim().is_empty()
        || payload.training_id.trim().is_empty()
        || payload.prompt.trim().is_empty()
    {
        return ApiError::Validation("Invalid request data".to_string()).into_response();
    }

    info!(user_id = %payload.user_id, training_id = %payload.training_id, "generation request received");
    match generation::generate_image(&state.deps, &payload).await {
        Ok(response) => (StatusCode::OK, Json(ApiResponse::ok(response))).into_response(),
        Err(err) => err.into_response(),
    }
}

/// Provider push endpoint. Anonymous by contract, and reconciliation failures
/// never surface as error responses: the provider would retry-storm on
/// anything but a success status.
pub async fn replicate_webhook(
    State(state): State<AppState>,
    Json(payload): Json<WebhookPayload>,
) -> impl IntoResponse {
    if payload.id.trim().is_empty() {
        warn!("invalid webhook payload: missing job id");
        return StatusCode::BAD_REQUEST.into_response();
    }

    info!(remote_id = %payload.id, status = %payload.status, "provider webhook received");
    reconcile::apply_webhook(&state.deps, &payload).await;
    StatusCode::OK.into_response()
}
