use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::{error, warn};

use crate::{models::ApiResponse, replicate::ProviderError, store::StoreError};

/// Request-level failure taxonomy. Validation and precondition failures are
/// rejected before any side effect; conflicts carry enough detail for the
/// caller to decide whether to wait; collaborator failures are surfaced
/// without retry.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error(
        "Training is already in progress (ID: {training_id}, Status: {status}). \
         Please wait for it to complete before starting a new training."
    )]
    TrainingInFlight {
        training_id: String,
        status: String,
    },

    #[error("A training submission is already in progress for this user. Please retry shortly.")]
    SubmissionInFlight,

    #[error("{0}")]
    FailedPrecondition(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::FailedPrecondition(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::TrainingInFlight { .. } | Self::SubmissionInFlight => StatusCode::CONFLICT,
            // An auth failure against the provider is a local configuration
            // problem, not an upstream outage.
            Self::Provider(ProviderError::Auth { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Provider(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("request failed: {self:#}");
        } else {
            warn!("request rejected: {self}");
        }
        (status, Json(ApiResponse::fail(self.to_string()))).into_response()
    }
}
