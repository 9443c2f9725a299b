use axum::http::{header::AUTHORIZATION, HeaderMap};

use crate::error::ApiError;

pub fn verify_bearer(headers: &HeaderMap, expected_key: &str) -> Result<(), ApiError> {
    let token = extract_bearer_token(headers)?;

    if token.trim() != expected_key {
        return Err(ApiError::Unauthorized("Invalid API key".to_string()));
    }

    Ok(())
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let Some(raw_header) = headers.get(AUTHORIZATION) else {
        return Err(ApiError::Unauthorized(
            "Missing Authorization header".to_string(),
        ));
    };

    let Ok(value) = raw_header.to_str() else {
        return Err(ApiError::Unauthorized(
            "Invalid Authorization header".to_string(),
        ));
    };

    let Some(token) = value.strip_prefix("Bearer ") else {
        return Err(ApiError::Unauthorized(
            "Authorization must use Bearer token".to_string(),
        ));
    };

    Ok(token.to_string())
}
