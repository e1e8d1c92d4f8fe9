// HTTP API Error Types
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Map, Value};

use crate::auth::JwtError;
use crate::engine::EngineError;

/// HTTP API error with appropriate status codes and client-friendly messages
#[derive(Debug)]
pub enum ApiError {
    // 400 Bad Request
    BadRequest(String),
    ValidationError(String),

    // 401 Unauthorized
    Unauthorized(String),

    // 403 Forbidden
    Forbidden(String),
    QuotaExceeded { message: String, details: Map<String, Value> },
    TenantInactive(String),

    // 404 Not Found
    NotFound(String),

    // 409 Conflict
    Conflict(String),
    InvalidTransition { message: String, details: Map<String, Value> },

    // 410 Gone
    TokenInvalid(String),

    // 422 Unprocessable Entity
    VerificationFailed(String),

    // 429 Too Many Requests
    TooManyRequests(String),

    // 500 Internal Server Error
    InternalServerError(String),

    // 503 Service Unavailable
    ServiceUnavailable(String),
}

impl ApiError {
    /// Get HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::ValidationError(_) => 400,
            ApiError::Unauthorized(_) => 401,
            ApiError::Forbidden(_) => 403,
            ApiError::QuotaExceeded { .. } => 403,
            ApiError::TenantInactive(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 409,
            ApiError::InvalidTransition { .. } => 409,
            ApiError::TokenInvalid(_) => 410,
            ApiError::VerificationFailed(_) => 422,
            ApiError::TooManyRequests(_) => 429,
            ApiError::InternalServerError(_) => 500,
            ApiError::ServiceUnavailable(_) => 503,
        }
    }

    /// Get client-safe error message
    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(msg) => msg,
            ApiError::ValidationError(msg) => msg,
            ApiError::Unauthorized(msg) => msg,
            ApiError::Forbidden(msg) => msg,
            ApiError::QuotaExceeded { message, .. } => message,
            ApiError::TenantInactive(msg) => msg,
            ApiError::NotFound(msg) => msg,
            ApiError::Conflict(msg) => msg,
            ApiError::InvalidTransition { message, .. } => message,
            ApiError::TokenInvalid(msg) => msg,
            ApiError::VerificationFailed(msg) => msg,
            ApiError::TooManyRequests(msg) => msg,
            ApiError::InternalServerError(msg) => msg,
            ApiError::ServiceUnavailable(msg) => msg,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::ValidationError(_) => "VALIDATION_ERROR",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            ApiError::TenantInactive(_) => "TENANT_INACTIVE",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ApiError::TokenInvalid(_) => "TOKEN_INVALID",
            ApiError::VerificationFailed(_) => "VERIFICATION_FAILED",
            ApiError::TooManyRequests(_) => "TOO_MANY_ATTEMPTS",
            ApiError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    /// Convert to JSON response body
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "success": false,
            "error": self.message(),
            "code": self.error_code()
        });

        if let ApiError::QuotaExceeded { details, .. } | ApiError::InvalidTransition { details, .. } = self {
            if let Value::Object(map) = &mut body {
                map.extend(details.clone());
            }
        }

        body
    }
}

// Static constructor methods
impl ApiError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        ApiError::Unauthorized(message.into())
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        ApiError::InternalServerError(message.into())
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        ApiError::ServiceUnavailable(message.into())
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidTransition { current, requested } => {
                let mut details = Map::new();
                details.insert("current".into(), json!(current));
                details.insert("requested".into(), json!(requested));
                ApiError::InvalidTransition {
                    message: format!("Cannot {} a card in state {}", requested, current),
                    details,
                }
            }
            EngineError::QuotaExceeded { resource, limit, current } => {
                let mut details = Map::new();
                details.insert("resource".into(), json!(resource));
                details.insert("limit".into(), json!(limit));
                details.insert("current".into(), json!(current));
                ApiError::QuotaExceeded {
                    message: format!("Quota exceeded for {}", resource),
                    details,
                }
            }
            e @ EngineError::TokenInvalid => ApiError::TokenInvalid(e.to_string()),
            e @ EngineError::VerificationFailed => ApiError::VerificationFailed(e.to_string()),
            e @ EngineError::TooManyAttempts => ApiError::TooManyRequests(e.to_string()),
            e @ EngineError::GenerationExhausted { .. } => {
                tracing::error!("{}", e);
                ApiError::service_unavailable("Could not allocate a card identifier, please retry")
            }
            e @ EngineError::CrossTenantAccess { entity } => {
                // Same response as a missing row so existence is not confirmed
                tracing::warn!("Refused cross-tenant access: {}", e);
                ApiError::NotFound(EngineError::not_found(entity).to_string())
            }
            e @ EngineError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            EngineError::Forbidden(msg) => ApiError::Forbidden(msg),
            EngineError::Conflict(msg) => ApiError::Conflict(msg),
            e @ EngineError::TenantInactive(_) => ApiError::TenantInactive(e.to_string()),
            EngineError::Validation(msg) => ApiError::ValidationError(msg),
            EngineError::Store(store_err) => {
                // Log the real error but return generic message
                tracing::error!("Store error: {}", store_err);
                ApiError::internal_server_error("An error occurred while processing your request")
            }
        }
    }
}

impl From<JwtError> for ApiError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::InvalidSecret => {
                tracing::error!("JWT secret not configured");
                ApiError::internal_server_error("Authentication is not configured")
            }
            other => ApiError::unauthorized(other.to_string()),
        }
    }
}

// Standard error trait implementations
impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for ApiError {}

// Automatic HTTP response conversion for Axum
impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_json())).into_response()
    }
}
