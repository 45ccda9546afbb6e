//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sightline_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Resource already exists")]
    Conflict(String),
    #[error("No organization found")]
    NoOrganization,

    /// The license activation endpoint rejected the key. Serialized in the
    /// activation endpoint's own wire shape so clients see `code`/`detail`
    /// verbatim.
    #[error("License error [{code}]: {detail}")]
    License { code: String, detail: String },

    #[error("Billing service error: {0}")]
    BillingService(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // License activation failures keep the upstream body shape instead
        // of the standard error envelope.
        if let ApiError::License { code, detail } = &self {
            let body = Json(json!({
                "type": "license_error",
                "code": code,
                "detail": detail,
                "attr": null,
            }));
            return (StatusCode::BAD_REQUEST, body).into_response();
        }

        let (status, code, message) = match &self {
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            ApiError::NoOrganization => (
                StatusCode::BAD_REQUEST,
                "NO_ORGANIZATION",
                "No organization found. Please create an organization first.".to_string(),
            ),

            ApiError::License { .. } => unreachable!("handled above"),
            ApiError::BillingService(msg) => {
                (StatusCode::BAD_GATEWAY, "BILLING_SERVICE_ERROR", msg.clone())
            }

            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            sqlx::Error::Database(db_err) => {
                if let Some(code) = db_err.code() {
                    // PostgreSQL unique violation
                    if code == "23505" {
                        return ApiError::Conflict("Resource already exists".to_string());
                    }
                }
                ApiError::Database(db_err.to_string())
            }
            _ => ApiError::Database(err.to_string()),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::License { code, detail } => ApiError::License { code, detail },
            BillingError::NotAuthenticated(_) => ApiError::Unauthorized,
            BillingError::InvalidLicenseKey(msg) => ApiError::BadRequest(msg),
            BillingError::NotFound(_) => ApiError::NotFound,
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BillingError::ServiceResponse { status, detail, .. } => {
                ApiError::BillingService(format!("billing service returned {}: {}", status, detail))
            }
            BillingError::ServiceUnreachable(msg) => ApiError::BillingService(msg),
            BillingError::Database { message, .. } => ApiError::Database(message),
            other => {
                tracing::error!(error = %other, "Billing error");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
