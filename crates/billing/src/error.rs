//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    /// Billing service answered with a non-success, non-404 status.
    #[error("Billing service returned {status}: {detail}")]
    ServiceResponse {
        status: u16,
        detail: String,
        code: Option<String>,
        link: Option<String>,
    },

    #[error("Billing service request failed: {0}")]
    ServiceUnreachable(String),

    /// The license activation endpoint rejected the key.
    #[error("License error [{code}]: {detail}")]
    License { code: String, detail: String },

    #[error("Invalid license key: {0}")]
    InvalidLicenseKey(String),

    #[error("Not authenticated: {0}")]
    NotAuthenticated(String),

    #[error("Token encoding failed: {0}")]
    TokenEncoding(String),

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// SQLSTATE code when the driver reported one.
        code: Option<String>,
    },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// The "licenses" table may not exist yet on a fresh install; the
    /// instance license cache treats that as "no license" rather than a fault.
    pub fn is_undefined_table(&self) -> bool {
        matches!(
            self,
            BillingError::Database { code: Some(code), .. } if code == "42P01"
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        let code = match &err {
            sqlx::Error::Database(db_err) => db_err.code().map(|c| c.to_string()),
            _ => None,
        };
        BillingError::Database {
            message: err.to_string(),
            code,
        }
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(err: redis::RedisError) -> Self {
        BillingError::Cache(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::ServiceUnreachable(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Internal(format!("JSON error: {}", err))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
