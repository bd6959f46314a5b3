//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use keymint_billing::BillingError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Request validation
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Validation error: {0}")]
    Validation(String),

    // Authentication / ownership
    #[error("Not authorized for this license")]
    Forbidden,

    // Resources
    #[error("License not found")]
    LicenseNotFound,
    #[error("Resource not found")]
    NotFound,

    // Subscription gates
    #[error("Subscription period has ended")]
    SubscriptionEnded,
    #[error("Subscription is scheduled for cancellation")]
    SubscriptionCancelled,
    #[error("Subscription is not active")]
    SubscriptionInactive,

    // Rate limiting
    #[error("Too many requests")]
    RateLimited,

    // Internal
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }

            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            ApiError::LicenseNotFound => {
                (StatusCode::NOT_FOUND, "LICENSE_NOT_FOUND", self.to_string())
            }
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),

            ApiError::SubscriptionEnded => (
                StatusCode::PAYMENT_REQUIRED,
                "SUBSCRIPTION_ENDED",
                self.to_string(),
            ),
            ApiError::SubscriptionCancelled => (
                StatusCode::PAYMENT_REQUIRED,
                "SUBSCRIPTION_CANCELLED",
                self.to_string(),
            ),
            ApiError::SubscriptionInactive => (
                StatusCode::PAYMENT_REQUIRED,
                "SUBSCRIPTION_INACTIVE",
                self.to_string(),
            ),

            ApiError::RateLimited => {
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", self.to_string())
            }

            ApiError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "Database error".to_string(),
            ),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
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
            _ => ApiError::Database(err.to_string()),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::LicenseNotFound(_) => ApiError::LicenseNotFound,
            BillingError::Unauthorized => ApiError::Forbidden,
            BillingError::SubscriptionEnded => ApiError::SubscriptionEnded,
            BillingError::SubscriptionCancelled => ApiError::SubscriptionCancelled,
            BillingError::SubscriptionInactive => ApiError::SubscriptionInactive,
            BillingError::SubscriptionNotFound(_) => ApiError::NotFound,
            BillingError::SignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::InvalidQuantity(q) => {
                ApiError::Validation(format!("Invalid quantity: {}", q))
            }
            BillingError::InvalidPrice(p) => ApiError::Validation(format!("Invalid price: {}", p)),
            BillingError::MalformedMetadata(m) => ApiError::BadRequest(m),
            BillingError::PaymentMethodRequired => {
                ApiError::Validation("A default payment method is required".to_string())
            }
            err @ BillingError::SiteBoundLicense => ApiError::Validation(err.to_string()),
            BillingError::RateLimited => ApiError::RateLimited,
            other => {
                tracing::error!(error = %other, "Billing operation failed");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn status_of(err: ApiError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_billing_error_mapping() {
        assert_eq!(
            status_of(BillingError::LicenseNotFound("k".into()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(BillingError::Unauthorized.into()),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_of(BillingError::SubscriptionEnded.into()),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_of(BillingError::SignatureInvalid.into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(BillingError::RateLimited.into()),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_of(BillingError::Internal("boom".into()).into()),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        // A site-bound license is a caller mistake, not a server fault
        assert_eq!(
            status_of(BillingError::SiteBoundLicense.into()),
            StatusCode::BAD_REQUEST
        );
    }
}
