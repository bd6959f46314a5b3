//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Stripe rate limit hit")]
    RateLimited,

    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    #[error("License not found: {0}")]
    LicenseNotFound(String),

    #[error("License is not owned by the caller")]
    Unauthorized,

    #[error("License is bound to a site; deactivate it by removing the site")]
    SiteBoundLicense,

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Subscription period has ended")]
    SubscriptionEnded,

    #[error("Subscription is scheduled for cancellation")]
    SubscriptionCancelled,

    #[error("Subscription is not active")]
    SubscriptionInactive,

    #[error("Payment method required for this operation")]
    PaymentMethodRequired,

    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(i64),

    #[error("Malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("Data inconsistency queued for reconciliation: {0}")]
    DataInconsistency(String),

    #[error("Refund failed: {0}")]
    RefundFailed(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the retry kernel should retry this error.
    ///
    /// Network-level and rate-limit failures from Stripe or the stores are
    /// transient; validation and classification failures are permanent and
    /// must surface immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::StripeApi(_)
                | BillingError::RateLimited
                | BillingError::Database(_)
                | BillingError::Cache(_)
        )
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match &err {
            stripe::StripeError::Stripe(req) if req.http_status == 429 => BillingError::RateLimited,
            _ => BillingError::StripeApi(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BillingError::StripeApi("connection reset".into()).is_transient());
        assert!(BillingError::RateLimited.is_transient());
        assert!(BillingError::Database("pool timeout".into()).is_transient());

        assert!(!BillingError::SignatureInvalid.is_transient());
        assert!(!BillingError::InvalidQuantity(0).is_transient());
        assert!(!BillingError::LicenseNotFound("k".into()).is_transient());
        assert!(!BillingError::PaymentMethodRequired.is_transient());
    }
}
