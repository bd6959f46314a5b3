//! Billing Events Module
//!
//! Append-only billing event logging for audit trails and debugging. Events
//! capture every fulfillment-relevant operation and can be used to answer
//! "why does this customer hold this license?" and to reconstruct the history
//! of a payment that needed reconciliation.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    // Subscription lifecycle
    SubscriptionUpdated,
    SubscriptionCanceled,

    // Fulfillment
    LicenseIssued,
    QueueItemEnqueued,
    QueueItemCompleted,
    QueueItemFailed,

    // Invoicing and payments
    PaymentSucceeded,
    InvoicePaid,
    RefundIssued,

    // Activation
    SiteActivated,
    SiteDeactivated,

    // Teardown
    TeardownCompleted,
    TeardownRolledBack,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::SubscriptionUpdated => "SUBSCRIPTION_UPDATED",
            BillingEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingEventType::LicenseIssued => "LICENSE_ISSUED",
            BillingEventType::QueueItemEnqueued => "QUEUE_ITEM_ENQUEUED",
            BillingEventType::QueueItemCompleted => "QUEUE_ITEM_COMPLETED",
            BillingEventType::QueueItemFailed => "QUEUE_ITEM_FAILED",
            BillingEventType::PaymentSucceeded => "PAYMENT_SUCCEEDED",
            BillingEventType::InvoicePaid => "INVOICE_PAID",
            BillingEventType::RefundIssued => "REFUND_ISSUED",
            BillingEventType::SiteActivated => "SITE_ACTIVATED",
            BillingEventType::SiteDeactivated => "SITE_DEACTIVATED",
            BillingEventType::TeardownCompleted => "TEARDOWN_COMPLETED",
            BillingEventType::TeardownRolledBack => "TEARDOWN_ROLLED_BACK",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through the activation API
    User,
    /// System automation (sweeps, reconciliation)
    System,
    /// Stripe webhook
    Stripe,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
            ActorType::Stripe => write!(f, "stripe"),
        }
    }
}

/// Builder for creating billing events
pub struct BillingEventBuilder {
    customer_id: Option<String>,
    event_type: BillingEventType,
    event_data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_subscription_id: Option<String>,
    license_key: Option<String>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(event_type: BillingEventType) -> Self {
        Self {
            customer_id: None,
            event_type,
            event_data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_subscription_id: None,
            license_key: None,
            actor_type: ActorType::System,
        }
    }

    pub fn customer(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    pub fn stripe_event(mut self, event_id: impl Into<String>) -> Self {
        self.stripe_event_id = Some(event_id.into());
        self
    }

    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }

    pub fn license(mut self, license_key: impl Into<String>) -> Self {
        self.license_key = Some(license_key.into());
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }
}

/// Service appending billing events to the audit log
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Log a billing event
    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events (
                customer_id,
                event_type,
                event_data,
                stripe_event_id,
                stripe_subscription_id,
                license_key,
                actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&builder.customer_id)
        .bind(builder.event_type.to_string())
        .bind(&builder.event_data)
        .bind(&builder.stripe_event_id)
        .bind(&builder.stripe_subscription_id)
        .bind(&builder.license_key)
        .bind(builder.actor_type.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(event_id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_event_type_display() {
        assert_eq!(
            BillingEventType::LicenseIssued.to_string(),
            "LICENSE_ISSUED"
        );
        assert_eq!(BillingEventType::RefundIssued.to_string(), "REFUND_ISSUED");
        assert_eq!(
            BillingEventType::TeardownRolledBack.to_string(),
            "TEARDOWN_ROLLED_BACK"
        );
    }

    #[test]
    fn test_actor_type_display() {
        assert_eq!(ActorType::User.to_string(), "user");
        assert_eq!(ActorType::System.to_string(), "system");
        assert_eq!(ActorType::Stripe.to_string(), "stripe");
    }

    #[test]
    fn test_event_builder() {
        let builder = BillingEventBuilder::new(BillingEventType::SiteActivated)
            .customer("cus_123")
            .license("KM-ABC")
            .data(serde_json::json!({"site_domain": "a.example.com"}))
            .actor_type(ActorType::User);

        assert_eq!(builder.customer_id, Some("cus_123".to_string()));
        assert_eq!(builder.license_key, Some("KM-ABC".to_string()));
        assert_eq!(builder.actor_type, ActorType::User);
    }
}
