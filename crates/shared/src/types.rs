//! Core domain types for the Keymint platform
//!
//! Licenses, subscriptions, payments, the deferred provisioning queue and
//! refund records. The relational store is the source of truth for all of
//! these; Stripe is the source of truth for subscription lifecycle state.

use serde::{Deserialize, Serialize};
use sqlx::Row;
use time::OffsetDateTime;
use uuid::Uuid;

/// How a checkout was classified: bound to a named site, or a pack of
/// quantity units each getting its own license key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseType {
    Site,
    Quantity,
}

impl PurchaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseType::Site => "site",
            PurchaseType::Quantity => "quantity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "site" => Some(PurchaseType::Site),
            "quantity" => Some(PurchaseType::Quantity),
            _ => None,
        }
    }
}

impl std::fmt::Display for PurchaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// License status. Licenses are never deleted, only flipped inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    Active,
    Inactive,
}

impl LicenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseStatus::Active => "active",
            LicenseStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(LicenseStatus::Active),
            "inactive" => Some(LicenseStatus::Inactive),
            _ => None,
        }
    }
}

impl std::fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entitlement unit. `license_key` is the primary identity: globally
/// unique, immutable, never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub id: Uuid,
    pub license_key: String,
    /// Stripe customer ID of the owner
    pub customer_id: String,
    pub stripe_subscription_id: String,
    pub stripe_item_id: Option<String>,
    /// Set at issuance for site purchases, NULL for quantity purchases
    pub site_domain: Option<String>,
    /// NULL until activated; rebinding overwrites, never appends
    pub used_site_domain: Option<String>,
    pub status: LicenseStatus,
    pub purchase_type: PurchaseType,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for License {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        let status_raw: String = row.try_get("status")?;
        let purchase_type_raw: String = row.try_get("purchase_type")?;
        Ok(Self {
            id: row.try_get("id")?,
            license_key: row.try_get("license_key")?,
            customer_id: row.try_get("customer_id")?,
            stripe_subscription_id: row.try_get("stripe_subscription_id")?,
            stripe_item_id: row.try_get("stripe_item_id")?,
            site_domain: row.try_get("site_domain")?,
            used_site_domain: row.try_get("used_site_domain")?,
            status: LicenseStatus::parse(&status_raw).ok_or_else(|| {
                sqlx::Error::ColumnDecode {
                    index: "status".into(),
                    source: format!("unknown license status: {}", status_raw).into(),
                }
            })?,
            purchase_type: PurchaseType::parse(&purchase_type_raw).ok_or_else(|| {
                sqlx::Error::ColumnDecode {
                    index: "purchase_type".into(),
                    source: format!("unknown purchase type: {}", purchase_type_raw).into(),
                }
            })?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Local mirror of a Stripe subscription
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub stripe_subscription_id: String,
    pub customer_id: String,
    /// Stripe status string: active, trialing, past_due, canceled, ...
    pub status: String,
    pub cancel_at_period_end: bool,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    /// Billing interval: "month" or "year"
    pub billing_period: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Whether the subscription can back an active license
    pub fn is_usable(&self) -> bool {
        matches!(self.status.as_str(), "active" | "trialing")
    }
}

/// One priced line on a subscription. `site_domain` may be empty for
/// quantity-purchase items.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionItemRecord {
    pub id: Uuid,
    pub stripe_subscription_id: String,
    pub stripe_item_id: String,
    pub site_domain: Option<String>,
    pub price_id: String,
    pub quantity: i32,
    pub status: String,
    pub removed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// A site awaiting payment, not yet billed. Removed once its checkout
/// completes or is explicitly withdrawn.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingSite {
    pub id: Uuid,
    pub customer_id: String,
    pub site_domain: String,
    pub price_id: Option<String>,
    pub created_at: OffsetDateTime,
}

/// One row per billed unit, for payment history
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub customer_id: String,
    pub stripe_subscription_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub license_key: Option<String>,
    pub site_domain: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: String,
    pub created_at: OffsetDateTime,
}

/// Deferred provisioning queue item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of deferred provisioning work. Always quantity 1: every unit
/// becomes its own subscription with its own license key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub customer_id: String,
    pub payment_intent_id: String,
    pub price_id: String,
    pub license_key: String,
    pub quantity: i32,
    /// Unix timestamp for the unit subscription's trial_end
    pub trial_end: Option<i64>,
    pub status: QueueStatus,
    pub attempts: i32,
    pub next_retry_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl QueueItem {
    /// Marker appended to `error_message` when the item has been refunded.
    /// The refund sweep checks for it to stay idempotent across runs.
    pub const REFUNDED_MARKER: &'static str = "[refunded]";

    pub fn is_refunded(&self) -> bool {
        self.error_message
            .as_deref()
            .map(|m| m.contains(Self::REFUNDED_MARKER))
            .unwrap_or(false)
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for QueueItem {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        let status_raw: String = row.try_get("status")?;
        Ok(Self {
            id: row.try_get("id")?,
            customer_id: row.try_get("customer_id")?,
            payment_intent_id: row.try_get("payment_intent_id")?,
            price_id: row.try_get("price_id")?,
            license_key: row.try_get("license_key")?,
            quantity: row.try_get("quantity")?,
            trial_end: row.try_get("trial_end")?,
            status: QueueStatus::parse(&status_raw).ok_or_else(|| sqlx::Error::ColumnDecode {
                index: "status".into(),
                source: format!("unknown queue status: {}", status_raw).into(),
            })?,
            attempts: row.try_get("attempts")?,
            next_retry_at: row.try_get("next_retry_at")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// One compensating refund, linked back to the queue item it compensates
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RefundRecord {
    pub id: Uuid,
    pub queue_id: Option<Uuid>,
    pub license_key: Option<String>,
    pub payment_intent_id: Option<String>,
    pub stripe_refund_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub reason: Option<String>,
    pub created_at: OffsetDateTime,
}

/// A site a license has been activated against
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SiteRecord {
    pub id: Uuid,
    pub customer_id: String,
    pub site_domain: String,
    pub license_key: String,
    pub status: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purchase_type_round_trip() {
        assert_eq!(PurchaseType::parse("site"), Some(PurchaseType::Site));
        assert_eq!(PurchaseType::parse("quantity"), Some(PurchaseType::Quantity));
        assert_eq!(PurchaseType::parse("bogus"), None);
        assert_eq!(PurchaseType::Quantity.to_string(), "quantity");
    }

    #[test]
    fn test_queue_status_round_trip() {
        for s in ["pending", "processing", "completed", "failed"] {
            let parsed = QueueStatus::parse(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert_eq!(QueueStatus::parse(""), None);
    }

    #[test]
    fn test_refunded_marker_detection() {
        let mut item = QueueItem {
            id: Uuid::new_v4(),
            customer_id: "cus_1".into(),
            payment_intent_id: "pi_1".into(),
            price_id: "price_1".into(),
            license_key: "key".into(),
            quantity: 1,
            trial_end: None,
            status: QueueStatus::Failed,
            attempts: 3,
            next_retry_at: None,
            error_message: Some("subscription creation failed".into()),
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        };
        assert!(!item.is_refunded());
        item.error_message = Some(format!(
            "subscription creation failed {}",
            QueueItem::REFUNDED_MARKER
        ));
        assert!(item.is_refunded());
    }

    #[test]
    fn test_subscription_usable_states() {
        let mut sub = SubscriptionRecord {
            id: Uuid::new_v4(),
            stripe_subscription_id: "sub_1".into(),
            customer_id: "cus_1".into(),
            status: "active".into(),
            cancel_at_period_end: false,
            current_period_start: OffsetDateTime::now_utc(),
            current_period_end: OffsetDateTime::now_utc(),
            billing_period: "month".into(),
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        };
        assert!(sub.is_usable());
        sub.status = "trialing".into();
        assert!(sub.is_usable());
        sub.status = "past_due".into();
        assert!(!sub.is_usable());
        sub.status = "canceled".into();
        assert!(!sub.is_usable());
    }
}
