//! Subscription creation and local mirroring
//!
//! Stripe is the source of truth for subscription lifecycle state; this
//! module keeps the relational mirror in sync via idempotent upserts and
//! creates the per-unit subscriptions used by quantity purchases.

use std::collections::HashMap;

use sqlx::PgPool;
use stripe::generated::billing::subscription_item::SubscriptionProrationBehavior;
use stripe::{
    CancelSubscription, CreateSubscription, CreateSubscriptionItems, CustomerId, Subscription,
    SubscriptionId, UpdateSubscription,
};
use time::OffsetDateTime;
use uuid::Uuid;

use keymint_shared::SubscriptionRecord;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Seconds per day, for trial-end computation
const DAY_SECS: i64 = 86_400;

/// Compute the `trial_end` for a quantity unit from the billing interval.
///
/// The unit was already paid via the one-time checkout, so the subscription
/// starts with a trial covering the first period and produces no immediate
/// invoice.
pub fn compute_trial_end(billing_interval: &str, now_unix: i64) -> i64 {
    let days = match billing_interval {
        "year" | "annual" | "yearly" => 365,
        // Default to a monthly period for anything unrecognized
        _ => 30,
    };
    now_unix + days * DAY_SECS
}

/// Service for Stripe subscription operations and their local mirror
#[derive(Clone)]
pub struct SubscriptionService {
    stripe: StripeClient,
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Create one dedicated subscription for a single quantity unit.
    ///
    /// Never quantity-N on one subscription: every unit gets its own
    /// subscription tagged with its license key, and a trial end so the
    /// already-paid unit is not invoiced again immediately.
    pub async fn create_unit_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        license_key: &str,
        trial_end_unix: i64,
        default_payment_method: Option<&str>,
    ) -> BillingResult<Subscription> {
        let customer_id_parsed = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let mut metadata = HashMap::new();
        metadata.insert("license_key".to_string(), license_key.to_string());
        metadata.insert("use_case".to_string(), "quantity".to_string());

        let mut params = CreateSubscription::new(customer_id_parsed);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);
        params.trial_end = Some(stripe::Scheduled::Timestamp(trial_end_unix));
        if let Some(pm) = default_payment_method {
            params.default_payment_method = Some(pm);
        }

        let subscription = Subscription::create(self.stripe.inner(), params).await?;

        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription.id,
            license_key = %license_key,
            trial_end = trial_end_unix,
            "Created unit subscription"
        );

        Ok(subscription)
    }

    /// Mirror a Stripe subscription (and its items) into the relational store
    pub async fn sync_subscription_to_db(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<()> {
        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };

        let billing_period = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .and_then(|price| price.recurring.as_ref())
            .map(|r| r.interval.as_str().to_string())
            .unwrap_or_else(|| "month".to_string());

        let period_start = OffsetDateTime::from_unix_timestamp(subscription.current_period_start)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());
        let period_end = OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, stripe_subscription_id, customer_id, status, cancel_at_period_end,
                current_period_start, current_period_end, billing_period
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                status = EXCLUDED.status,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                billing_period = EXCLUDED.billing_period,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(subscription.id.as_str())
        .bind(&customer_id)
        // Stripe's wire form ("past_due", "incomplete_expired"), which the
        // gate checks and the mirror's status column both expect
        .bind(subscription.status.as_str())
        .bind(subscription.cancel_at_period_end)
        .bind(period_start)
        .bind(period_end)
        .bind(&billing_period)
        .execute(&self.pool)
        .await?;

        for item in &subscription.items.data {
            let price_id = item
                .price
                .as_ref()
                .map(|p| p.id.to_string())
                .unwrap_or_default();
            let site_domain = item
                .metadata
                .as_ref()
                .and_then(|m| m.get("site_domain"))
                .cloned();

            sqlx::query(
                r#"
                INSERT INTO subscription_items (
                    id, stripe_subscription_id, stripe_item_id, site_domain,
                    price_id, quantity, status
                )
                VALUES ($1, $2, $3, $4, $5, $6, 'active')
                ON CONFLICT (stripe_item_id) DO UPDATE SET
                    site_domain = EXCLUDED.site_domain,
                    price_id = EXCLUDED.price_id,
                    quantity = EXCLUDED.quantity,
                    status = 'active',
                    removed_at = NULL
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(subscription.id.as_str())
            .bind(item.id.as_str())
            .bind(&site_domain)
            .bind(&price_id)
            .bind(item.quantity.unwrap_or(1) as i32)
            .execute(&self.pool)
            .await?;
        }

        tracing::debug!(
            subscription_id = %subscription.id,
            customer_id = %customer_id,
            item_count = subscription.items.data.len(),
            "Synced subscription to database"
        );

        Ok(())
    }

    /// Find the customer's existing active subscription, if any, excluding
    /// a given subscription id (the duplicate-merge check)
    pub async fn find_active_for_customer(
        &self,
        customer_id: &str,
        excluding: Option<&str>,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(
            r#"
            SELECT * FROM subscriptions
            WHERE customer_id = $1
              AND status IN ('active', 'trialing')
              AND ($2::TEXT IS NULL OR stripe_subscription_id <> $2)
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(customer_id)
        .bind(excluding)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Load the local mirror row for a subscription
    pub async fn get_record(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE stripe_subscription_id = $1")
                .bind(stripe_subscription_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    /// Fetch live subscription state from Stripe (the authoritative store)
    pub async fn retrieve(&self, stripe_subscription_id: &str) -> BillingResult<Subscription> {
        let sub_id = stripe_subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let subscription = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        Ok(subscription)
    }

    /// Add a priced item to an existing subscription with proration.
    /// Used when a checkout was only meant to extend a subscription the
    /// customer already has.
    pub async fn add_item_with_proration(
        &self,
        stripe_subscription_id: &str,
        price_id: &str,
        site_domain: Option<&str>,
    ) -> BillingResult<stripe::SubscriptionItem> {
        let sub_id = stripe_subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;
        let price_id_parsed = price_id
            .parse::<stripe::PriceId>()
            .map_err(|e| BillingError::InvalidPrice(format!("{}: {}", price_id, e)))?;

        let mut create_item = stripe::CreateSubscriptionItem::new(sub_id);
        create_item.price = Some(price_id_parsed);
        create_item.quantity = Some(1);
        create_item.proration_behavior = Some(SubscriptionProrationBehavior::CreateProrations);
        if let Some(domain) = site_domain {
            let mut metadata = HashMap::new();
            metadata.insert("site_domain".to_string(), domain.to_string());
            create_item.metadata = Some(metadata);
        }

        let item = stripe::SubscriptionItem::create(self.stripe.inner(), create_item).await?;

        tracing::info!(
            subscription_id = %stripe_subscription_id,
            item_id = %item.id,
            price_id = %price_id,
            site_domain = ?site_domain,
            "Added prorated item to existing subscription"
        );

        Ok(item)
    }

    /// Cancel a subscription immediately. Compensating action for the
    /// duplicate created when a checkout targeted an existing subscription.
    pub async fn cancel_now(&self, stripe_subscription_id: &str) -> BillingResult<()> {
        let sub_id = stripe_subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        Subscription::cancel(self.stripe.inner(), &sub_id, CancelSubscription::default()).await?;

        sqlx::query(
            r#"
            UPDATE subscriptions SET status = 'canceled', updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            subscription_id = %stripe_subscription_id,
            "Cancelled duplicate subscription"
        );

        Ok(())
    }

    /// Schedule cancellation at period end. Returns the authoritative
    /// post-update subscription from Stripe.
    pub async fn cancel_at_period_end(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Subscription> {
        let sub_id = stripe_subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let mut params = UpdateSubscription::new();
        params.cancel_at_period_end = Some(true);

        let subscription = Subscription::update(self.stripe.inner(), &sub_id, params).await?;

        tracing::info!(
            subscription_id = %stripe_subscription_id,
            period_end = subscription.current_period_end,
            "Subscription scheduled to cancel at period end"
        );

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trial_end_monthly() {
        let now = 1_700_000_000;
        assert_eq!(compute_trial_end("month", now), now + 30 * DAY_SECS);
    }

    #[test]
    fn test_trial_end_annual() {
        let now = 1_700_000_000;
        assert_eq!(compute_trial_end("year", now), now + 365 * DAY_SECS);
        assert_eq!(compute_trial_end("annual", now), now + 365 * DAY_SECS);
    }

    #[test]
    fn test_trial_end_unknown_interval_defaults_monthly() {
        let now = 1_700_000_000;
        assert_eq!(compute_trial_end("weekly", now), now + 30 * DAY_SECS);
    }

    #[test]
    fn test_mirrored_status_uses_wire_form() {
        // Multi-word statuses must keep their underscore; the activation
        // gates and the deactivation match depend on the exact strings.
        assert_eq!(stripe::SubscriptionStatus::PastDue.as_str(), "past_due");
        assert_eq!(
            stripe::SubscriptionStatus::IncompleteExpired.as_str(),
            "incomplete_expired"
        );
        assert_eq!(stripe::SubscriptionStatus::Active.as_str(), "active");
        assert_eq!(stripe::SubscriptionStatus::Canceled.as_str(), "canceled");
    }
}
