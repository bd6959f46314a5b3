//! License activation and site binding
//!
//! Binds a license key to a site domain, gated on subscription health.
//! Rebinding overwrites the previous domain and is reported to the caller;
//! the same domain twice is a state-wise no-op. Deactivation of a quantity
//! unit cancels its dedicated subscription at period end; site-bound
//! licenses go through the teardown saga instead.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use keymint_shared::{License, SubscriptionRecord};

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::license::LicenseService;
use crate::subscriptions::SubscriptionService;

/// Successful activation response
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActivationOutcome {
    pub license_key: String,
    pub site_domain: String,
    /// Domain the license was bound to before this call, if any
    pub previous_site: Option<String>,
    /// True when this call replaced an existing binding
    pub was_update: bool,
}

/// Service binding licenses to sites
#[derive(Clone)]
pub struct ActivationService {
    pool: PgPool,
    licenses: LicenseService,
    subscriptions: SubscriptionService,
    events: BillingEventLogger,
}

impl ActivationService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let licenses = LicenseService::new(pool.clone());
        let subscriptions = SubscriptionService::new(stripe, pool.clone());
        let events = BillingEventLogger::new(pool.clone());
        Self {
            pool,
            licenses,
            subscriptions,
            events,
        }
    }

    /// Swap in a cache-backed license service
    pub fn with_licenses(mut self, licenses: LicenseService) -> Self {
        self.licenses = licenses;
        self
    }

    /// Activate a license against a site domain.
    ///
    /// `caller_customer_id`, when present, must match the license owner.
    /// The subscription gates run against the local mirror, falling back to
    /// a live Stripe lookup when no mirror row exists.
    pub async fn activate(
        &self,
        license_key: &str,
        site_domain: &str,
        caller_customer_id: Option<&str>,
    ) -> BillingResult<ActivationOutcome> {
        let license = self
            .licenses
            .get_by_key(license_key)
            .await?
            .ok_or_else(|| BillingError::LicenseNotFound(license_key.to_string()))?;

        if let Some(caller) = caller_customer_id {
            if caller != license.customer_id {
                tracing::warn!(
                    license_key = %license_key,
                    caller = %caller,
                    "Activation attempt by non-owner"
                );
                return Err(BillingError::Unauthorized);
            }
        }

        self.check_subscription_health(&license).await?;

        // Same domain twice is a no-op state-wise, but still reported
        // faithfully so callers can distinguish rebinds.
        let previous = self.licenses.bind_site(license_key, site_domain).await?;
        let was_update = previous
            .as_deref()
            .map(|p| p != site_domain)
            .unwrap_or(false);

        self.upsert_site(&license.customer_id, site_domain, license_key)
            .await?;

        if previous.as_deref() == Some(site_domain) {
            tracing::info!(
                license_key = %license_key,
                site_domain = %site_domain,
                "License re-activated against same domain"
            );
        } else {
            tracing::info!(
                license_key = %license_key,
                site_domain = %site_domain,
                previous_site = ?previous,
                was_update,
                "License activated"
            );
            // No uniqueness constraint on bound domains: the same domain can
            // legitimately appear on multiple licenses, so only note it.
            if let Ok(others) = self.other_licenses_on_domain(license_key, site_domain).await {
                if others > 0 {
                    tracing::info!(
                        site_domain = %site_domain,
                        other_licenses = others,
                        "Domain is also bound to other licenses"
                    );
                }
            }
        }

        if let Err(e) = self
            .events
            .log_event(
                BillingEventBuilder::new(BillingEventType::SiteActivated)
                    .customer(&license.customer_id)
                    .license(license_key)
                    .actor_type(ActorType::User)
                    .data(serde_json::json!({
                        "site_domain": site_domain,
                        "previous_site": previous,
                        "was_update": was_update,
                    })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log activation event");
        }

        Ok(ActivationOutcome {
            license_key: license_key.to_string(),
            site_domain: site_domain.to_string(),
            previous_site: previous,
            was_update,
        })
    }

    /// Deactivate a quantity unit: cancel its dedicated subscription at
    /// period end. Site-bound licenses must use the teardown path, which
    /// also cleans up the site binding.
    pub async fn deactivate(
        &self,
        license_key: &str,
        caller_customer_id: Option<&str>,
    ) -> BillingResult<()> {
        let license = self
            .licenses
            .get_by_key(license_key)
            .await?
            .ok_or_else(|| BillingError::LicenseNotFound(license_key.to_string()))?;

        if let Some(caller) = caller_customer_id {
            if caller != license.customer_id {
                return Err(BillingError::Unauthorized);
            }
        }

        if license.site_domain.is_some() {
            return Err(BillingError::SiteBoundLicense);
        }

        let subscription = self
            .subscriptions
            .cancel_at_period_end(&license.stripe_subscription_id)
            .await?;
        self.subscriptions.sync_subscription_to_db(&subscription).await?;

        if let Err(e) = self
            .events
            .log_event(
                BillingEventBuilder::new(BillingEventType::SiteDeactivated)
                    .customer(&license.customer_id)
                    .license(license_key)
                    .stripe_subscription(&license.stripe_subscription_id)
                    .actor_type(ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log deactivation event");
        }

        Ok(())
    }

    /// Run the subscription gates for a license.
    ///
    /// Gate order: period lapsed, scheduled cancellation, then liveness.
    async fn check_subscription_health(&self, license: &License) -> BillingResult<()> {
        let record = match self
            .subscriptions
            .get_record(&license.stripe_subscription_id)
            .await?
        {
            Some(record) => record,
            None => {
                // No local mirror: fall back to Stripe directly and repair
                // the mirror while we are here.
                tracing::warn!(
                    subscription_id = %license.stripe_subscription_id,
                    "No local subscription mirror - checking Stripe directly"
                );
                let subscription = self
                    .subscriptions
                    .retrieve(&license.stripe_subscription_id)
                    .await
                    .map_err(|_| {
                        BillingError::SubscriptionNotFound(
                            license.stripe_subscription_id.clone(),
                        )
                    })?;
                self.subscriptions.sync_subscription_to_db(&subscription).await?;
                self.subscriptions
                    .get_record(&license.stripe_subscription_id)
                    .await?
                    .ok_or_else(|| {
                        BillingError::SubscriptionNotFound(
                            license.stripe_subscription_id.clone(),
                        )
                    })?
            }
        };

        Self::gate(&record)
    }

    fn gate(record: &SubscriptionRecord) -> BillingResult<()> {
        if record.current_period_end < OffsetDateTime::now_utc() {
            return Err(BillingError::SubscriptionEnded);
        }
        if record.cancel_at_period_end {
            return Err(BillingError::SubscriptionCancelled);
        }
        if !record.is_usable() {
            return Err(BillingError::SubscriptionInactive);
        }
        Ok(())
    }

    async fn upsert_site(
        &self,
        customer_id: &str,
        site_domain: &str,
        license_key: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sites (id, customer_id, site_domain, license_key, status)
            VALUES ($1, $2, $3, $4, 'active')
            ON CONFLICT (license_key) DO UPDATE SET
                site_domain = EXCLUDED.site_domain,
                status = 'active',
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(customer_id)
        .bind(site_domain)
        .bind(license_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn other_licenses_on_domain(
        &self,
        license_key: &str,
        site_domain: &str,
    ) -> BillingResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM licenses
            WHERE used_site_domain = $1 AND license_key <> $2 AND status = 'active'
            "#,
        )
        .bind(site_domain)
        .bind(license_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: &str, cancel: bool, period_end_offset_secs: i64) -> SubscriptionRecord {
        let now = OffsetDateTime::now_utc();
        SubscriptionRecord {
            id: Uuid::new_v4(),
            stripe_subscription_id: "sub_1".into(),
            customer_id: "cus_1".into(),
            status: status.into(),
            cancel_at_period_end: cancel,
            current_period_start: now - time::Duration::days(10),
            current_period_end: now + time::Duration::seconds(period_end_offset_secs),
            billing_period: "month".into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_gate_passes_healthy_subscription() {
        assert!(ActivationService::gate(&record("active", false, 86_400)).is_ok());
        assert!(ActivationService::gate(&record("trialing", false, 86_400)).is_ok());
    }

    #[test]
    fn test_gate_rejects_lapsed_period() {
        let err = ActivationService::gate(&record("active", false, -60)).unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionEnded));
    }

    #[test]
    fn test_gate_rejects_scheduled_cancellation() {
        let err = ActivationService::gate(&record("active", true, 86_400)).unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionCancelled));
    }

    #[test]
    fn test_gate_rejects_inactive_status() {
        let err = ActivationService::gate(&record("past_due", false, 86_400)).unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionInactive));

        let err = ActivationService::gate(&record("canceled", false, 86_400)).unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionInactive));
    }

    #[test]
    fn test_gate_order_lapsed_beats_cancelled() {
        // A lapsed, cancel-scheduled subscription reports the lapse
        let err = ActivationService::gate(&record("active", true, -60)).unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionEnded));
    }
}
