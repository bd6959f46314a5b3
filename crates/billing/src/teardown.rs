//! Teardown saga
//!
//! Cancelling a site means touching two stores that share no transaction:
//! the relational mirror and Stripe. The saga snapshots the affected rows,
//! applies the local deactivation optimistically, then asks Stripe to cancel
//! at period end. A Stripe failure restores the snapshot verbatim; a success
//! records an idempotency marker so a retried teardown returns the cached
//! outcome instead of repeating the billing-side cancellation.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use keymint_shared::License;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::license::LicenseService;
use crate::retry::IdempotencyStore;
use crate::subscriptions::SubscriptionService;

const TEARDOWN_OPERATION: &str = "teardown";

/// Result of a completed teardown, also the shape cached for idempotent
/// replays
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeardownOutcome {
    pub license_key: String,
    pub site_domain: Option<String>,
    pub subscription_id: String,
    pub cancel_at_period_end: bool,
    /// True when this response was served from the idempotency store
    #[serde(default)]
    pub already_completed: bool,
}

/// Pre-mutation snapshot of every row the saga touches. Restoring it puts
/// the relational store back exactly as it was.
#[derive(Debug)]
struct TeardownSnapshot {
    license_key: String,
    license_status: String,
    items: Vec<ItemSnapshot>,
    sites: Vec<SiteSnapshot>,
}

#[derive(Debug)]
struct ItemSnapshot {
    id: Uuid,
    status: String,
    removed_at: Option<OffsetDateTime>,
}

#[derive(Debug)]
struct SiteSnapshot {
    id: Uuid,
    status: String,
}

/// Service running the teardown saga
#[derive(Clone)]
pub struct TeardownService {
    pool: PgPool,
    licenses: LicenseService,
    subscriptions: SubscriptionService,
    events: BillingEventLogger,
}

impl TeardownService {
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

    /// Tear down the site behind a license: deactivate its local rows and
    /// cancel the backing subscription at period end.
    pub async fn remove_site(
        &self,
        license_key: &str,
        caller_customer_id: Option<&str>,
    ) -> BillingResult<TeardownOutcome> {
        let idempotency = IdempotencyStore::new(self.pool.clone());
        let op_key = IdempotencyStore::key(TEARDOWN_OPERATION, license_key);

        if let Some(cached) = idempotency.check(&op_key).await? {
            if let Ok(mut outcome) = serde_json::from_value::<TeardownOutcome>(cached) {
                tracing::info!(
                    license_key = %license_key,
                    "Teardown already completed - returning cached outcome"
                );
                outcome.already_completed = true;
                return Ok(outcome);
            }
        }

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

        let site_domain = license
            .used_site_domain
            .clone()
            .or_else(|| license.site_domain.clone());

        let snapshot = self.capture_snapshot(&license, site_domain.as_deref()).await?;

        self.apply_local_deactivation(&license, site_domain.as_deref())
            .await?;

        // Billing side last: a failure here rolls the local rows back, a
        // failure earlier has cost nothing on the Stripe side.
        let cancelled = self
            .subscriptions
            .cancel_at_period_end(&license.stripe_subscription_id)
            .await;

        let subscription = match cancelled {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::error!(
                    license_key = %license_key,
                    subscription_id = %license.stripe_subscription_id,
                    error = %e,
                    "Billing-side cancel failed - rolling back local deactivation"
                );
                self.restore_snapshot(&snapshot).await;
                self.log_event_quiet(
                    BillingEventBuilder::new(BillingEventType::TeardownRolledBack)
                        .customer(&license.customer_id)
                        .license(license_key)
                        .stripe_subscription(&license.stripe_subscription_id)
                        .data(serde_json::json!({"error": e.to_string()})),
                )
                .await;
                return Err(e);
            }
        };

        // Authoritative response wins over the optimistic local flags
        self.subscriptions.sync_subscription_to_db(&subscription).await?;

        let outcome = TeardownOutcome {
            license_key: license_key.to_string(),
            site_domain,
            subscription_id: license.stripe_subscription_id.clone(),
            cancel_at_period_end: subscription.cancel_at_period_end,
            already_completed: false,
        };

        match serde_json::to_value(&outcome) {
            Ok(value) => {
                if let Err(e) = idempotency.record(&op_key, &value).await {
                    tracing::warn!(error = %e, "Failed to record teardown idempotency marker");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize teardown outcome");
            }
        }

        self.log_event_quiet(
            BillingEventBuilder::new(BillingEventType::TeardownCompleted)
                .customer(&license.customer_id)
                .license(license_key)
                .stripe_subscription(&license.stripe_subscription_id)
                .actor_type(ActorType::User)
                .data(serde_json::json!({"site_domain": outcome.site_domain})),
        )
        .await;

        tracing::info!(
            license_key = %license_key,
            subscription_id = %outcome.subscription_id,
            site_domain = ?outcome.site_domain,
            "Teardown completed"
        );

        Ok(outcome)
    }

    /// Capture the pre-mutation state of every row the saga will touch
    async fn capture_snapshot(
        &self,
        license: &License,
        site_domain: Option<&str>,
    ) -> BillingResult<TeardownSnapshot> {
        let items: Vec<(Uuid, String, Option<OffsetDateTime>)> = sqlx::query_as(
            r#"
            SELECT id, status, removed_at FROM subscription_items
            WHERE stripe_subscription_id = $1
              AND ($2::TEXT IS NULL OR site_domain = $2)
            "#,
        )
        .bind(&license.stripe_subscription_id)
        .bind(site_domain)
        .fetch_all(&self.pool)
        .await?;

        let sites: Vec<(Uuid, String)> =
            sqlx::query_as("SELECT id, status FROM sites WHERE license_key = $1")
                .bind(&license.license_key)
                .fetch_all(&self.pool)
                .await?;

        Ok(TeardownSnapshot {
            license_key: license.license_key.clone(),
            license_status: license.status.as_str().to_string(),
            items: items
                .into_iter()
                .map(|(id, status, removed_at)| ItemSnapshot {
                    id,
                    status,
                    removed_at,
                })
                .collect(),
            sites: sites
                .into_iter()
                .map(|(id, status)| SiteSnapshot { id, status })
                .collect(),
        })
    }

    /// Optimistically deactivate the local rows before touching Stripe
    async fn apply_local_deactivation(
        &self,
        license: &License,
        site_domain: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscription_items
            SET status = 'inactive', removed_at = NOW()
            WHERE stripe_subscription_id = $1
              AND ($2::TEXT IS NULL OR site_domain = $2)
            "#,
        )
        .bind(&license.stripe_subscription_id)
        .bind(site_domain)
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE sites SET status = 'inactive', updated_at = NOW() WHERE license_key = $1")
            .bind(&license.license_key)
            .execute(&self.pool)
            .await?;

        self.licenses
            .set_status(&license.license_key, keymint_shared::LicenseStatus::Inactive)
            .await?;

        Ok(())
    }

    /// Restore the snapshot verbatim. Best-effort: a restore failure is
    /// logged loudly but cannot itself be rolled back.
    async fn restore_snapshot(&self, snapshot: &TeardownSnapshot) {
        for item in &snapshot.items {
            let restored = sqlx::query(
                "UPDATE subscription_items SET status = $2, removed_at = $3 WHERE id = $1",
            )
            .bind(item.id)
            .bind(&item.status)
            .bind(item.removed_at)
            .execute(&self.pool)
            .await;
            if let Err(e) = restored {
                tracing::error!(item_id = %item.id, error = %e, "Snapshot restore failed for item");
            }
        }

        for site in &snapshot.sites {
            let restored =
                sqlx::query("UPDATE sites SET status = $2, updated_at = NOW() WHERE id = $1")
                    .bind(site.id)
                    .bind(&site.status)
                    .execute(&self.pool)
                    .await;
            if let Err(e) = restored {
                tracing::error!(site_id = %site.id, error = %e, "Snapshot restore failed for site");
            }
        }

        let restored = sqlx::query(
            "UPDATE licenses SET status = $2, updated_at = NOW() WHERE license_key = $1",
        )
        .bind(&snapshot.license_key)
        .bind(&snapshot.license_status)
        .execute(&self.pool)
        .await;
        if let Err(e) = restored {
            tracing::error!(
                license_key = %snapshot.license_key,
                error = %e,
                "Snapshot restore failed for license"
            );
        }
    }

    async fn log_event_quiet(&self, builder: BillingEventBuilder) {
        if let Err(e) = self.events.log_event(builder).await {
            tracing::warn!(error = %e, "Failed to write billing event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_round_trips_through_idempotency_cache() {
        let outcome = TeardownOutcome {
            license_key: "KM-ABC".into(),
            site_domain: Some("a.example.com".into()),
            subscription_id: "sub_1".into(),
            cancel_at_period_end: true,
            already_completed: false,
        };
        let value = serde_json::to_value(&outcome).unwrap();
        let replayed: TeardownOutcome = serde_json::from_value(value).unwrap();
        assert_eq!(replayed.license_key, "KM-ABC");
        assert!(replayed.cancel_at_period_end);
        assert!(!replayed.already_completed);
    }

    #[test]
    fn test_operation_key_shape() {
        assert_eq!(
            IdempotencyStore::key(TEARDOWN_OPERATION, "KM-ABC"),
            "teardown:KM-ABC"
        );
    }
}
