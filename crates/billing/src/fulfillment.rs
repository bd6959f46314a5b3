//! Fulfillment orchestrator
//!
//! Turns a classified checkout into billing subscriptions, license rows,
//! payment history and cache state. Site purchases bind licenses to named
//! sites and can merge into an existing subscription; quantity purchases
//! provision one subscription per unit, switching to the deferred queue
//! above the configured threshold.
//!
//! Billing-side success is never rolled back for a local persistence
//! failure: those are logged as reconciliation items and corrected
//! asynchronously.

use std::time::Duration;

use sqlx::PgPool;
use stripe::{
    AttachPaymentMethod, Customer, CustomerId, CustomerInvoiceSettings, Expandable, Invoice,
    PaymentMethod, PaymentMethodId, UpdateCustomer,
};
use time::OffsetDateTime;
use uuid::Uuid;

use keymint_shared::{PurchaseType, QueueItem};

use crate::client::{FulfillmentConfig, StripeClient};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::license::{LicenseService, NewLicense};
use crate::queue::{NewQueueItem, ProvisioningQueue};
use crate::retry::{with_backoff, with_backoff_attempts};
use crate::subscriptions::{compute_trial_end, SubscriptionService};

/// Upper bound on units in one purchase. The quantity arrives through
/// checkout metadata written by the purchase origin, so a runaway value
/// must not turn into thousands of subscription creations.
const MAX_UNITS_PER_PURCHASE: i64 = 500;

/// Sequential batch pacing for multi-unit provisioning.
///
/// Units are processed in small batches with a pause in between so one large
/// purchase does not trip Stripe's rate limits. Never fanned out in
/// parallel: per-unit bookkeeping stays on one [`FulfillmentContext`].
#[derive(Debug, Clone)]
pub struct BatchScheduler {
    batch_size: usize,
    inter_batch_delay: Duration,
}

impl BatchScheduler {
    pub fn from_config(config: &FulfillmentConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            inter_batch_delay: Duration::from_millis(config.inter_batch_delay_ms),
        }
    }

    /// Split the work into sequential batches
    pub fn batches<'a, T>(&self, items: &'a [T]) -> std::slice::Chunks<'a, T> {
        items.chunks(self.batch_size)
    }

    /// Pause between batches
    pub async fn pause(&self) {
        if !self.inter_batch_delay.is_zero() {
            tokio::time::sleep(self.inter_batch_delay).await;
        }
    }
}

/// One unit that could not be provisioned in-line
#[derive(Debug, Clone, serde::Serialize)]
pub struct FailedUnit {
    pub license_key: String,
    pub error: String,
}

/// Per-run bookkeeping for a multi-unit fulfillment.
///
/// Threaded explicitly through the batch loop. Every unit ends up in exactly
/// one of the three buckets, which `assert_reconciled` enforces before the
/// run reports success.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FulfillmentContext {
    pub total: usize,
    pub completed: Vec<String>,
    pub queued: Vec<String>,
    pub failed: Vec<FailedUnit>,
}

impl FulfillmentContext {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: Vec::new(),
            queued: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn record_completed(&mut self, license_key: impl Into<String>) {
        self.completed.push(license_key.into());
    }

    pub fn record_queued(&mut self, license_key: impl Into<String>) {
        self.queued.push(license_key.into());
    }

    pub fn record_failed(&mut self, license_key: impl Into<String>, error: impl Into<String>) {
        self.failed.push(FailedUnit {
            license_key: license_key.into(),
            error: error.into(),
        });
    }

    /// Every unit must be accounted for: total = completed + queued + failed
    pub fn assert_reconciled(&self) -> BillingResult<()> {
        let accounted = self.completed.len() + self.queued.len() + self.failed.len();
        if accounted != self.total {
            return Err(BillingError::DataInconsistency(format!(
                "Unit accounting mismatch: {} total vs {} completed + {} queued + {} failed",
                self.total,
                self.completed.len(),
                self.queued.len(),
                self.failed.len()
            )));
        }
        Ok(())
    }
}

/// One priced line of a site-purchase checkout
#[derive(Debug, Clone)]
pub struct SiteLineItem {
    pub price_id: String,
    /// Site domain from the line item's own metadata, when present
    pub metadata_site_domain: Option<String>,
    pub amount_cents: Option<i64>,
}

/// Inputs for a site-purchase fulfillment, extracted from the checkout event
#[derive(Debug, Clone)]
pub struct SiteCheckout {
    pub customer_id: String,
    /// The subscription the checkout created
    pub subscription_id: String,
    pub payment_intent_id: Option<String>,
    pub line_items: Vec<SiteLineItem>,
    /// Site domain from checkout-session metadata
    pub session_site_domain: Option<String>,
    /// Site domain typed into a custom checkout form field
    pub custom_field_site_domain: Option<String>,
}

/// Inputs for a quantity-purchase fulfillment
#[derive(Debug, Clone)]
pub struct QuantityCheckout {
    pub customer_id: String,
    pub payment_intent_id: String,
    /// Payment method used at checkout; must be attached before any
    /// subscription is created
    pub payment_method_id: Option<String>,
    pub quantity: i64,
    /// Pre-generated license keys from metadata, if the origin supplied them
    pub license_keys: Vec<String>,
    /// Billing interval of the purchased price ("month" / "year")
    pub billing_interval: String,
    /// Checkout total, used to derive the per-unit payment amount
    pub amount_total_cents: Option<i64>,
}

/// Result of a site-purchase fulfillment
#[derive(Debug, Clone, serde::Serialize)]
pub struct SiteFulfillmentOutcome {
    /// Subscription the items ended up on (the existing one after a merge)
    pub subscription_id: String,
    pub merged_into_existing: bool,
    pub licenses_created: Vec<String>,
}

/// Report from one queue-drain pass
#[derive(Debug, Default, serde::Serialize)]
pub struct QueueSweepReport {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

/// The fulfillment orchestrator
#[derive(Clone)]
pub struct FulfillmentService {
    stripe: StripeClient,
    pool: PgPool,
    licenses: LicenseService,
    subscriptions: SubscriptionService,
    queue: ProvisioningQueue,
    events: BillingEventLogger,
    scheduler: BatchScheduler,
    config: FulfillmentConfig,
}

impl FulfillmentService {
    pub fn new(stripe: StripeClient, pool: PgPool, config: FulfillmentConfig) -> Self {
        let licenses = LicenseService::new(pool.clone());
        let subscriptions = SubscriptionService::new(stripe.clone(), pool.clone());
        let queue = ProvisioningQueue::new(pool.clone(), config.max_queue_attempts as u32);
        let events = BillingEventLogger::new(pool.clone());
        let scheduler = BatchScheduler::from_config(&config);
        Self {
            stripe,
            pool,
            licenses,
            subscriptions,
            queue,
            events,
            scheduler,
            config,
        }
    }

    /// Swap in a cache-backed license service
    pub fn with_licenses(mut self, licenses: LicenseService) -> Self {
        self.licenses = licenses;
        self
    }

    pub fn queue(&self) -> &ProvisioningQueue {
        &self.queue
    }

    // ---- Site purchase ---------------------------------------------------

    /// Fulfill a site purchase: sync the subscription, merge into an
    /// existing subscription when one is already active, issue one license
    /// per site, clear pending-site entries.
    pub async fn fulfill_site_purchase(
        &self,
        checkout: &SiteCheckout,
    ) -> BillingResult<SiteFulfillmentOutcome> {
        let subscription = self.subscriptions.retrieve(&checkout.subscription_id).await?;
        self.subscriptions.sync_subscription_to_db(&subscription).await?;

        // Merge path: the customer already has an active subscription, so the
        // checkout was only meant to add items to it. Create the items there
        // with proration and cancel the duplicate to avoid double-billing.
        let existing = self
            .subscriptions
            .find_active_for_customer(&checkout.customer_id, Some(&checkout.subscription_id))
            .await?;

        let (target_subscription_id, merged) = match existing {
            Some(record) => {
                for (index, item) in checkout.line_items.iter().enumerate() {
                    let site_domain = self.resolve_site_name(checkout, item, index).await;
                    self.subscriptions
                        .add_item_with_proration(
                            &record.stripe_subscription_id,
                            &item.price_id,
                            Some(&site_domain),
                        )
                        .await?;
                }
                self.subscriptions.cancel_now(&checkout.subscription_id).await?;
                let merged_into = self.subscriptions.retrieve(&record.stripe_subscription_id).await?;
                self.subscriptions.sync_subscription_to_db(&merged_into).await?;
                (record.stripe_subscription_id, true)
            }
            None => (checkout.subscription_id.clone(), false),
        };

        let mut licenses_created = Vec::new();
        for (index, item) in checkout.line_items.iter().enumerate() {
            let site_domain = self.resolve_site_name(checkout, item, index).await;

            if self
                .licenses
                .exists_for_site(&checkout.customer_id, &site_domain)
                .await?
            {
                tracing::info!(
                    customer_id = %checkout.customer_id,
                    site_domain = %site_domain,
                    "License already exists for site - skipping issuance"
                );
            } else {
                let license_key = self.licenses.mint_unique_key().await?;
                let created = self
                    .licenses
                    .create_license(&NewLicense {
                        license_key: license_key.clone(),
                        customer_id: checkout.customer_id.clone(),
                        stripe_subscription_id: target_subscription_id.clone(),
                        stripe_item_id: None,
                        site_domain: Some(site_domain.clone()),
                        purchase_type: PurchaseType::Site,
                    })
                    .await?;
                if created {
                    self.record_payment(
                        &checkout.customer_id,
                        Some(&target_subscription_id),
                        checkout.payment_intent_id.as_deref(),
                        Some(&license_key),
                        Some(&site_domain),
                        item.amount_cents.unwrap_or(0),
                    )
                    .await?;
                    self.log_license_issued(
                        &checkout.customer_id,
                        &target_subscription_id,
                        &license_key,
                        serde_json::json!({"site_domain": site_domain, "purchase_type": "site"}),
                    )
                    .await;
                    licenses_created.push(license_key);
                }
            }

            self.remove_pending_site(&checkout.customer_id, &site_domain)
                .await?;
        }

        tracing::info!(
            customer_id = %checkout.customer_id,
            subscription_id = %target_subscription_id,
            merged,
            licenses = licenses_created.len(),
            "Site purchase fulfilled"
        );

        Ok(SiteFulfillmentOutcome {
            subscription_id: target_subscription_id,
            merged_into_existing: merged,
            licenses_created,
        })
    }

    /// Resolve a line item's real site name.
    ///
    /// Precedence: item metadata, session metadata, custom checkout form
    /// field, the customer's most recent payment record, then a placeholder.
    async fn resolve_site_name(
        &self,
        checkout: &SiteCheckout,
        item: &SiteLineItem,
        index: usize,
    ) -> String {
        let non_empty = |s: &Option<String>| {
            s.as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };

        if let Some(domain) = non_empty(&item.metadata_site_domain) {
            return domain;
        }
        if let Some(domain) = non_empty(&checkout.session_site_domain) {
            return domain;
        }
        if let Some(domain) = non_empty(&checkout.custom_field_site_domain) {
            return domain;
        }
        if let Some(domain) = self.last_paid_site_domain(&checkout.customer_id).await {
            return domain;
        }

        let placeholder = format!("pending-site-{}", index + 1);
        tracing::warn!(
            customer_id = %checkout.customer_id,
            placeholder = %placeholder,
            "No site name found in any source - using placeholder"
        );
        placeholder
    }

    /// The most recent site domain this customer paid for, if any
    async fn last_paid_site_domain(&self, customer_id: &str) -> Option<String> {
        let row: Result<Option<(String,)>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT site_domain FROM payments
            WHERE customer_id = $1 AND site_domain IS NOT NULL
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(row) => row.map(|(domain,)| domain),
            Err(e) => {
                tracing::warn!(error = %e, "Prior payment lookup failed");
                None
            }
        }
    }

    async fn remove_pending_site(
        &self,
        customer_id: &str,
        site_domain: &str,
    ) -> BillingResult<()> {
        let removed = sqlx::query(
            "DELETE FROM pending_sites WHERE customer_id = $1 AND site_domain = $2",
        )
        .bind(customer_id)
        .bind(site_domain)
        .execute(&self.pool)
        .await?;

        if removed.rows_affected() > 0 {
            tracing::debug!(
                customer_id = %customer_id,
                site_domain = %site_domain,
                "Removed pending site entry"
            );
        }
        Ok(())
    }

    // ---- Quantity purchase -----------------------------------------------

    /// Fulfill a quantity purchase: one subscription per unit.
    ///
    /// The payment method is attached to the customer before any
    /// subscription is created; if that fails nothing is provisioned.
    /// Above the queue threshold only a bounded prefix is attempted
    /// in-line and the rest goes to the deferred queue.
    pub async fn fulfill_quantity_purchase(
        &self,
        checkout: &QuantityCheckout,
    ) -> BillingResult<FulfillmentContext> {
        if checkout.quantity < 1 || checkout.quantity > MAX_UNITS_PER_PURCHASE {
            return Err(BillingError::InvalidQuantity(checkout.quantity));
        }
        let quantity = checkout.quantity as usize;

        self.attach_default_payment_method(checkout).await?;

        let license_keys = self.resolve_unit_keys(checkout, quantity).await?;
        let trial_end =
            compute_trial_end(&checkout.billing_interval, OffsetDateTime::now_utc().unix_timestamp());
        let unit_amount = checkout
            .amount_total_cents
            .map(|total| total / checkout.quantity.max(1));

        let mut ctx = FulfillmentContext::new(quantity);

        let (inline_keys, deferred_keys) = if quantity > self.config.queue_threshold {
            license_keys.split_at(self.config.immediate_batch.min(quantity))
        } else {
            license_keys.split_at(quantity)
        };

        // Queue the overflow up front so nothing is lost to the request's
        // time budget, then work through the in-line prefix in batches.
        for key in deferred_keys {
            self.queue
                .enqueue(&NewQueueItem {
                    customer_id: checkout.customer_id.clone(),
                    payment_intent_id: checkout.payment_intent_id.clone(),
                    license_key: key.clone(),
                    price_id: self.stripe.config().unit_price_id.clone(),
                    trial_end: Some(trial_end),
                })
                .await?;
            ctx.record_queued(key.clone());
            self.log_event_quiet(
                BillingEventBuilder::new(BillingEventType::QueueItemEnqueued)
                    .customer(&checkout.customer_id)
                    .license(key.clone())
                    .data(serde_json::json!({
                        "payment_intent_id": checkout.payment_intent_id,
                    })),
            )
            .await;
        }

        let mut batches = self.scheduler.batches(inline_keys).peekable();
        while let Some(batch) = batches.next() {
            for key in batch {
                match self
                    .provision_unit(
                        &checkout.customer_id,
                        key,
                        trial_end,
                        &checkout.payment_intent_id,
                        unit_amount,
                    )
                    .await
                {
                    Ok(_) => ctx.record_completed(key.clone()),
                    Err(e) => {
                        // Track the failure as a terminal queue row so the
                        // refund sweep compensates it after the grace window.
                        self.record_inline_failure(checkout, key, trial_end, &e).await;
                        ctx.record_failed(key.clone(), e.to_string());
                    }
                }
            }
            if batches.peek().is_some() {
                self.scheduler.pause().await;
            }
        }

        ctx.assert_reconciled()?;

        tracing::info!(
            customer_id = %checkout.customer_id,
            payment_intent_id = %checkout.payment_intent_id,
            total = ctx.total,
            completed = ctx.completed.len(),
            queued = ctx.queued.len(),
            failed = ctx.failed.len(),
            "Quantity purchase fulfilled"
        );

        Ok(ctx)
    }

    /// Attach the checkout's payment method to the customer and make it the
    /// default. Subscription creation is skipped entirely when this fails:
    /// the units would otherwise have no payment method for renewal.
    async fn attach_default_payment_method(
        &self,
        checkout: &QuantityCheckout,
    ) -> BillingResult<()> {
        let pm_raw = checkout
            .payment_method_id
            .as_deref()
            .ok_or(BillingError::PaymentMethodRequired)?;

        let pm_id = pm_raw
            .parse::<PaymentMethodId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid payment method ID: {}", e)))?;
        let customer_id = checkout
            .customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        with_backoff("attach_payment_method", || {
            let pm_id = pm_id.clone();
            let customer_id = customer_id.clone();
            async move {
                PaymentMethod::attach(
                    self.stripe.inner(),
                    &pm_id,
                    AttachPaymentMethod {
                        customer: customer_id,
                    },
                )
                .await?;
                Ok(())
            }
        })
        .await?;

        with_backoff("set_default_payment_method", || {
            let customer_id = customer_id.clone();
            let pm_raw = pm_raw.to_string();
            async move {
                let mut params = UpdateCustomer::new();
                params.invoice_settings = Some(CustomerInvoiceSettings {
                    default_payment_method: Some(pm_raw),
                    ..Default::default()
                });
                Customer::update(self.stripe.inner(), &customer_id, params).await?;
                Ok(())
            }
        })
        .await?;

        tracing::info!(
            customer_id = %checkout.customer_id,
            payment_method_id = %pm_raw,
            "Attached default payment method"
        );
        Ok(())
    }

    /// Use the pre-generated keys from metadata, minting extras when the
    /// origin supplied fewer than the unit count
    async fn resolve_unit_keys(
        &self,
        checkout: &QuantityCheckout,
        quantity: usize,
    ) -> BillingResult<Vec<String>> {
        let mut keys: Vec<String> =
            checkout.license_keys.iter().take(quantity).cloned().collect();
        while keys.len() < quantity {
            keys.push(self.licenses.mint_unique_key().await?);
        }
        Ok(keys)
    }

    /// Provision one quantity unit: create its dedicated subscription, then
    /// persist the license and payment rows.
    ///
    /// Persistence runs under the retry kernel; when it still fails the
    /// billing-side success is kept and the shortfall is logged as a
    /// reconciliation item, never rolled back.
    async fn provision_unit(
        &self,
        customer_id: &str,
        license_key: &str,
        trial_end: i64,
        payment_intent_id: &str,
        unit_amount_cents: Option<i64>,
    ) -> BillingResult<String> {
        // A unit re-run after a stuck-claim takeover or queue recovery may
        // already be fully provisioned; a second subscription would bill
        // the customer twice for the same unit.
        if let Some(existing) = self.licenses.get_by_key(license_key).await? {
            tracing::info!(
                customer_id = %customer_id,
                license_key = %license_key,
                subscription_id = %existing.stripe_subscription_id,
                "License already provisioned - skipping subscription creation"
            );
            return Ok(existing.stripe_subscription_id);
        }

        let price_id = self.stripe.config().unit_price_id.clone();

        let subscription = with_backoff("create_unit_subscription", || {
            let price_id = price_id.clone();
            async move {
                self.subscriptions
                    .create_unit_subscription(customer_id, &price_id, license_key, trial_end, None)
                    .await
            }
        })
        .await?;

        self.refund_unexpected_invoice(&subscription, payment_intent_id)
            .await;

        let subscription_id = subscription.id.to_string();
        let persisted = with_backoff_attempts("persist_unit", self.config.persistence_retries, || {
            let subscription = subscription.clone();
            let subscription_id = subscription_id.clone();
            async move {
                self.subscriptions.sync_subscription_to_db(&subscription).await?;
                self.licenses
                    .create_license(&NewLicense {
                        license_key: license_key.to_string(),
                        customer_id: customer_id.to_string(),
                        stripe_subscription_id: subscription_id.clone(),
                        stripe_item_id: None,
                        site_domain: None,
                        purchase_type: PurchaseType::Quantity,
                    })
                    .await?;
                self.record_payment(
                    customer_id,
                    Some(&subscription_id),
                    Some(payment_intent_id),
                    Some(license_key),
                    None,
                    unit_amount_cents.unwrap_or(0),
                )
                .await?;
                Ok(())
            }
        })
        .await;

        match persisted {
            Ok(()) => {
                self.log_license_issued(
                    customer_id,
                    &subscription_id,
                    license_key,
                    serde_json::json!({"purchase_type": "quantity"}),
                )
                .await;
            }
            Err(e) => {
                // Billing succeeded; record for background reconciliation.
                tracing::error!(
                    customer_id = %customer_id,
                    subscription_id = %subscription_id,
                    license_key = %license_key,
                    error = %e,
                    "Persistence failed after billing success - queued for reconciliation"
                );
                self.log_event_quiet(
                    BillingEventBuilder::new(BillingEventType::LicenseIssued)
                        .customer(customer_id)
                        .stripe_subscription(subscription_id.clone())
                        .license(license_key)
                        .data(serde_json::json!({
                            "reconciliation_required": true,
                            "error": e.to_string(),
                        })),
                )
                .await;
            }
        }

        Ok(subscription_id)
    }

    /// If, despite the trial, Stripe auto-paid an invoice for the unit,
    /// refund it immediately: the unit was already covered by the one-time
    /// checkout payment.
    async fn refund_unexpected_invoice(
        &self,
        subscription: &stripe::Subscription,
        checkout_payment_intent: &str,
    ) {
        let invoice_id = match &subscription.latest_invoice {
            Some(Expandable::Id(id)) => id.clone(),
            Some(Expandable::Object(inv)) => inv.id.clone(),
            None => return,
        };

        let invoice = match Invoice::retrieve(self.stripe.inner(), &invoice_id, &[]).await {
            Ok(inv) => inv,
            Err(e) => {
                tracing::warn!(
                    invoice_id = %invoice_id,
                    error = %e,
                    "Could not inspect unit invoice"
                );
                return;
            }
        };

        let amount_paid = invoice.amount_paid.unwrap_or(0);
        if invoice.status != Some(stripe::InvoiceStatus::Paid) || amount_paid <= 0 {
            return;
        }

        let payment_intent_id = match &invoice.payment_intent {
            Some(Expandable::Id(id)) => id.clone(),
            Some(Expandable::Object(pi)) => pi.id.clone(),
            None => return,
        };

        tracing::warn!(
            subscription_id = %subscription.id,
            invoice_id = %invoice_id,
            amount_paid,
            "Unit invoice was auto-paid despite trial - refunding"
        );

        let mut params = stripe::CreateRefund::new();
        params.payment_intent = Some(payment_intent_id);
        params.amount = Some(amount_paid);
        match stripe::Refund::create(self.stripe.inner(), params).await {
            Ok(refund) => {
                tracing::info!(
                    refund_id = %refund.id,
                    invoice_id = %invoice_id,
                    checkout_payment_intent = %checkout_payment_intent,
                    "Refunded double-collected unit invoice"
                );
            }
            Err(e) => {
                tracing::error!(
                    invoice_id = %invoice_id,
                    error = %e,
                    "Failed to refund double-collected invoice"
                );
            }
        }
    }

    /// Persist an in-line failure as a terminal queue row so the refund
    /// sweep finds it after the grace window
    async fn record_inline_failure(
        &self,
        checkout: &QuantityCheckout,
        license_key: &str,
        trial_end: i64,
        error: &BillingError,
    ) {
        let enqueue = self
            .queue
            .enqueue(&NewQueueItem {
                customer_id: checkout.customer_id.clone(),
                payment_intent_id: checkout.payment_intent_id.clone(),
                license_key: license_key.to_string(),
                price_id: self.stripe.config().unit_price_id.clone(),
                trial_end: Some(trial_end),
            })
            .await;
        if let Err(e) = enqueue {
            tracing::error!(
                license_key = %license_key,
                error = %e,
                "Failed to record inline failure in queue"
            );
            return;
        }

        let fail = sqlx::query(
            r#"
            UPDATE provisioning_queue
            SET status = 'failed', attempts = $2, error_message = $3, updated_at = NOW()
            WHERE license_key = $1
            "#,
        )
        .bind(license_key)
        .bind(self.config.max_queue_attempts)
        .bind(error.to_string())
        .execute(&self.pool)
        .await;
        if let Err(e) = fail {
            tracing::error!(
                license_key = %license_key,
                error = %e,
                "Failed to mark inline failure as failed"
            );
        }

        self.log_event_quiet(
            BillingEventBuilder::new(BillingEventType::QueueItemFailed)
                .customer(&checkout.customer_id)
                .license(license_key)
                .data(serde_json::json!({
                    "payment_intent_id": checkout.payment_intent_id,
                    "error": error.to_string(),
                    "inline": true,
                })),
        )
        .await;
    }

    // ---- Queue drain -----------------------------------------------------

    /// Drain due queue items, provisioning each and updating its status.
    /// Runs outside the webhook request, so it is not bound by the
    /// per-request time budget.
    pub async fn drain_queue(&self, limit: i64) -> BillingResult<QueueSweepReport> {
        let items = self.queue.claim_due(limit).await?;
        let mut report = QueueSweepReport {
            claimed: items.len(),
            ..Default::default()
        };

        let mut batches = self.scheduler.batches(&items).peekable();
        while let Some(batch) = batches.next() {
            for item in batch {
                match self.provision_queued_item(item).await {
                    Ok(()) => report.completed += 1,
                    Err(status) => match status {
                        keymint_shared::QueueStatus::Failed => report.failed += 1,
                        _ => report.retried += 1,
                    },
                }
            }
            if batches.peek().is_some() {
                self.scheduler.pause().await;
            }
        }

        if report.claimed > 0 {
            tracing::info!(
                claimed = report.claimed,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                "Queue drain pass finished"
            );
        }
        Ok(report)
    }

    /// Provision one claimed queue item. On error returns the status the
    /// item was moved to (pending for a retry, failed at the attempt cap).
    async fn provision_queued_item(
        &self,
        item: &QueueItem,
    ) -> Result<(), keymint_shared::QueueStatus> {
        // A unit that waited past its own trial end gets a fresh monthly
        // trial window; the original was computed at enqueue time.
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let trial_end = match item.trial_end {
            Some(t) if t > now => t,
            _ => compute_trial_end("month", now),
        };

        let unit_amount = self.unit_amount_for_payment(&item.payment_intent_id).await;
        let result = self
            .provision_unit(
                &item.customer_id,
                &item.license_key,
                trial_end,
                &item.payment_intent_id,
                unit_amount,
            )
            .await;

        match result {
            Ok(_) => {
                if let Err(e) = self.queue.mark_completed(item.id).await {
                    tracing::error!(
                        queue_id = %item.id,
                        error = %e,
                        "Provisioned queue item but failed to mark completed"
                    );
                }
                self.log_event_quiet(
                    BillingEventBuilder::new(BillingEventType::QueueItemCompleted)
                        .customer(&item.customer_id)
                        .license(&item.license_key),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                let status = self
                    .queue
                    .mark_failed(item, &e.to_string())
                    .await
                    .unwrap_or(keymint_shared::QueueStatus::Pending);
                if status == keymint_shared::QueueStatus::Failed {
                    self.log_event_quiet(
                        BillingEventBuilder::new(BillingEventType::QueueItemFailed)
                            .customer(&item.customer_id)
                            .license(&item.license_key)
                            .data(serde_json::json!({"error": e.to_string()})),
                    )
                    .await;
                }
                Err(status)
            }
        }
    }

    /// Per-unit amount for a drained queue unit: the configured unit price,
    /// else the amount a sibling unit of the same payment already recorded.
    /// Unresolvable is logged, not fatal; the payment row then carries zero.
    async fn unit_amount_for_payment(&self, payment_intent_id: &str) -> Option<i64> {
        if let Some(configured) = self.stripe.config().unit_price_cents {
            return Some(configured);
        }

        let row: Result<Option<(i64,)>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT amount_cents FROM payments
            WHERE payment_intent_id = $1 AND amount_cents > 0
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(payment_intent_id)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(row) => row.map(|(amount,)| amount),
            Err(e) => {
                tracing::warn!(
                    payment_intent_id = %payment_intent_id,
                    error = %e,
                    "Sibling payment lookup failed"
                );
                None
            }
        }
    }

    // ---- Shared persistence helpers --------------------------------------

    async fn record_payment(
        &self,
        customer_id: &str,
        stripe_subscription_id: Option<&str>,
        payment_intent_id: Option<&str>,
        license_key: Option<&str>,
        site_domain: Option<&str>,
        amount_cents: i64,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments (
                id, customer_id, stripe_subscription_id, payment_intent_id,
                license_key, site_domain, amount_cents, currency, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'usd', 'succeeded')
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(customer_id)
        .bind(stripe_subscription_id)
        .bind(payment_intent_id)
        .bind(license_key)
        .bind(site_domain)
        .bind(amount_cents)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_license_issued(
        &self,
        customer_id: &str,
        subscription_id: &str,
        license_key: &str,
        data: serde_json::Value,
    ) {
        self.log_event_quiet(
            BillingEventBuilder::new(BillingEventType::LicenseIssued)
                .customer(customer_id)
                .stripe_subscription(subscription_id)
                .license(license_key)
                .actor_type(ActorType::Stripe)
                .data(data),
        )
        .await;
    }

    /// Audit logging never fails the fulfillment it describes
    async fn log_event_quiet(&self, builder: BillingEventBuilder) {
        if let Err(e) = self.events.log_event(builder).await {
            tracing::warn!(error = %e, "Failed to write billing event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StripeConfig;

    fn dummy_stripe() -> StripeClient {
        StripeClient::new(StripeConfig {
            secret_key: "sk_test_dummy".to_string(),
            webhook_secret: "whsec_dummy".to_string(),
            unit_price_id: "price_dummy".to_string(),
            unit_price_cents: Some(500),
        })
    }

    #[test]
    fn test_context_reconciles_when_all_units_accounted() {
        let mut ctx = FulfillmentContext::new(3);
        ctx.record_completed("KM-A");
        ctx.record_queued("KM-B");
        ctx.record_failed("KM-C", "subscription creation failed");
        assert!(ctx.assert_reconciled().is_ok());
    }

    #[test]
    fn test_context_rejects_missing_units() {
        let mut ctx = FulfillmentContext::new(3);
        ctx.record_completed("KM-A");
        let err = ctx.assert_reconciled().unwrap_err();
        assert!(matches!(err, BillingError::DataInconsistency(_)));
    }

    #[test]
    fn test_scheduler_batches_respect_size() {
        let config = FulfillmentConfig {
            batch_size: 3,
            ..Default::default()
        };
        let scheduler = BatchScheduler::from_config(&config);
        let items: Vec<u32> = (0..8).collect();
        let sizes: Vec<usize> = scheduler.batches(&items).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![3, 3, 2]);
    }

    #[test]
    fn test_scheduler_zero_batch_size_clamped() {
        let config = FulfillmentConfig {
            batch_size: 0,
            ..Default::default()
        };
        let scheduler = BatchScheduler::from_config(&config);
        let items = [1, 2];
        assert_eq!(scheduler.batches(&items).count(), 2);
    }

    #[test]
    fn test_split_threshold_behavior() {
        // quantity 15, threshold 10, immediate 5 => 5 inline + 10 deferred
        let config = FulfillmentConfig::default();
        let keys: Vec<String> = (0..15).map(|i| format!("KM-{}", i)).collect();
        let quantity = keys.len();
        let (inline, deferred) = if quantity > config.queue_threshold {
            keys.split_at(config.immediate_batch.min(quantity))
        } else {
            keys.split_at(quantity)
        };
        assert_eq!(inline.len(), 5);
        assert_eq!(deferred.len(), 10);
    }

    #[test]
    fn test_split_below_threshold_all_inline() {
        let config = FulfillmentConfig::default();
        let keys: Vec<String> = (0..4).map(|i| format!("KM-{}", i)).collect();
        let quantity = keys.len();
        let (inline, deferred) = if quantity > config.queue_threshold {
            keys.split_at(config.immediate_batch.min(quantity))
        } else {
            keys.split_at(quantity)
        };
        assert_eq!(inline.len(), 4);
        assert!(deferred.is_empty());
    }

    #[tokio::test]
    async fn test_quantity_outside_bounds_rejected_before_any_side_effect() {
        // Lazy pool never connects: validation must fire before any
        // database or billing call is made.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost:1/unreachable")
            .expect("lazy pool");
        let service = FulfillmentService::new(dummy_stripe(), pool, FulfillmentConfig::default());

        let oversized = QuantityCheckout {
            customer_id: "cus_test".to_string(),
            payment_intent_id: "pi_test".to_string(),
            payment_method_id: Some("pm_test".to_string()),
            quantity: MAX_UNITS_PER_PURCHASE + 1,
            license_keys: Vec::new(),
            billing_interval: "month".to_string(),
            amount_total_cents: None,
        };
        let err = service
            .fulfill_quantity_purchase(&oversized)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidQuantity(q) if q == MAX_UNITS_PER_PURCHASE + 1));

        let zero = QuantityCheckout {
            quantity: 0,
            ..oversized
        };
        let err = service.fulfill_quantity_purchase(&zero).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidQuantity(0)));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_provisioned_license_short_circuits_unit_rerun() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = keymint_shared::db::create_pool(&url, 2).await.expect("pool");
        keymint_shared::db::run_migrations(&pool).await.expect("migrations");

        let service = FulfillmentService::new(dummy_stripe(), pool, FulfillmentConfig::default());

        let key = format!("KM-RERUN-{}", Uuid::new_v4().simple());
        let created = service
            .licenses
            .create_license(&NewLicense {
                license_key: key.clone(),
                customer_id: "cus_rerun_test".to_string(),
                stripe_subscription_id: "sub_rerun_existing".to_string(),
                stripe_item_id: None,
                site_domain: None,
                purchase_type: PurchaseType::Quantity,
            })
            .await
            .expect("create license");
        assert!(created);

        // The dummy key makes any billing call fail, so success here proves
        // no second subscription was attempted for the re-run.
        let subscription_id = service
            .provision_unit("cus_rerun_test", &key, 0, "pi_rerun_test", Some(500))
            .await
            .expect("re-run should reuse the existing license");
        assert_eq!(subscription_id, "sub_rerun_existing");
    }
}
