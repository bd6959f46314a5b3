//! Webhook verification and event processing
//!
//! Stripe delivers events at-least-once, so everything here is built for
//! redelivery: the signature check is pure, the event claim is a single
//! atomic insert, and every downstream write is an idempotent upsert. A
//! payment that Stripe has confirmed is always acknowledged, even when a
//! secondary persistence step fails - shortfalls are corrected by the
//! background sweeps, never by making Stripe retry a completed payment.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{
    CheckoutSession, CheckoutSessionPaymentStatus, EventObject, EventType, Expandable, Invoice,
    PaymentIntent, PaymentIntentId, Subscription,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::classify::{resolve_purchase_intent, ClassificationResult, IntentSources};
use crate::client::{FulfillmentConfig, StripeClient};
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::fulfillment::{FulfillmentService, QuantityCheckout, SiteCheckout, SiteLineItem};
use crate::license::LicenseService;
use crate::retry::with_backoff;
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed payload before it is rejected as a replay
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// How long an event may sit in `processing` before another delivery of the
/// same event is allowed to take it over (crashed handler recovery)
const STUCK_PROCESSING_MINUTES: i32 = 5;

/// Verify a `t=<ts>,v1=<hex>` signature header against the raw payload.
///
/// The digest is an HMAC-SHA256 over `"{t}.{payload}"`. Any parse failure,
/// stale timestamp, or digest mismatch is the same error: the caller learns
/// nothing about which check failed.
pub fn verify_signature(
    payload: &str,
    signature_header: &str,
    secret: &str,
) -> BillingResult<()> {
    if secret.is_empty() {
        return Err(BillingError::SignatureInvalid);
    }

    let mut timestamp: Option<i64> = None;
    let mut signature: Option<&str> = None;
    for part in signature_header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(v)) => timestamp = v.parse().ok(),
            (Some("v1"), Some(v)) => signature = Some(v),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(BillingError::SignatureInvalid)?;
    let signature = signature.ok_or(BillingError::SignatureInvalid)?;

    let now = OffsetDateTime::now_utc().unix_timestamp();
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(BillingError::SignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::SignatureInvalid)?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());

    let provided = hex::decode(signature).map_err(|_| BillingError::SignatureInvalid)?;
    mac.verify_slice(&provided)
        .map_err(|_| BillingError::SignatureInvalid)?;

    Ok(())
}

/// What happened to a delivered event
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Event was handled
    Processed,
    /// Event was already claimed by a previous delivery
    Duplicate,
    /// Event kind is not one we consume
    Ignored,
}

/// The webhook entry point: verifies, claims, classifies and dispatches
#[derive(Clone)]
pub struct WebhookProcessor {
    stripe: StripeClient,
    pool: PgPool,
    fulfillment: FulfillmentService,
    subscriptions: SubscriptionService,
    licenses: LicenseService,
    events: BillingEventLogger,
}

impl WebhookProcessor {
    pub fn new(stripe: StripeClient, pool: PgPool, config: FulfillmentConfig) -> Self {
        let fulfillment = FulfillmentService::new(stripe.clone(), pool.clone(), config);
        let subscriptions = SubscriptionService::new(stripe.clone(), pool.clone());
        let licenses = LicenseService::new(pool.clone());
        let events = BillingEventLogger::new(pool.clone());
        Self {
            stripe,
            pool,
            fulfillment,
            subscriptions,
            licenses,
            events,
        }
    }

    /// Swap in a cache-backed license service
    pub fn with_licenses(mut self, licenses: LicenseService) -> Self {
        self.licenses = licenses;
        self
    }

    pub fn fulfillment(&self) -> &FulfillmentService {
        &self.fulfillment
    }

    /// Process one raw delivery: verify the signature, claim the event,
    /// dispatch by kind.
    pub async fn process(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> BillingResult<WebhookOutcome> {
        verify_signature(
            payload,
            signature_header,
            &self.stripe.config().webhook_secret,
        )?;

        let event: stripe::Event = serde_json::from_str(payload)
            .map_err(|e| BillingError::MalformedMetadata(format!("Event parse failed: {}", e)))?;

        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        if !self.claim_event(&event_id, &event_type, payload).await? {
            tracing::info!(
                event_id = %event_id,
                event_type = %event_type,
                "Event already claimed - skipping duplicate delivery"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        tracing::info!(event_id = %event_id, event_type = %event_type, "Processing webhook event");

        let result = self.dispatch(&event).await;
        match &result {
            Ok(outcome) => {
                self.mark_event(&event_id, "processed", None).await;
                tracing::info!(event_id = %event_id, outcome = ?outcome, "Webhook event handled");
            }
            Err(e) => {
                self.mark_event(&event_id, "failed", Some(&e.to_string())).await;
                tracing::error!(event_id = %event_id, error = %e, "Webhook event failed");
            }
        }
        result
    }

    /// Claim an event for processing. The insert is the idempotency gate;
    /// a stuck `processing` row older than the cutoff can be taken over.
    /// The raw payload is stored with the claim so a failed event can be
    /// replayed later without another delivery from Stripe.
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &str,
    ) -> BillingResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (id, stripe_event_id, event_type, status, payload)
            VALUES ($1, $2, $3, 'processing', $4)
            ON CONFLICT (stripe_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(true);
        }

        let taken_over: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE webhook_events
            SET status = 'processing', updated_at = NOW()
            WHERE stripe_event_id = $1
              AND status = 'processing'
              AND updated_at < NOW() - ($2 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(STUCK_PROCESSING_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if taken_over.is_some() {
            tracing::warn!(event_id = %event_id, "Took over stuck webhook event");
        }
        Ok(taken_over.is_some())
    }

    async fn mark_event(&self, event_id: &str, status: &str, error: Option<&str>) {
        let updated = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = $2, error_message = $3, updated_at = NOW()
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await;
        if let Err(e) = updated {
            tracing::error!(event_id = %event_id, error = %e, "Failed to update webhook event row");
        }
    }

    /// Re-process failed event claims from their stored payloads.
    ///
    /// A transient error during dispatch leaves the claim in `failed` while
    /// the route still acknowledged the delivery, so Stripe never redelivers.
    /// This pass closes that gap: the sweep worker replays such claims until
    /// they process or hit the attempt cap.
    pub async fn retry_failed_events(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> BillingResult<usize> {
        let claims = self.claim_failed_for_replay(limit, max_attempts).await?;

        let mut replayed = 0;
        for (event_id, payload) in claims {
            let event: stripe::Event = match serde_json::from_str(&payload) {
                Ok(event) => event,
                Err(e) => {
                    self.mark_event(
                        &event_id,
                        "failed",
                        Some(&format!("Stored payload unparseable: {}", e)),
                    )
                    .await;
                    continue;
                }
            };

            match self.dispatch(&event).await {
                Ok(outcome) => {
                    self.mark_event(&event_id, "processed", None).await;
                    tracing::info!(
                        event_id = %event_id,
                        outcome = ?outcome,
                        "Replayed failed webhook event"
                    );
                    replayed += 1;
                }
                Err(e) => {
                    self.mark_event(&event_id, "failed", Some(&e.to_string())).await;
                    tracing::warn!(
                        event_id = %event_id,
                        error = %e,
                        "Webhook event replay failed - stays eligible until attempt cap"
                    );
                }
            }
        }
        Ok(replayed)
    }

    /// Flip a bounded batch of replayable failed claims back to processing
    /// and return their payloads. Claims without a stored payload or past
    /// the attempt cap are left alone.
    async fn claim_failed_for_replay(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> BillingResult<Vec<(String, String)>> {
        let claims: Vec<(String, String)> = sqlx::query_as(
            r#"
            UPDATE webhook_events
            SET status = 'processing', attempts = attempts + 1, updated_at = NOW()
            WHERE id IN (
                SELECT id FROM webhook_events
                WHERE status = 'failed'
                  AND payload IS NOT NULL
                  AND attempts < $2
                ORDER BY updated_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING stripe_event_id, payload
            "#,
        )
        .bind(limit)
        .bind(max_attempts)
        .fetch_all(&self.pool)
        .await?;

        Ok(claims)
    }

    async fn dispatch(&self, event: &stripe::Event) -> BillingResult<WebhookOutcome> {
        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                if let EventObject::CheckoutSession(session) = &event.data.object {
                    self.handle_checkout_completed(&event.id.to_string(), session)
                        .await
                } else {
                    Err(BillingError::MalformedMetadata(
                        "checkout.session.completed without session object".to_string(),
                    ))
                }
            }
            EventType::PaymentIntentSucceeded => {
                if let EventObject::PaymentIntent(pi) = &event.data.object {
                    self.handle_payment_succeeded(&event.id.to_string(), pi).await
                } else {
                    Err(BillingError::MalformedMetadata(
                        "payment_intent.succeeded without payment intent object".to_string(),
                    ))
                }
            }
            EventType::CustomerSubscriptionUpdated => {
                if let EventObject::Subscription(sub) = &event.data.object {
                    self.handle_subscription_updated(&event.id.to_string(), sub)
                        .await
                } else {
                    Err(BillingError::MalformedMetadata(
                        "customer.subscription.updated without subscription object".to_string(),
                    ))
                }
            }
            EventType::CustomerSubscriptionDeleted => {
                if let EventObject::Subscription(sub) = &event.data.object {
                    self.handle_subscription_deleted(&event.id.to_string(), sub)
                        .await
                } else {
                    Err(BillingError::MalformedMetadata(
                        "customer.subscription.deleted without subscription object".to_string(),
                    ))
                }
            }
            EventType::InvoicePaid => {
                if let EventObject::Invoice(invoice) = &event.data.object {
                    self.handle_invoice_paid(&event.id.to_string(), invoice).await
                } else {
                    Err(BillingError::MalformedMetadata(
                        "invoice.paid without invoice object".to_string(),
                    ))
                }
            }
            other => {
                tracing::info!(event_type = %other, "Unhandled webhook event type");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    // ---- Event handlers ---------------------------------------------------

    async fn handle_checkout_completed(
        &self,
        event_id: &str,
        session: &CheckoutSession,
    ) -> BillingResult<WebhookOutcome> {
        if !matches!(
            session.payment_status,
            CheckoutSessionPaymentStatus::Paid | CheckoutSessionPaymentStatus::NoPaymentRequired
        ) {
            tracing::info!(
                session_id = %session.id,
                payment_status = ?session.payment_status,
                "Checkout completed without payment - ignoring"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        let customer_id = match &session.customer {
            Some(Expandable::Id(id)) => id.to_string(),
            Some(Expandable::Object(c)) => c.id.to_string(),
            None => {
                tracing::warn!(session_id = %session.id, "Checkout session has no customer");
                return Ok(WebhookOutcome::Ignored);
            }
        };
        let subscription_id = session.subscription.as_ref().map(|s| match s {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(sub) => sub.id.to_string(),
        });
        let payment_intent_id = session.payment_intent.as_ref().map(|p| match p {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(pi) => pi.id.to_string(),
        });

        let session_metadata = session.metadata.clone().unwrap_or_default();

        // These reads run before any claim-settling work; a transient Stripe
        // blip here must not strand a confirmed payment, so they go through
        // the retry kernel like every other external call.
        let subscription = match &subscription_id {
            Some(id) => Some(
                with_backoff("retrieve_subscription", || self.subscriptions.retrieve(id))
                    .await?,
            ),
            None => None,
        };
        let payment_intent = match &payment_intent_id {
            Some(id) => {
                Some(with_backoff("retrieve_payment_intent", || self.retrieve_payment_intent(id)).await?)
            }
            None => None,
        };

        let subscription_metadata = subscription.as_ref().map(|s| s.metadata.clone());
        let payment_intent_metadata = payment_intent.as_ref().map(|pi| pi.metadata.clone());

        let sources = IntentSources {
            session_use_case: session.client_reference_id.as_deref(),
            session_metadata: Some(&session_metadata),
            subscription_metadata: subscription_metadata.as_ref(),
            payment_intent_metadata: payment_intent_metadata.as_ref(),
        };
        let classification = resolve_purchase_intent(
            &sources,
            Some(customer_id.clone()),
            subscription_id.clone(),
            payment_intent_id.clone(),
        );

        tracing::info!(
            event_id = %event_id,
            session_id = %session.id,
            customer_id = %customer_id,
            intent = ?classification.intent,
            quantity = classification.quantity,
            "Checkout classified"
        );

        match classification.purchase_type() {
            keymint_shared::PurchaseType::Site => {
                let (subscription, subscription_id) = match (subscription, subscription_id) {
                    (Some(sub), Some(id)) => (sub, id),
                    _ => {
                        tracing::warn!(
                            session_id = %session.id,
                            "Site purchase without a subscription - nothing to fulfill"
                        );
                        return Ok(WebhookOutcome::Ignored);
                    }
                };

                let line_items: Vec<SiteLineItem> = subscription
                    .items
                    .data
                    .iter()
                    .map(|item| SiteLineItem {
                        price_id: item
                            .price
                            .as_ref()
                            .map(|p| p.id.to_string())
                            .unwrap_or_default(),
                        metadata_site_domain: item
                            .metadata
                            .as_ref()
                            .and_then(|m| m.get("site_domain"))
                            .cloned(),
                        amount_cents: item.price.as_ref().and_then(|p| p.unit_amount),
                    })
                    .collect();

                let checkout = SiteCheckout {
                    customer_id,
                    subscription_id,
                    payment_intent_id,
                    line_items,
                    session_site_domain: session_metadata.get("site_domain").cloned(),
                    // The storefront mirrors its custom checkout field into
                    // session metadata under this key.
                    custom_field_site_domain: session_metadata.get("site_name").cloned(),
                };
                let outcome = self.fulfillment.fulfill_site_purchase(&checkout).await?;
                tracing::info!(
                    event_id = %event_id,
                    subscription_id = %outcome.subscription_id,
                    merged = outcome.merged_into_existing,
                    licenses = outcome.licenses_created.len(),
                    "Site purchase processed"
                );
            }
            keymint_shared::PurchaseType::Quantity => {
                let payment_intent_id = match payment_intent_id {
                    Some(id) => id,
                    None => {
                        tracing::warn!(
                            session_id = %session.id,
                            "Quantity purchase without a payment intent - nothing to fulfill"
                        );
                        return Ok(WebhookOutcome::Ignored);
                    }
                };

                let payment_method_id =
                    payment_intent
                        .as_ref()
                        .and_then(|pi| pi.payment_method.as_ref())
                        .map(|pm| match pm {
                            Expandable::Id(id) => id.to_string(),
                            Expandable::Object(obj) => obj.id.to_string(),
                        });

                let checkout = QuantityCheckout {
                    customer_id,
                    payment_intent_id,
                    payment_method_id,
                    quantity: classification.quantity,
                    license_keys: classification.license_keys.clone(),
                    billing_interval: self.unit_billing_interval().await,
                    amount_total_cents: session.amount_total,
                };
                let ctx = self.fulfillment.fulfill_quantity_purchase(&checkout).await?;
                tracing::info!(
                    event_id = %event_id,
                    total = ctx.total,
                    completed = ctx.completed.len(),
                    queued = ctx.queued.len(),
                    failed = ctx.failed.len(),
                    "Quantity purchase processed"
                );
            }
        }

        self.log_classified_event(event_id, &classification).await;

        Ok(WebhookOutcome::Processed)
    }

    async fn handle_payment_succeeded(
        &self,
        event_id: &str,
        payment_intent: &PaymentIntent,
    ) -> BillingResult<WebhookOutcome> {
        // Fulfillment happens on checkout completion; this event is kept for
        // the audit trail.
        let customer_id = payment_intent.customer.as_ref().map(|c| match c {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(obj) => obj.id.to_string(),
        });

        let mut builder = BillingEventBuilder::new(BillingEventType::PaymentSucceeded)
            .stripe_event(event_id)
            .actor_type(ActorType::Stripe)
            .data(serde_json::json!({
                "payment_intent_id": payment_intent.id.as_str(),
                "amount": payment_intent.amount,
            }));
        if let Some(customer_id) = customer_id {
            builder = builder.customer(customer_id);
        }
        if let Err(e) = self.events.log_event(builder).await {
            tracing::warn!(error = %e, "Failed to log payment event");
        }

        Ok(WebhookOutcome::Processed)
    }

    async fn handle_subscription_updated(
        &self,
        event_id: &str,
        subscription: &Subscription,
    ) -> BillingResult<WebhookOutcome> {
        self.subscriptions.sync_subscription_to_db(subscription).await?;

        // A subscription that left the usable states takes its licenses
        // with it; reactivation is handled by a later update event.
        let status = subscription.status.as_str();
        if matches!(status, "canceled" | "unpaid" | "incomplete_expired") {
            let keys = self
                .licenses
                .deactivate_for_subscription(subscription.id.as_str())
                .await?;
            if !keys.is_empty() {
                tracing::info!(
                    subscription_id = %subscription.id,
                    status = %status,
                    deactivated = keys.len(),
                    "Deactivated licenses for unusable subscription"
                );
            }
        }

        if let Err(e) = self
            .events
            .log_event(
                BillingEventBuilder::new(BillingEventType::SubscriptionUpdated)
                    .stripe_event(event_id)
                    .stripe_subscription(subscription.id.as_str())
                    .actor_type(ActorType::Stripe)
                    .data(serde_json::json!({
                        "status": status,
                        "cancel_at_period_end": subscription.cancel_at_period_end,
                    })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription update event");
        }

        Ok(WebhookOutcome::Processed)
    }

    async fn handle_subscription_deleted(
        &self,
        event_id: &str,
        subscription: &Subscription,
    ) -> BillingResult<WebhookOutcome> {
        self.subscriptions.sync_subscription_to_db(subscription).await?;

        let keys = self
            .licenses
            .deactivate_for_subscription(subscription.id.as_str())
            .await?;

        tracing::info!(
            subscription_id = %subscription.id,
            deactivated = keys.len(),
            "Subscription deleted - licenses deactivated"
        );

        if let Err(e) = self
            .events
            .log_event(
                BillingEventBuilder::new(BillingEventType::SubscriptionCanceled)
                    .stripe_event(event_id)
                    .stripe_subscription(subscription.id.as_str())
                    .actor_type(ActorType::Stripe)
                    .data(serde_json::json!({"deactivated_licenses": keys})),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription deletion event");
        }

        Ok(WebhookOutcome::Processed)
    }

    async fn handle_invoice_paid(
        &self,
        event_id: &str,
        invoice: &Invoice,
    ) -> BillingResult<WebhookOutcome> {
        let customer_id = invoice.customer.as_ref().map(|c| match c {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(obj) => obj.id.to_string(),
        });
        let subscription_id = invoice.subscription.as_ref().map(|s| match s {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(sub) => sub.id.to_string(),
        });

        let mut builder = BillingEventBuilder::new(BillingEventType::InvoicePaid)
            .stripe_event(event_id)
            .actor_type(ActorType::Stripe)
            .data(serde_json::json!({
                "invoice_id": invoice.id.as_str(),
                "amount_paid": invoice.amount_paid,
            }));
        if let Some(customer_id) = customer_id {
            builder = builder.customer(customer_id);
        }
        if let Some(subscription_id) = subscription_id {
            builder = builder.stripe_subscription(subscription_id);
        }
        if let Err(e) = self.events.log_event(builder).await {
            tracing::warn!(error = %e, "Failed to log invoice event");
        }

        Ok(WebhookOutcome::Processed)
    }

    // ---- Helpers ----------------------------------------------------------

    async fn retrieve_payment_intent(&self, id: &str) -> BillingResult<PaymentIntent> {
        let pi_id = id
            .parse::<PaymentIntentId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid payment intent ID: {}", e)))?;
        let pi = PaymentIntent::retrieve(self.stripe.inner(), &pi_id, &[]).await?;
        Ok(pi)
    }

    /// Billing interval of the configured unit price, defaulting to monthly
    /// when the price cannot be inspected
    async fn unit_billing_interval(&self) -> String {
        let price_id = match self.stripe.config().unit_price_id.parse::<stripe::PriceId>() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, "Configured unit price ID is not parseable");
                return "month".to_string();
            }
        };
        match stripe::Price::retrieve(self.stripe.inner(), &price_id, &[]).await {
            Ok(price) => price
                .recurring
                .map(|r| r.interval.as_str().to_string())
                .unwrap_or_else(|| "month".to_string()),
            Err(e) => {
                tracing::warn!(error = %e, "Could not inspect unit price - assuming monthly");
                "month".to_string()
            }
        }
    }

    async fn log_classified_event(&self, event_id: &str, classification: &ClassificationResult) {
        let mut builder = BillingEventBuilder::new(BillingEventType::PaymentSucceeded)
            .stripe_event(event_id)
            .actor_type(ActorType::Stripe)
            .data(serde_json::json!({
                "intent": classification.intent,
                "quantity": classification.quantity,
            }));
        if let Some(customer_id) = &classification.customer_id {
            builder = builder.customer(customer_id);
        }
        if let Some(subscription_id) = &classification.subscription_id {
            builder = builder.stripe_subscription(subscription_id);
        }
        if let Err(e) = self.events.log_event(builder).await {
            tracing::warn!(error = %e, "Failed to log classification event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test123secret456";

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn now() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    #[test]
    fn test_valid_signature_accepted() {
        let payload = r#"{"type":"checkout.session.completed"}"#;
        let ts = now();
        let header = format!("t={},v1={}", ts, sign(payload, SECRET, ts));
        assert!(verify_signature(payload, &header, SECRET).is_ok());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = r#"{"type":"checkout.session.completed"}"#;
        let ts = now();
        let header = format!("t={},v1={}", ts, sign(payload, "wrong_secret", ts));
        assert!(matches!(
            verify_signature(payload, &header, SECRET),
            Err(BillingError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_modified_payload_rejected() {
        let payload = r#"{"type":"checkout.session.completed"}"#;
        let ts = now();
        let header = format!("t={},v1={}", ts, sign(payload, SECRET, ts));
        let tampered = r#"{"type":"checkout.session.completed","hacked":true}"#;
        assert!(verify_signature(tampered, &header, SECRET).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = r#"{}"#;
        let ts = now() - SIGNATURE_TOLERANCE_SECS - 60;
        let header = format!("t={},v1={}", ts, sign(payload, SECRET, ts));
        assert!(verify_signature(payload, &header, SECRET).is_err());
    }

    #[test]
    fn test_missing_parts_rejected() {
        assert!(verify_signature("{}", "t=1234567890", SECRET).is_err());
        assert!(verify_signature("{}", "v1=deadbeef", SECRET).is_err());
        assert!(verify_signature("{}", "garbage", SECRET).is_err());
        assert!(verify_signature("{}", "", SECRET).is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        let payload = r#"{}"#;
        let ts = now();
        let header = format!("t={},v1={}", ts, sign(payload, "", ts));
        assert!(verify_signature(payload, &header, "").is_err());
    }

    #[test]
    fn test_header_with_extra_fields_still_parses() {
        let payload = r#"{"ok":true}"#;
        let ts = now();
        let sig = sign(payload, SECRET, ts);
        let header = format!("t={},v0=legacy,v1={}", ts, sig);
        assert!(verify_signature(payload, &header, SECRET).is_ok());
    }

    async fn test_processor() -> (WebhookProcessor, PgPool) {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = keymint_shared::db::create_pool(&url, 2)
            .await
            .expect("Failed to create pool");
        keymint_shared::db::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        let stripe = StripeClient::new(crate::client::StripeConfig {
            secret_key: "sk_test_dummy".into(),
            webhook_secret: SECRET.into(),
            unit_price_id: "price_dummy".into(),
            unit_price_cents: Some(500),
        });
        let processor = WebhookProcessor::new(stripe, pool.clone(), FulfillmentConfig::default());
        (processor, pool)
    }

    async fn insert_claim(
        pool: &PgPool,
        event_id: &str,
        status: &str,
        attempts: i32,
        payload: Option<&str>,
    ) {
        sqlx::query(
            r#"
            INSERT INTO webhook_events (id, stripe_event_id, event_type, status, attempts, payload)
            VALUES ($1, $2, 'checkout.session.completed', $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(status)
        .bind(attempts)
        .bind(payload)
        .execute(pool)
        .await
        .expect("Failed to insert webhook event");
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_failed_claims_with_payload_are_reclaimed_for_replay() {
        let (processor, pool) = test_processor().await;
        let suffix = Uuid::new_v4().simple().to_string();
        let replayable = format!("evt_replay_{}", suffix);
        let exhausted = format!("evt_exhausted_{}", suffix);
        let payloadless = format!("evt_payloadless_{}", suffix);

        insert_claim(&pool, &replayable, "failed", 1, Some(r#"{"stub":true}"#)).await;
        insert_claim(&pool, &exhausted, "failed", 5, Some(r#"{"stub":true}"#)).await;
        insert_claim(&pool, &payloadless, "failed", 0, None).await;

        let claims = processor
            .claim_failed_for_replay(100, 5)
            .await
            .expect("Replay claim failed");

        let claimed_ids: Vec<&str> = claims.iter().map(|(id, _)| id.as_str()).collect();
        assert!(claimed_ids.contains(&replayable.as_str()));
        assert!(!claimed_ids.contains(&exhausted.as_str()));
        assert!(!claimed_ids.contains(&payloadless.as_str()));

        // The reclaimed row is back in processing with the attempt counted
        let (status, attempts): (String, i32) = sqlx::query_as(
            "SELECT status, attempts FROM webhook_events WHERE stripe_event_id = $1",
        )
        .bind(&replayable)
        .fetch_one(&pool)
        .await
        .expect("Claim row missing");
        assert_eq!(status, "processing");
        assert_eq!(attempts, 2);

        // A stored payload that no longer parses goes back to failed with
        // the parse error recorded, instead of looping forever
        let garbage = format!("evt_garbage_{}", suffix);
        insert_claim(&pool, &garbage, "failed", 0, Some("not json")).await;
        processor
            .retry_failed_events(100, 5)
            .await
            .expect("Replay pass failed");

        let (status, error): (String, Option<String>) = sqlx::query_as(
            "SELECT status, error_message FROM webhook_events WHERE stripe_event_id = $1",
        )
        .bind(&garbage)
        .fetch_one(&pool)
        .await
        .expect("Claim row missing");
        assert_eq!(status, "failed");
        assert!(error.unwrap_or_default().contains("unparseable"));
    }
}
