//! Automatic refunds for units that could not be provisioned
//!
//! The refund sweep walks failed queue items that have aged past the grace
//! window and refunds the per-unit amount back to the original payment.
//! Each item is refunded at most once: a marker appended to the queue row's
//! error message excludes it from every later sweep.

use sqlx::PgPool;
use stripe::{CreateRefund, PaymentIntent, PaymentIntentId, Refund};
use uuid::Uuid;

use keymint_shared::QueueItem;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::retry::with_backoff;

/// Even split of a payment total across its units. `None` when either side
/// is unusable; the caller decides whether that is an error.
fn per_unit_share(total_cents: i64, units: i64) -> Option<i64> {
    if total_cents <= 0 || units <= 0 {
        return None;
    }
    Some(total_cents / units)
}

/// Outcome of one refund sweep pass
#[derive(Debug, Default)]
pub struct RefundSweepReport {
    pub examined: usize,
    pub refunded: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Service issuing compensating refunds for failed provisioning
#[derive(Clone)]
pub struct RefundService {
    stripe: StripeClient,
    pool: PgPool,
    events: BillingEventLogger,
}

impl RefundService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let events = BillingEventLogger::new(pool.clone());
        Self {
            stripe,
            pool,
            events,
        }
    }

    /// Determine the per-unit refund amount in cents.
    ///
    /// Preference order: the configured unit price, then the per-unit amount
    /// recorded on a sibling payment row of the same checkout (payment rows
    /// are written per unit, already divided out of the checkout total), then
    /// the original payment's total split evenly across its units. A unit we
    /// cannot price is an error, not a zero refund.
    pub async fn unit_amount_cents(&self, item: &QueueItem) -> BillingResult<i64> {
        if let Some(configured) = self.stripe.config().unit_price_cents {
            return Ok(configured);
        }

        let sibling: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT amount_cents FROM payments
            WHERE payment_intent_id = $1 AND amount_cents > 0
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(&item.payment_intent_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some((amount,)) = sibling {
            return Ok(amount);
        }

        // No usable payment row exists when every unit of the payment
        // failed; fall back to the original charge split across its units.
        let units = self.units_for_payment(&item.payment_intent_id).await?;
        let total = self.payment_intent_amount(&item.payment_intent_id).await?;
        per_unit_share(total, units).ok_or_else(|| {
            BillingError::RefundFailed(format!(
                "Cannot determine unit amount for payment {}",
                item.payment_intent_id
            ))
        })
    }

    /// Units belonging to one payment: every queue row, plus inline units
    /// that completed without ever entering the queue
    async fn units_for_payment(&self, payment_intent_id: &str) -> BillingResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM (
                SELECT license_key FROM provisioning_queue WHERE payment_intent_id = $1
                UNION
                SELECT license_key FROM payments
                WHERE payment_intent_id = $1 AND license_key IS NOT NULL
            ) AS units
            "#,
        )
        .bind(payment_intent_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Amount of the original payment, from Stripe
    async fn payment_intent_amount(&self, payment_intent_id: &str) -> BillingResult<i64> {
        let pi_id = payment_intent_id.parse::<PaymentIntentId>().map_err(|e| {
            BillingError::RefundFailed(format!(
                "Invalid payment intent {}: {}",
                payment_intent_id, e
            ))
        })?;

        let intent = with_backoff("retrieve_payment_amount", || {
            let pi_id = pi_id.clone();
            async move {
                let intent = PaymentIntent::retrieve(self.stripe.inner(), &pi_id, &[]).await?;
                Ok(intent)
            }
        })
        .await?;

        Ok(intent.amount)
    }

    /// Refund one failed queue item. Returns the Stripe refund id.
    pub async fn refund_queue_item(&self, item: &QueueItem) -> BillingResult<String> {
        if item.is_refunded() {
            tracing::info!(
                queue_id = %item.id,
                license_key = %item.license_key,
                "Queue item already refunded - skipping"
            );
            return Err(BillingError::RefundFailed(
                "Item already carries refund marker".to_string(),
            ));
        }

        // Second guard besides the marker: a refund row for this queue item
        // means Stripe was already called, even if the marker write was lost.
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT stripe_refund_id FROM refunds WHERE queue_id = $1")
                .bind(item.id)
                .fetch_optional(&self.pool)
                .await?;
        if let Some((refund_id,)) = existing {
            tracing::warn!(
                queue_id = %item.id,
                refund_id = %refund_id,
                "Refund row already exists for queue item - repairing marker"
            );
            return Ok(refund_id);
        }

        let amount = self.unit_amount_cents(item).await?;
        let payment_intent_id = item
            .payment_intent_id
            .parse::<PaymentIntentId>()
            .map_err(|e| {
                BillingError::RefundFailed(format!(
                    "Invalid payment intent {}: {}",
                    item.payment_intent_id, e
                ))
            })?;

        let refund = with_backoff("create_refund", || {
            let payment_intent_id = payment_intent_id.clone();
            async move {
                let mut params = CreateRefund::new();
                params.payment_intent = Some(payment_intent_id);
                params.amount = Some(amount);
                params.reason = Some(stripe::RefundReasonFilter::RequestedByCustomer);
                let refund = Refund::create(self.stripe.inner(), params).await?;
                Ok(refund)
            }
        })
        .await?;

        sqlx::query(
            r#"
            INSERT INTO refunds (
                id, queue_id, license_key, payment_intent_id,
                stripe_refund_id, amount_cents, currency, reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'usd', 'provisioning_failed')
            ON CONFLICT (stripe_refund_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(item.id)
        .bind(&item.license_key)
        .bind(&item.payment_intent_id)
        .bind(refund.id.as_str())
        .bind(amount)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            queue_id = %item.id,
            refund_id = %refund.id,
            payment_intent_id = %item.payment_intent_id,
            amount_cents = amount,
            "Refunded failed provisioning unit"
        );

        if let Err(e) = self
            .events
            .log_event(
                BillingEventBuilder::new(BillingEventType::RefundIssued)
                    .customer(&item.customer_id)
                    .license(&item.license_key)
                    .actor_type(ActorType::System)
                    .data(serde_json::json!({
                        "refund_id": refund.id.as_str(),
                        "payment_intent_id": item.payment_intent_id,
                        "amount_cents": amount,
                    })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log refund billing event");
        }

        Ok(refund.id.to_string())
    }

    /// One refund sweep pass: refund every failed item that has aged past
    /// the grace window and mark it so it is never refunded again.
    ///
    /// Per-item failures do not stop the pass; an item that could not be
    /// refunded stays eligible for the next run.
    pub async fn sweep(
        &self,
        queue: &crate::queue::ProvisioningQueue,
        grace_hours: i64,
    ) -> BillingResult<RefundSweepReport> {
        let items = queue.aged_failures(grace_hours).await?;
        let mut report = RefundSweepReport {
            examined: items.len(),
            ..Default::default()
        };

        for item in &items {
            if item.is_refunded() {
                report.skipped += 1;
                continue;
            }
            match self.refund_queue_item(item).await {
                Ok(refund_id) => {
                    if let Err(e) = queue.mark_refunded(item.id).await {
                        // The Stripe refund exists but the marker write
                        // failed; the refunds-row check in refund_queue_item
                        // keeps the next sweep from refunding twice.
                        tracing::error!(
                            queue_id = %item.id,
                            refund_id = %refund_id,
                            error = %e,
                            "Refunded item but failed to write refund marker"
                        );
                    }
                    report.refunded += 1;
                }
                Err(e) => {
                    tracing::error!(
                        queue_id = %item.id,
                        license_key = %item.license_key,
                        error = %e,
                        "Refund failed - item stays eligible for next sweep"
                    );
                    report.errors += 1;
                }
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                refunded = report.refunded,
                skipped = report.skipped,
                errors = report.errors,
                "Refund sweep pass finished"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_report_default_is_empty() {
        let report = RefundSweepReport::default();
        assert_eq!(report.examined, 0);
        assert_eq!(report.refunded, 0);
        assert_eq!(report.errors, 0);
    }

    #[test]
    fn test_per_unit_share_divides_total() {
        // 15 units at $5: the whole-payment fallback recovers the unit price
        assert_eq!(per_unit_share(7_500, 15), Some(500));
        assert_eq!(per_unit_share(500, 1), Some(500));
    }

    #[test]
    fn test_per_unit_share_rejects_unusable_inputs() {
        assert_eq!(per_unit_share(0, 3), None);
        assert_eq!(per_unit_share(-500, 3), None);
        assert_eq!(per_unit_share(7_500, 0), None);
    }
}
