//! Deferred provisioning queue
//!
//! Large quantity purchases are not provisioned inline: units beyond the
//! immediate batch go here and a background sweep drains them. Rows are
//! claimed with FOR UPDATE SKIP LOCKED so concurrent sweeps never double
//! provision, and failures back off exponentially before the refund sweep
//! picks up whatever is still failed.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use keymint_shared::{QueueItem, QueueStatus};

use crate::error::BillingResult;

/// A unit waiting for deferred provisioning
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub customer_id: String,
    pub payment_intent_id: String,
    pub license_key: String,
    pub price_id: String,
    /// Unix timestamp for the unit subscription's trial_end, precomputed at
    /// enqueue time so the sweep does not re-derive the billing interval
    pub trial_end: Option<i64>,
}

/// Per-payment status rollup used for fulfillment reporting
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl QueueStatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Service owning the provisioning_queue table
#[derive(Clone)]
pub struct ProvisioningQueue {
    pool: PgPool,
    max_attempts: i32,
}

impl ProvisioningQueue {
    pub fn new(pool: PgPool, max_attempts: u32) -> Self {
        Self {
            pool,
            max_attempts: max_attempts as i32,
        }
    }

    /// Enqueue one unit for deferred provisioning. The license key is
    /// pre-minted so redelivery of the same payment enqueues no duplicates.
    pub async fn enqueue(&self, item: &NewQueueItem) -> BillingResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO provisioning_queue (
                id, customer_id, payment_intent_id, license_key, price_id,
                quantity, trial_end, status, attempts, next_retry_at
            )
            VALUES ($1, $2, $3, $4, $5, 1, $6, 'pending', 0, NOW())
            ON CONFLICT (license_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&item.customer_id)
        .bind(&item.payment_intent_id)
        .bind(&item.license_key)
        .bind(&item.price_id)
        .bind(item.trial_end)
        .execute(&self.pool)
        .await?;

        let created = inserted.rows_affected() > 0;
        if created {
            tracing::info!(
                customer_id = %item.customer_id,
                payment_intent_id = %item.payment_intent_id,
                license_key = %item.license_key,
                "Enqueued unit for deferred provisioning"
            );
        } else {
            tracing::info!(
                license_key = %item.license_key,
                "Queue item already exists - skipping duplicate enqueue"
            );
        }
        Ok(created)
    }

    /// Claim up to `limit` due items for processing.
    ///
    /// SKIP LOCKED lets concurrent sweeps drain disjoint sets; the status
    /// flip to processing inside the same statement keeps the claim atomic.
    pub async fn claim_due(&self, limit: i64) -> BillingResult<Vec<QueueItem>> {
        let items: Vec<QueueItem> = sqlx::query_as(
            r#"
            UPDATE provisioning_queue
            SET status = 'processing', updated_at = NOW()
            WHERE id IN (
                SELECT id FROM provisioning_queue
                WHERE status = 'pending'
                  AND next_retry_at <= NOW()
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        if !items.is_empty() {
            tracing::info!(claimed = items.len(), "Claimed queue items for provisioning");
        }
        Ok(items)
    }

    /// Mark an item provisioned
    pub async fn mark_completed(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE provisioning_queue
            SET status = 'completed', error_message = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a provisioning failure.
    ///
    /// Below the attempt cap the item goes back to pending with the next
    /// retry pushed out by 2^attempts minutes. At the cap it lands in failed,
    /// where the refund sweep will find it once it has aged past the grace
    /// window.
    pub async fn mark_failed(&self, item: &QueueItem, error: &str) -> BillingResult<QueueStatus> {
        let attempts = item.attempts + 1;

        let status = if attempts >= self.max_attempts {
            sqlx::query(
                r#"
                UPDATE provisioning_queue
                SET status = 'failed', attempts = $2, error_message = $3, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(item.id)
            .bind(attempts)
            .bind(error)
            .execute(&self.pool)
            .await?;

            tracing::error!(
                queue_id = %item.id,
                license_key = %item.license_key,
                attempts,
                error = %error,
                "Queue item exhausted retries - marked failed"
            );
            QueueStatus::Failed
        } else {
            let delay_minutes = 2i64.pow(attempts as u32);
            let next_retry_at = OffsetDateTime::now_utc() + time::Duration::minutes(delay_minutes);

            sqlx::query(
                r#"
                UPDATE provisioning_queue
                SET status = 'pending', attempts = $2, error_message = $3,
                    next_retry_at = $4, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(item.id)
            .bind(attempts)
            .bind(error)
            .bind(next_retry_at)
            .execute(&self.pool)
            .await?;

            tracing::warn!(
                queue_id = %item.id,
                license_key = %item.license_key,
                attempts,
                delay_minutes,
                error = %error,
                "Queue item failed - scheduled retry"
            );
            QueueStatus::Pending
        };

        Ok(status)
    }

    /// Status rollup for every unit of one payment
    pub async fn status_counts(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<QueueStatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM provisioning_queue
            WHERE payment_intent_id = $1
            GROUP BY status
            "#,
        )
        .bind(payment_intent_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueStatusCounts::default();
        for (status, count) in rows {
            match status.as_str() {
                "pending" => counts.pending = count,
                "processing" => counts.processing = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                other => {
                    tracing::warn!(status = %other, "Unknown queue status in rollup");
                }
            }
        }
        Ok(counts)
    }

    /// All items for a payment, newest first
    pub async fn items_for_payment(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Vec<QueueItem>> {
        let items: Vec<QueueItem> = sqlx::query_as(
            r#"
            SELECT * FROM provisioning_queue
            WHERE payment_intent_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(payment_intent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    /// Failed items older than the grace window that have not been refunded
    /// yet. The refund marker check keeps the sweep exactly-once.
    pub async fn aged_failures(&self, grace_hours: i64) -> BillingResult<Vec<QueueItem>> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::hours(grace_hours);

        let items: Vec<QueueItem> = sqlx::query_as(
            r#"
            SELECT * FROM provisioning_queue
            WHERE status = 'failed'
              AND updated_at <= $1
              AND (error_message IS NULL OR error_message NOT LIKE '%' || $2 || '%')
            ORDER BY updated_at ASC
            "#,
        )
        .bind(cutoff)
        .bind(QueueItem::REFUNDED_MARKER)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    /// Append the refunded marker to a failed item so the refund sweep never
    /// touches it again
    pub async fn mark_refunded(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE provisioning_queue
            SET error_message = COALESCE(error_message, '') || ' ' || $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(QueueItem::REFUNDED_MARKER)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recover items stuck in processing, e.g. after a crashed sweep.
    /// Anything processing for longer than the cutoff goes back to pending
    /// without consuming an attempt.
    pub async fn recover_stuck(&self, stuck_minutes: i64) -> BillingResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::minutes(stuck_minutes);

        let recovered = sqlx::query(
            r#"
            UPDATE provisioning_queue
            SET status = 'pending', next_retry_at = NOW(), updated_at = NOW()
            WHERE status = 'processing' AND updated_at <= $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let count = recovered.rows_affected();
        if count > 0 {
            tracing::warn!(count, "Recovered stuck queue items back to pending");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_doubles() {
        // attempt 1 => 2 min, attempt 2 => 4 min, attempt 3 => 8 min
        for (attempt, expected) in [(1u32, 2i64), (2, 4), (3, 8)] {
            assert_eq!(2i64.pow(attempt), expected);
        }
    }

    #[test]
    fn test_status_counts_total() {
        let counts = QueueStatusCounts {
            pending: 2,
            processing: 1,
            completed: 5,
            failed: 1,
        };
        assert_eq!(counts.total(), 9);
    }
}
