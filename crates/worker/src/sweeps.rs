//! Background sweep passes
//!
//! Each pass is fire-and-forget from the scheduler's point of view: failures
//! are logged and the next tick tries again. Nothing here returns an error
//! to the scheduler.

use sqlx::PgPool;
use tracing::{error, info};

use keymint_billing::fulfillment::FulfillmentService;
use keymint_billing::queue::ProvisioningQueue;
use keymint_billing::refunds::RefundService;
use keymint_billing::webhook::WebhookProcessor;

/// Drain due items from the deferred provisioning queue
pub async fn drain_provisioning_queue(fulfillment: &FulfillmentService, limit: i64) {
    match fulfillment.drain_queue(limit).await {
        Ok(report) => {
            if report.claimed > 0 {
                info!(
                    claimed = report.claimed,
                    completed = report.completed,
                    retried = report.retried,
                    failed = report.failed,
                    "Provisioning queue drained"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Provisioning queue drain failed");
        }
    }
}

/// Refund aged-out failed queue items
pub async fn sweep_refunds(refunds: &RefundService, queue: &ProvisioningQueue, grace_hours: i64) {
    match refunds.sweep(queue, grace_hours).await {
        Ok(report) => {
            if report.examined > 0 {
                info!(
                    examined = report.examined,
                    refunded = report.refunded,
                    skipped = report.skipped,
                    errors = report.errors,
                    "Refund sweep finished"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Refund sweep failed");
        }
    }
}

/// Return items stuck in `processing` (crashed drain pass) to `pending`
pub async fn recover_stuck_items(queue: &ProvisioningQueue, stuck_minutes: i64) {
    match queue.recover_stuck(stuck_minutes).await {
        Ok(recovered) => {
            if recovered > 0 {
                info!(recovered, "Recovered stuck provisioning items");
            }
        }
        Err(e) => {
            error!(error = %e, "Stuck item recovery failed");
        }
    }
}

/// Replay failed webhook claims from their stored payloads. Covers events
/// that failed on a transient error after Stripe's delivery was already
/// acknowledged.
pub async fn replay_failed_webhooks(processor: &WebhookProcessor, limit: i64, max_attempts: i32) {
    match processor.retry_failed_events(limit, max_attempts).await {
        Ok(reprocessed) => {
            if reprocessed > 0 {
                info!(reprocessed, "Replayed failed webhook events");
            }
        }
        Err(e) => {
            error!(error = %e, "Webhook replay sweep failed");
        }
    }
}

/// Delete old settled webhook event claims (for maintenance job)
pub async fn cleanup_old_webhook_events(pool: &PgPool, retention_days: i32) {
    let result = sqlx::query(
        r#"
        DELETE FROM webhook_events
        WHERE updated_at < NOW() - ($1 || ' days')::INTERVAL
          AND status IN ('processed', 'failed')
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await;

    match result {
        Ok(rows) => {
            if rows.rows_affected() > 0 {
                info!(
                    deleted = rows.rows_affected(),
                    retention_days, "Cleaned up old webhook event claims"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to clean up webhook event claims");
        }
    }
}
