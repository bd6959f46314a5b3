//! Keymint background worker
//!
//! Runs the scheduled passes that keep fulfillment converging: queue drain,
//! stuck-item recovery, the refund sweep, failed-webhook replay, and webhook
//! claim cleanup.

mod sweeps;

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::EnvFilter;

use keymint_billing::fulfillment::FulfillmentService;
use keymint_billing::refunds::RefundService;
use keymint_billing::webhook::WebhookProcessor;
use keymint_billing::{FulfillmentConfig, StripeClient};
use keymint_shared::db;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = db::create_pool(&database_url, env_or("DATABASE_MAX_CONNECTIONS", 5))
        .await
        .context("Failed to create database pool")?;

    let stripe = StripeClient::from_env().context("Failed to configure Stripe client")?;
    let config = FulfillmentConfig::from_env();
    let grace_hours = config.refund_grace_hours;

    let fulfillment = FulfillmentService::new(stripe.clone(), pool.clone(), config.clone());
    let webhooks = WebhookProcessor::new(stripe.clone(), pool.clone(), config);
    let refunds = RefundService::new(stripe, pool.clone());
    let queue = fulfillment.queue().clone();

    let drain_limit: i64 = env_or("QUEUE_DRAIN_LIMIT", 20);
    let stuck_minutes: i64 = env_or("QUEUE_STUCK_MINUTES", 15);
    let retention_days: i32 = env_or("WEBHOOK_RETENTION_DAYS", 30);
    let replay_limit: i64 = env_or("WEBHOOK_REPLAY_LIMIT", 10);
    let replay_max_attempts: i32 = env_or("WEBHOOK_REPLAY_MAX_ATTEMPTS", 5);

    let sched = JobScheduler::new()
        .await
        .context("Failed to create job scheduler")?;

    // Queue drain every minute
    {
        let fulfillment = fulfillment.clone();
        sched
            .add(Job::new_async("0 * * * * *", move |_id, _sched| {
                let fulfillment = fulfillment.clone();
                Box::pin(async move {
                    sweeps::drain_provisioning_queue(&fulfillment, drain_limit).await;
                })
            })?)
            .await?;
    }

    // Stuck-item recovery every 5 minutes
    {
        let queue = queue.clone();
        sched
            .add(Job::new_async("0 */5 * * * *", move |_id, _sched| {
                let queue = queue.clone();
                Box::pin(async move {
                    sweeps::recover_stuck_items(&queue, stuck_minutes).await;
                })
            })?)
            .await?;
    }

    // Refund sweep hourly
    {
        let refunds = refunds.clone();
        let queue = queue.clone();
        sched
            .add(Job::new_async("0 10 * * * *", move |_id, _sched| {
                let refunds = refunds.clone();
                let queue = queue.clone();
                Box::pin(async move {
                    sweeps::sweep_refunds(&refunds, &queue, grace_hours).await;
                })
            })?)
            .await?;
    }

    // Failed-webhook replay every 10 minutes
    {
        let webhooks = webhooks.clone();
        sched
            .add(Job::new_async("0 */10 * * * *", move |_id, _sched| {
                let webhooks = webhooks.clone();
                Box::pin(async move {
                    sweeps::replay_failed_webhooks(&webhooks, replay_limit, replay_max_attempts)
                        .await;
                })
            })?)
            .await?;
    }

    // Webhook claim cleanup daily
    {
        let pool = pool.clone();
        sched
            .add(Job::new_async("0 0 3 * * *", move |_id, _sched| {
                let pool = pool.clone();
                Box::pin(async move {
                    sweeps::cleanup_old_webhook_events(&pool, retention_days).await;
                })
            })?)
            .await?;
    }

    sched.start().await.context("Failed to start scheduler")?;
    tracing::info!(
        drain_limit,
        stuck_minutes,
        grace_hours,
        "Worker started, sweeps scheduled"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received, stopping worker");

    Ok(())
}
