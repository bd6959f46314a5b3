//! Stripe client configuration

use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price ID for a single quantity unit (one subscription per unit)
    pub unit_price_id: String,
    /// Unit price in cents, used for refund computation when the queue item
    /// price cannot be resolved from Stripe
    pub unit_price_cents: Option<i64>,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            unit_price_id: std::env::var("STRIPE_PRICE_UNIT")
                .map_err(|_| BillingError::Config("STRIPE_PRICE_UNIT not set".to_string()))?,
            unit_price_cents: std::env::var("UNIT_PRICE_CENTS")
                .ok()
                .and_then(|v| v.parse().ok()),
        })
    }
}

/// Knobs for the fulfillment orchestrator and the deferred queue.
///
/// All defaults mirror production behavior: batches of 3 units with a short
/// pause between batches (billing-service rate limits), queueing above 10
/// units with 5 attempted in-line, 3 queue attempts, 12h refund grace.
#[derive(Debug, Clone)]
pub struct FulfillmentConfig {
    /// Units provisioned per sequential batch within one invocation
    pub batch_size: usize,
    /// Delay between batches in milliseconds
    pub inter_batch_delay_ms: u64,
    /// Above this many units, provisioning switches to the deferred queue
    pub queue_threshold: usize,
    /// Units still attempted in-line when the queue threshold is exceeded
    pub immediate_batch: usize,
    /// Attempt cap for queued items before they go to `failed`
    pub max_queue_attempts: i32,
    /// Hours a failed item must age before it becomes refund-eligible
    pub refund_grace_hours: i64,
    /// Persistence retries after billing-side success
    pub persistence_retries: usize,
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            batch_size: 3,
            inter_batch_delay_ms: 500,
            queue_threshold: 10,
            immediate_batch: 5,
            max_queue_attempts: 3,
            refund_grace_hours: 12,
            persistence_retries: 3,
        }
    }
}

/// Parse an env var into any `FromStr` type, `None` when unset or unparseable
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl FulfillmentConfig {
    /// Load overrides from environment, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env_parse("FULFILLMENT_BATCH_SIZE").unwrap_or(defaults.batch_size),
            inter_batch_delay_ms: env_parse("FULFILLMENT_BATCH_DELAY_MS")
                .unwrap_or(defaults.inter_batch_delay_ms),
            queue_threshold: env_parse("FULFILLMENT_QUEUE_THRESHOLD")
                .unwrap_or(defaults.queue_threshold),
            immediate_batch: env_parse("FULFILLMENT_IMMEDIATE_BATCH")
                .unwrap_or(defaults.immediate_batch),
            max_queue_attempts: env_parse("QUEUE_MAX_ATTEMPTS")
                .unwrap_or(defaults.max_queue_attempts),
            refund_grace_hours: env_parse("REFUND_GRACE_HOURS")
                .unwrap_or(defaults.refund_grace_hours),
            persistence_retries: env_parse("PERSISTENCE_RETRIES")
                .unwrap_or(defaults.persistence_retries),
        }
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fulfillment_defaults() {
        let cfg = FulfillmentConfig::default();
        assert_eq!(cfg.queue_threshold, 10);
        assert_eq!(cfg.immediate_batch, 5);
        assert_eq!(cfg.max_queue_attempts, 3);
        assert_eq!(cfg.refund_grace_hours, 12);
        assert!(cfg.immediate_batch <= cfg.queue_threshold);
    }

    #[test]
    fn test_env_parse_covers_each_knob_type() {
        // The knobs span four numeric types; each must parse independently.
        std::env::set_var("FULFILLMENT_BATCH_SIZE", "7");
        std::env::set_var("FULFILLMENT_BATCH_DELAY_MS", "250");
        std::env::set_var("QUEUE_MAX_ATTEMPTS", "4");
        std::env::set_var("REFUND_GRACE_HOURS", "24");

        let cfg = FulfillmentConfig::from_env();
        assert_eq!(cfg.batch_size, 7);
        assert_eq!(cfg.inter_batch_delay_ms, 250);
        assert_eq!(cfg.max_queue_attempts, 4);
        assert_eq!(cfg.refund_grace_hours, 24);

        std::env::remove_var("FULFILLMENT_BATCH_SIZE");
        std::env::remove_var("FULFILLMENT_BATCH_DELAY_MS");
        std::env::remove_var("QUEUE_MAX_ATTEMPTS");
        std::env::remove_var("REFUND_GRACE_HOURS");
    }
}
