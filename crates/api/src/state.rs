//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;

use keymint_billing::activation::ActivationService;
use keymint_billing::license::LicenseService;
use keymint_billing::teardown::TeardownService;
use keymint_billing::webhook::WebhookProcessor;
use keymint_billing::{FulfillmentConfig, StripeClient, StripeConfig};
use keymint_shared::cache::LicenseCache;

/// Shared application state, cheap to clone into every handler
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<crate::Config>,
    pub webhooks: WebhookProcessor,
    pub activation: ActivationService,
    pub teardown: TeardownService,
}

impl AppState {
    /// Wire up all services over one pool and one Stripe client.
    ///
    /// The license cache is optional so the API can come up when Redis is
    /// unreachable; lookups then always go to Postgres.
    pub fn new(config: crate::Config, pool: PgPool, cache: Option<LicenseCache>) -> Self {
        let stripe = StripeClient::new(StripeConfig {
            secret_key: config.stripe_secret_key.clone(),
            webhook_secret: config.stripe_webhook_secret.clone(),
            unit_price_id: config.stripe_price_unit.clone(),
            unit_price_cents: std::env::var("UNIT_PRICE_CENTS")
                .ok()
                .and_then(|v| v.parse().ok()),
        });
        Self::with_stripe(config, pool, stripe, cache)
    }

    pub fn with_stripe(
        config: crate::Config,
        pool: PgPool,
        stripe: StripeClient,
        cache: Option<LicenseCache>,
    ) -> Self {
        let licenses = match cache {
            Some(cache) => LicenseService::new(pool.clone()).with_cache(cache),
            None => LicenseService::new(pool.clone()),
        };

        let webhooks =
            WebhookProcessor::new(stripe.clone(), pool.clone(), FulfillmentConfig::from_env())
                .with_licenses(licenses.clone());
        let activation =
            ActivationService::new(stripe.clone(), pool.clone()).with_licenses(licenses.clone());
        let teardown = TeardownService::new(stripe, pool.clone()).with_licenses(licenses);

        Self {
            pool,
            config: Arc::new(config),
            webhooks,
            activation,
            teardown,
        }
    }
}
