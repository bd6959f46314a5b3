//! Keymint billing: webhook-driven license fulfillment on top of Stripe
//!
//! Turns confirmed payment events into durable entitlements: billing
//! subscriptions, unique license keys, and site bindings. There is no
//! cross-store transaction between Stripe, Postgres and the license cache;
//! consistency comes from idempotency markers, upserts, and compensating
//! actions (duplicate-subscription cancellation, refunds, snapshot rollback).

pub mod activation;
pub mod classify;
pub mod client;
pub mod error;
pub mod events;
pub mod fulfillment;
pub mod license;
pub mod queue;
pub mod refunds;
pub mod retry;
pub mod subscriptions;
pub mod teardown;
pub mod webhook;

pub use client::{FulfillmentConfig, StripeClient, StripeConfig};
pub use error::{BillingError, BillingResult};
