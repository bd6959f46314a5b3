//! Keymint API Library
//!
//! HTTP surface for the fulfillment platform: the Stripe webhook endpoint,
//! license activation/deactivation, site teardown, and queue inspection.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
