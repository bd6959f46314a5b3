//! API routes

pub mod health;
pub mod licenses;
pub mod queue;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Webhook route (public, uses signature verification)
    let webhook_routes = Router::new().route("/webhooks/stripe", post(webhooks::stripe_webhook));

    // License and fulfillment routes - under /api/v1
    let api_v1_routes = Router::new()
        .route("/licenses/activate", post(licenses::activate))
        .route("/licenses/deactivate", post(licenses::deactivate))
        .route("/sites/remove", post(licenses::remove_site))
        .route("/queue/:payment_intent_id", get(queue::payment_status));

    Router::new()
        .merge(health_routes)
        .merge(webhook_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
