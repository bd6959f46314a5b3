//! Stripe webhook endpoint

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::json;

use keymint_billing::webhook::WebhookOutcome;
use keymint_billing::BillingError;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Receive a Stripe event delivery.
///
/// Only a bad signature or an unparseable payload is answered with a 4xx.
/// Processing failures after the claim are acknowledged with 200: the payment
/// already happened on Stripe's side, and a retried delivery would be
/// rejected by the event claim anyway. The background sweeps pick up the
/// shortfall.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: String,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing stripe-signature header".to_string()))?;

    match state.webhooks.process(&payload, signature).await {
        Ok(outcome) => {
            let received = matches!(outcome, WebhookOutcome::Processed);
            Ok((
                StatusCode::OK,
                Json(json!({ "received": received, "outcome": outcome })),
            ))
        }
        Err(BillingError::SignatureInvalid) => Err(BillingError::SignatureInvalid.into()),
        Err(BillingError::MalformedMetadata(m)) => Err(ApiError::BadRequest(m)),
        Err(e) => {
            tracing::error!(error = %e, "Webhook processing failed after claim");
            Ok((
                StatusCode::OK,
                Json(json!({ "received": true, "outcome": "failed" })),
            ))
        }
    }
}
