//! Deferred provisioning status endpoint

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use serde_json::json;

use keymint_billing::queue::QueueStatusCounts;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Serialize)]
pub struct PaymentQueueStatus {
    pub payment_intent_id: String,
    pub counts: QueueStatusCounts,
    pub total: i64,
    pub items: Vec<serde_json::Value>,
}

/// Report provisioning progress for one payment. Lets a storefront poll
/// whether a large quantity purchase has finished draining.
pub async fn payment_status(
    State(state): State<AppState>,
    Path(payment_intent_id): Path<String>,
) -> ApiResult<Json<PaymentQueueStatus>> {
    let queue = state.webhooks.fulfillment().queue();

    let counts = queue.status_counts(&payment_intent_id).await?;
    let items = queue.items_for_payment(&payment_intent_id).await?;

    let items = items
        .into_iter()
        .map(|item| {
            json!({
                "license_key": item.license_key,
                "status": item.status,
                "attempts": item.attempts,
                "next_retry_at": item.next_retry_at.map(|t| t.unix_timestamp()),
                "error_message": item.error_message,
            })
        })
        .collect();

    let total = counts.total();
    Ok(Json(PaymentQueueStatus {
        payment_intent_id,
        counts,
        total,
        items,
    }))
}
