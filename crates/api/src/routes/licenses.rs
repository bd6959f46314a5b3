//! License activation, deactivation, and site teardown endpoints

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub license_key: String,
    pub site_domain: String,
    /// Stripe customer id asserted by the caller, checked against the license
    pub customer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeactivateRequest {
    pub license_key: String,
    pub customer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RemoveSiteRequest {
    pub license_key: String,
    pub customer_id: Option<String>,
}

fn validated_key(license_key: &str) -> ApiResult<&str> {
    let key = license_key.trim();
    if key.is_empty() {
        return Err(ApiError::Validation("license_key is required".to_string()));
    }
    Ok(key)
}

/// Bind a license to a site (or rebind it to a new one)
pub async fn activate(
    State(state): State<AppState>,
    Json(req): Json<ActivateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let key = validated_key(&req.license_key)?;
    let domain = req.site_domain.trim();
    if domain.is_empty() {
        return Err(ApiError::Validation("site_domain is required".to_string()));
    }

    let outcome = state
        .activation
        .activate(key, domain, req.customer_id.as_deref())
        .await?;

    Ok(Json(json!({
        "success": true,
        "status": "used",
        "license_key": outcome.license_key,
        "site_domain": outcome.site_domain,
        "previous_site": outcome.previous_site,
        "was_update": outcome.was_update,
    })))
}

/// Release a quantity license and schedule its subscription for cancellation
pub async fn deactivate(
    State(state): State<AppState>,
    Json(req): Json<DeactivateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let key = validated_key(&req.license_key)?;

    state
        .activation
        .deactivate(key, req.customer_id.as_deref())
        .await?;

    Ok(Json(json!({ "success": true, "license_key": key })))
}

/// Tear down a site-bound license: local deactivation plus billing
/// cancellation, rolled back together on failure
pub async fn remove_site(
    State(state): State<AppState>,
    Json(req): Json<RemoveSiteRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let key = validated_key(&req.license_key)?;

    let outcome = state
        .teardown
        .remove_site(key, req.customer_id.as_deref())
        .await?;

    Ok(Json(json!({
        "success": true,
        "license_key": outcome.license_key,
        "site_domain": outcome.site_domain,
        "subscription_id": outcome.subscription_id,
        "cancel_at_period_end": outcome.cancel_at_period_end,
        "already_completed": outcome.already_completed,
    })))
}
