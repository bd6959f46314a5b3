//! License key minting and persistence
//!
//! A license row is only ever written after the billing service confirmed the
//! backing subscription exists. Keys are globally unique and never reused;
//! rows are never deleted, only flipped inactive.

use rand::distributions::Alphanumeric;
use rand::Rng;
use sqlx::PgPool;
use uuid::Uuid;

use keymint_shared::{License, LicenseCache, LicenseStatus, PurchaseType};

use crate::error::{BillingError, BillingResult};

/// Key format: KM- prefix plus 24 alphanumeric characters
const KEY_PREFIX: &str = "KM-";
const KEY_LENGTH: usize = 24;

/// Attempts to mint a collision-free key before giving up. Collisions on a
/// 24-char alphanumeric key are practically impossible; this bound exists so
/// a corrupt RNG can't loop forever.
const MAX_MINT_ATTEMPTS: usize = 5;

/// Generate one candidate license key
pub fn generate_license_key() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_LENGTH)
        .map(char::from)
        .collect();
    format!("{}{}", KEY_PREFIX, suffix.to_uppercase())
}

/// Parameters for creating a license row after billing-side confirmation
#[derive(Debug, Clone)]
pub struct NewLicense {
    pub license_key: String,
    pub customer_id: String,
    pub stripe_subscription_id: String,
    pub stripe_item_id: Option<String>,
    /// Set for site purchases, None for quantity purchases
    pub site_domain: Option<String>,
    pub purchase_type: PurchaseType,
}

/// Service for license persistence and lookup
#[derive(Clone)]
pub struct LicenseService {
    pool: PgPool,
    cache: Option<LicenseCache>,
}

impl LicenseService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, cache: None }
    }

    pub fn with_cache(mut self, cache: LicenseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Mint a key that is guaranteed not to exist in the store yet
    pub async fn mint_unique_key(&self) -> BillingResult<String> {
        for _ in 0..MAX_MINT_ATTEMPTS {
            let key = generate_license_key();
            let exists: Option<(i32,)> =
                sqlx::query_as("SELECT 1 FROM licenses WHERE license_key = $1")
                    .bind(&key)
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                return Ok(key);
            }
            tracing::warn!(license_key = %key, "License key collision, re-minting");
        }
        Err(BillingError::Internal(
            "Failed to mint a unique license key".to_string(),
        ))
    }

    /// Insert a license row unless the key already exists.
    ///
    /// The existence check doubles as webhook-redelivery protection: a
    /// re-delivered event carrying the same pre-generated keys hits the
    /// conflict and creates no duplicate rows. Returns true when a new row
    /// was created.
    pub async fn create_license(&self, new: &NewLicense) -> BillingResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO licenses (
                id, license_key, customer_id, stripe_subscription_id, stripe_item_id,
                site_domain, used_site_domain, status, purchase_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, NULL, 'active', $7)
            ON CONFLICT (license_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.license_key)
        .bind(&new.customer_id)
        .bind(&new.stripe_subscription_id)
        .bind(&new.stripe_item_id)
        .bind(&new.site_domain)
        .bind(new.purchase_type.as_str())
        .execute(&self.pool)
        .await?;

        let created = inserted.rows_affected() > 0;
        if created {
            tracing::info!(
                license_key = %new.license_key,
                customer_id = %new.customer_id,
                subscription_id = %new.stripe_subscription_id,
                purchase_type = %new.purchase_type,
                "License created"
            );
        } else {
            tracing::info!(
                license_key = %new.license_key,
                "License already exists - skipping duplicate insert"
            );
        }
        Ok(created)
    }

    /// Get a license by key, consulting the cache first
    pub async fn get_by_key(&self, license_key: &str) -> BillingResult<Option<License>> {
        if let Some(cache) = &self.cache {
            if let Some(license) = cache.get(license_key).await {
                return Ok(Some(license));
            }
        }

        let license: Option<License> =
            sqlx::query_as("SELECT * FROM licenses WHERE license_key = $1")
                .bind(license_key)
                .fetch_optional(&self.pool)
                .await?;

        if let (Some(cache), Some(license)) = (&self.cache, &license) {
            cache.put(license).await;
        }

        Ok(license)
    }

    /// Whether any license already covers this site for this customer
    pub async fn exists_for_site(
        &self,
        customer_id: &str,
        site_domain: &str,
    ) -> BillingResult<bool> {
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM licenses
            WHERE customer_id = $1 AND site_domain = $2 AND status = 'active'
            "#,
        )
        .bind(customer_id)
        .bind(site_domain)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    /// Overwrite the bound site domain. Rebinding replaces, never appends.
    /// Returns the previous bound domain.
    pub async fn bind_site(
        &self,
        license_key: &str,
        site_domain: &str,
    ) -> BillingResult<Option<String>> {
        let previous: Option<(Option<String>,)> =
            sqlx::query_as("SELECT used_site_domain FROM licenses WHERE license_key = $1")
                .bind(license_key)
                .fetch_optional(&self.pool)
                .await?;

        let (previous,) = previous
            .ok_or_else(|| BillingError::LicenseNotFound(license_key.to_string()))?;

        sqlx::query(
            "UPDATE licenses SET used_site_domain = $2, updated_at = NOW() WHERE license_key = $1",
        )
        .bind(license_key)
        .bind(site_domain)
        .execute(&self.pool)
        .await?;

        if let Some(cache) = &self.cache {
            cache.invalidate(license_key).await;
        }

        Ok(previous)
    }

    /// Flip license status. Rows are never deleted.
    pub async fn set_status(
        &self,
        license_key: &str,
        status: LicenseStatus,
    ) -> BillingResult<()> {
        let updated = sqlx::query(
            "UPDATE licenses SET status = $2, updated_at = NOW() WHERE license_key = $1",
        )
        .bind(license_key)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(BillingError::LicenseNotFound(license_key.to_string()));
        }

        if let Some(cache) = &self.cache {
            cache.invalidate(license_key).await;
        }

        Ok(())
    }

    /// Flip every license on a subscription inactive (teardown path)
    pub async fn deactivate_for_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Vec<String>> {
        let keys: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE licenses
            SET status = 'inactive', updated_at = NOW()
            WHERE stripe_subscription_id = $1 AND status = 'active'
            RETURNING license_key
            "#,
        )
        .bind(stripe_subscription_id)
        .fetch_all(&self.pool)
        .await?;

        let keys: Vec<String> = keys.into_iter().map(|(k,)| k).collect();
        if let Some(cache) = &self.cache {
            for key in &keys {
                cache.invalidate(key).await;
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_format() {
        let key = generate_license_key();
        assert!(key.starts_with(KEY_PREFIX));
        assert_eq!(key.len(), KEY_PREFIX.len() + KEY_LENGTH);
        assert!(key[KEY_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_generated_keys_are_distinct() {
        let keys: HashSet<String> = (0..1000).map(|_| generate_license_key()).collect();
        assert_eq!(keys.len(), 1000);
    }
}
