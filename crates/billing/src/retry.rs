//! Idempotency & retry kernel
//!
//! Two primitives everything else builds on: an exponential-backoff wrapper
//! for external calls that only retries transient failures, and a persisted
//! idempotency store that short-circuits re-delivered operations.

use std::future::Future;
use std::time::Duration;

use sqlx::PgPool;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::error::{BillingError, BillingResult};

/// Base delay for the first retry
const RETRY_BASE_DELAY_MS: u64 = 250;
/// Upper bound on any single backoff delay
const RETRY_MAX_DELAY: Duration = Duration::from_secs(8);
/// Retries after the initial attempt
const MAX_RETRIES: usize = 3;

/// Run an external call with exponential backoff and jitter.
///
/// Only errors where [`BillingError::is_transient`] holds are retried;
/// permanent errors (validation, signature, not-found) surface immediately.
pub async fn with_backoff<T, F, Fut>(op_name: &str, op: F) -> BillingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BillingResult<T>>,
{
    with_backoff_attempts(op_name, MAX_RETRIES, op).await
}

/// Same kernel with a caller-chosen retry count, for operations whose
/// budget comes from configuration
pub async fn with_backoff_attempts<T, F, Fut>(
    op_name: &str,
    max_retries: usize,
    mut op: F,
) -> BillingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BillingResult<T>>,
{
    let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY_MS)
        .max_delay(RETRY_MAX_DELAY)
        .take(max_retries)
        .map(jitter);

    Retry::spawn(retry_strategy, || {
        let fut = op();
        async {
            let result = fut.await;
            match &result {
                Ok(_) => Ok(result),
                Err(e) if e.is_transient() => {
                    tracing::debug!(
                        operation = %op_name,
                        error = %e,
                        "Transient error - will retry"
                    );
                    Err(result) // Return error to trigger retry
                }
                Err(e) => {
                    tracing::debug!(
                        operation = %op_name,
                        error = %e,
                        "Permanent error - will not retry"
                    );
                    Ok(result) // Stop retrying, carry the error out
                }
            }
        }
    })
    .await
    .unwrap_or_else(|e| e)
}

/// Check-and-record idempotency markers keyed by operation identity.
///
/// The first caller to record a key wins; later callers see the cached
/// result and must not repeat the operation's side effects.
pub struct IdempotencyStore {
    pool: PgPool,
}

impl IdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build the conventional key for an operation on a resource
    pub fn key(operation: &str, resource: &str) -> String {
        format!("{}:{}", operation, resource)
    }

    /// Return the cached result for an operation key, if one was recorded
    pub async fn check(&self, key: &str) -> BillingResult<Option<serde_json::Value>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT result FROM idempotency_records WHERE operation_key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(result,)| result))
    }

    /// Record a result for an operation key. Returns false when another
    /// caller recorded it first (the stored result then wins).
    pub async fn record(&self, key: &str, result: &serde_json::Value) -> BillingResult<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_records (operation_key, result)
            VALUES ($1, $2)
            ON CONFLICT (operation_key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(result)
        .execute(&self.pool)
        .await?;

        Ok(inserted.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_idempotency_key_format() {
        assert_eq!(
            IdempotencyStore::key("teardown", "KM-ABC123"),
            "teardown:KM-ABC123"
        );
    }

    #[tokio::test]
    async fn test_with_backoff_retries_transient() {
        let calls = AtomicUsize::new(0);
        let result = with_backoff("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BillingError::RateLimited)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_backoff_permanent_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: BillingResult<()> = with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BillingError::SignatureInvalid) }
        })
        .await;

        assert!(matches!(result, Err(BillingError::SignatureInvalid)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_backoff_exhausts_attempts() {
        let calls = AtomicUsize::new(0);
        let result: BillingResult<()> = with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BillingError::RateLimited) }
        })
        .await;

        assert!(matches!(result, Err(BillingError::RateLimited)));
        // Initial attempt + MAX_RETRIES
        assert_eq!(calls.load(Ordering::SeqCst), 1 + MAX_RETRIES);
    }

    #[tokio::test]
    async fn test_with_backoff_attempts_honors_custom_budget() {
        let calls = AtomicUsize::new(0);
        let result: BillingResult<()> = with_backoff_attempts("test", 1, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BillingError::RateLimited) }
        })
        .await;

        assert!(matches!(result, Err(BillingError::RateLimited)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
