//! Redis-backed license lookup cache
//!
//! Caches license-key lookups so activation checks don't always hit Postgres.
//! The cache is strictly best-effort: every write failure is logged and
//! swallowed, the relational store stays the source of truth.

use redis::{aio::ConnectionManager, AsyncCommands};

use crate::types::License;

/// Default cache TTL in seconds (15 minutes)
const DEFAULT_TTL_SECS: u64 = 900;

fn cache_key(license_key: &str) -> String {
    format!("license:{}", license_key)
}

/// Thread-safe license cache backed by Redis
#[derive(Clone)]
pub struct LicenseCache {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl LicenseCache {
    /// Connect to Redis and return a cache handle
    pub async fn connect(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            ttl_secs: DEFAULT_TTL_SECS,
        })
    }

    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Get a cached license by key. Returns None on miss or any cache error.
    pub async fn get(&self, license_key: &str) -> Option<License> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = match conn.get(cache_key(license_key)).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "License cache read failed");
                return None;
            }
        };
        raw.and_then(|json| serde_json::from_str(&json).ok())
    }

    /// Cache a license record (best-effort)
    pub async fn put(&self, license: &License) {
        let json = match serde_json::to_string(license) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize license for cache");
                return;
            }
        };
        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(cache_key(&license.license_key), json, self.ttl_secs)
            .await
        {
            tracing::warn!(
                license_key = %license.license_key,
                error = %e,
                "License cache write failed"
            );
        }
    }

    /// Drop a license from the cache (best-effort). Called after any mutation
    /// so stale entitlement state never outlives the TTL.
    pub async fn invalidate(&self, license_key: &str) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn.del::<_, ()>(cache_key(license_key)).await {
            tracing::warn!(
                license_key = %license_key,
                error = %e,
                "License cache invalidation failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_format() {
        assert_eq!(cache_key("KM-ABC123"), "license:KM-ABC123");
    }
}
