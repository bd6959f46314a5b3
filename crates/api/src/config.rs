//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis
    pub redis_url: String,

    // Stripe
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub stripe_price_unit: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),

            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),

            stripe_secret_key: env::var("STRIPE_SECRET_KEY")
                .map_err(|_| ConfigError::Missing("STRIPE_SECRET_KEY"))?,
            stripe_webhook_secret: {
                let secret = env::var("STRIPE_WEBHOOK_SECRET")
                    .map_err(|_| ConfigError::Missing("STRIPE_WEBHOOK_SECRET"))?;
                if secret.len() < 16 {
                    return Err(ConfigError::WeakSecret(
                        "STRIPE_WEBHOOK_SECRET must be at least 16 characters",
                    ));
                }
                secret
            },
            stripe_price_unit: env::var("STRIPE_PRICE_UNIT")
                .map_err(|_| ConfigError::Missing("STRIPE_PRICE_UNIT"))?,
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_required_vars() {
        env::set_var("DATABASE_URL", "postgres://localhost/keymint_test");
        env::set_var("STRIPE_SECRET_KEY", "sk_test_xxx");
        env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_test123secret456");
        env::set_var("STRIPE_PRICE_UNIT", "price_unit_test");
    }

    #[test]
    #[serial]
    fn test_config_from_env_with_defaults() {
        set_required_vars();
        env::remove_var("BIND_ADDRESS");
        env::remove_var("DATABASE_MAX_CONNECTIONS");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.database_max_connections, 20);
    }

    #[test]
    #[serial]
    fn test_config_missing_database_url() {
        set_required_vars();
        env::remove_var("DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    #[serial]
    fn test_config_rejects_short_webhook_secret() {
        set_required_vars();
        env::set_var("STRIPE_WEBHOOK_SECRET", "short");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::WeakSecret(_)));
    }
}
