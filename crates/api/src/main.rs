//! Keymint API server

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use keymint_api::{routes::create_router, AppState, Config};
use keymint_shared::cache::LicenseCache;
use keymint_shared::db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let migration_pool = db::create_migration_pool(&config.database_url)
        .await
        .context("Failed to connect for migrations")?;
    db::run_migrations(&migration_pool)
        .await
        .context("Failed to run migrations")?;
    migration_pool.close().await;

    let pool = db::create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to create database pool")?;

    // Cache is optional: a down Redis degrades lookups, it doesn't stop boot
    let cache = match LicenseCache::connect(&config.redis_url).await {
        Ok(cache) => Some(cache),
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable, license cache disabled");
            None
        }
    };

    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, pool, cache);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!(address = %bind_address, "API server listening");

    axum::serve(listener, app)
        .await
        .context("Server terminated")?;

    Ok(())
}
