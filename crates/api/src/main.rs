//! Sightline API server

use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sightline_api::{create_router, AppState, Config};
use sightline_billing::BillingService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    // Migrations run sequentially on a single connection with a longer
    // acquire timeout; the pool is released before serving traffic.
    let migration_pool = sightline_shared::create_migration_pool(&config.database_url).await?;
    sightline_shared::run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    let pool = sightline_shared::create_pool(&config.database_url).await?;
    tracing::info!("Database ready");

    let redis_client = redis::Client::open(config.redis_url.clone())?;
    let redis = redis::aio::ConnectionManager::new(redis_client).await?;
    tracing::info!("Redis connected");

    let billing = BillingService::from_env(pool.clone(), redis.clone())?;

    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, pool, redis, billing);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "Sightline API listening");
    axum::serve(listener, app).await?;

    Ok(())
}
