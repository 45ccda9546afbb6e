//! Shared application state

use std::sync::Arc;

use redis::aio::ConnectionManager;
use sqlx::PgPool;

use sightline_billing::BillingService;

use crate::auth::SessionTokenManager;
use crate::config::Config;

/// State shared across all request handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub redis: ConnectionManager,
    pub billing: Arc<BillingService>,
    pub sessions: SessionTokenManager,
}

impl AppState {
    pub fn new(
        config: Config,
        pool: PgPool,
        redis: ConnectionManager,
        billing: BillingService,
    ) -> Self {
        let sessions = SessionTokenManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        Self {
            config: Arc::new(config),
            pool,
            redis,
            billing: Arc::new(billing),
            sessions,
        }
    }
}
