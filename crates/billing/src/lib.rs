// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Sightline Billing Module
//!
//! The enterprise licensing and billing-reconciliation core. It keeps an
//! eventually-consistent local mirror of the remote billing service's view
//! of each organization, gated by a cryptographically verified license key.
//!
//! ## Features
//!
//! - **Licenses**: activation, "first valid" selection, instance-wide cache
//! - **Billing tokens**: short-lived HS256 assertions signed with the
//!   license secret, including audited privilege escalation
//! - **Billing sync**: fetch remote status, merge usage/entitlements into
//!   local rows, free-tier fallback for unlicensed installs
//! - **Usage reporting**: scheduled per-organization reports with
//!   per-organization failure isolation
//! - **Row tracking**: advisory pre-flight guard for external data syncs
//! - **Audit log**: append-only record of sensitive billing operations

pub mod audit;
pub mod client;
pub mod error;
pub mod license;
pub mod manager;
pub mod products;
pub mod row_tracking;
pub mod token;
pub mod usage_report;

use std::sync::Arc;

use redis::aio::ConnectionManager;
use sqlx::PgPool;

// Audit
pub use audit::{ActorType, AuditEvent, AuditEventBuilder, AuditEventType, BillingAuditLogger};

// Client
pub use client::{
    BillingApiClient, BillingApiConfig, BillingCustomer, BillingProduct, BillingStatus,
    LicenseActivation, RemoteLicense, UsageSummary,
};

// Error
pub use error::{BillingError, BillingResult};

// License
pub use license::{InstanceLicenseCache, LicenseRepository};

// Manager
pub use manager::{BillingManager, BillingResponse, LicensePlan};

// Products
pub use products::{default_products, CurrentUsage};

// Row tracking
pub use row_tracking::{BillingLimitGuard, RowTracker};

// Token
pub use token::{BillingTokenIssuer, BillingTokenClaims, BILLING_TOKEN_AUDIENCE};

// Usage report
pub use usage_report::{OrgUsageReport, TeamUsageReport, UsageReportOutcome, UsageReporter};

/// Everything the api and worker binaries need, wired once.
#[derive(Clone)]
pub struct BillingService {
    pub manager: BillingManager,
    pub licenses: LicenseRepository,
    pub license_cache: Arc<InstanceLicenseCache>,
    pub client: BillingApiClient,
    pub reporter: UsageReporter,
    pub tracker: RowTracker,
    pub guard: BillingLimitGuard,
    pub audit: BillingAuditLogger,
}

impl BillingService {
    pub fn new(
        pool: PgPool,
        redis: ConnectionManager,
        client: BillingApiClient,
        usage_cache_ttl_max: u64,
    ) -> Self {
        let licenses = LicenseRepository::new(pool.clone());
        let license_cache = Arc::new(InstanceLicenseCache::new(licenses.clone()));
        let manager = BillingManager::new(
            pool.clone(),
            redis.clone(),
            client.clone(),
            usage_cache_ttl_max,
        );
        let reporter = UsageReporter::new(pool.clone(), client.clone());
        let tracker = RowTracker::new(redis);
        let guard = BillingLimitGuard::new(pool.clone(), tracker.clone());
        let audit = BillingAuditLogger::new(pool);

        Self {
            manager,
            licenses,
            license_cache,
            client,
            reporter,
            tracker,
            guard,
            audit,
        }
    }

    /// Wire from `BILLING_SERVICE_URL` / `LICENSE_ACTIVATION_URL` /
    /// `USAGE_CACHE_TTL_SECS`.
    pub fn from_env(pool: PgPool, redis: ConnectionManager) -> BillingResult<Self> {
        let client = BillingApiClient::from_env()?;
        let manager = BillingManager::from_env(pool.clone(), redis.clone())?;
        let licenses = LicenseRepository::new(pool.clone());
        let license_cache = Arc::new(InstanceLicenseCache::new(licenses.clone()));
        let reporter = UsageReporter::new(pool.clone(), client.clone());
        let tracker = RowTracker::new(redis);
        let guard = BillingLimitGuard::new(pool.clone(), tracker.clone());
        let audit = BillingAuditLogger::new(pool);

        Ok(Self {
            manager,
            licenses,
            license_cache,
            client,
            reporter,
            tracker,
            guard,
            audit,
        })
    }
}
