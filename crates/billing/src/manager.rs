//! Billing orchestration.
//!
//! One network round trip per operation: build a token, call the billing
//! service, merge what it reports back into the local License and
//! Organization rows, assemble the response. No retries anywhere in this
//! path; concurrent refreshes converge because every write is an idempotent
//! merge.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Date, Duration, Month, OffsetDateTime, Time};
use uuid::Uuid;

use sightline_shared::{
    BillingPeriod, License, MetricUsageUpdate, Organization, OrganizationUsage, UsageMetric, User,
};

use crate::client::{
    BillingApiClient, BillingCustomer, BillingPeriodPayload, BillingProduct, RemoteLicense,
    UsageSummary,
};
use crate::error::{BillingError, BillingResult};
use crate::license::LicenseRepository;
use crate::products::{default_products, CurrentUsage};
use crate::token::BillingTokenIssuer;

const USAGE_CACHE_KEY_PREFIX: &str = "billing:current_usage:";
const DEFAULT_USAGE_CACHE_TTL_SECS: u64 = 43_200;

/// Licenses within this window of expiry get their validity pushed out.
const LICENSE_RENEWAL_WINDOW_DAYS: i64 = 29;
/// How far validity is pushed out on refresh.
const LICENSE_EXTENSION_DAYS: i64 = 30;

// =============================================================================
// Response assembly
// =============================================================================

/// Plan summary echoed back for licensed instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicensePlan {
    pub plan: String,
}

/// Assembled billing status returned to API clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingResponse {
    pub available_features: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<LicensePlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub deactivated: bool,
    #[serde(default)]
    pub has_active_subscription: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_period: Option<BillingPeriodPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_summary: Option<UsageSummary>,
    pub products: Vec<BillingProduct>,
}

// =============================================================================
// Pure merge rules
// =============================================================================

/// What to write back to the license after a refresh, if anything.
///
/// The plan follows whatever the billing service reports. Validity is an
/// artifact maintained by the refresh cycle itself: whenever it is unset or
/// within the renewal window it is pushed out by a flat extension, so a
/// healthy instance never sees its license lapse between refreshes.
fn license_refresh(
    license: &License,
    remote: &RemoteLicense,
    now: OffsetDateTime,
) -> Option<(String, Option<OffsetDateTime>)> {
    let mut changed = false;

    let mut plan = license.plan.clone();
    if license.plan != remote.plan {
        plan = remote.plan.clone();
        changed = true;
    }

    let mut valid_until = license.valid_until;
    let renewal_window = now + Duration::days(LICENSE_RENEWAL_WINDOW_DAYS);
    if valid_until.map_or(true, |v| v < renewal_window) {
        valid_until = Some(now + Duration::days(LICENSE_EXTENSION_DAYS));
        changed = true;
    }

    changed.then_some((plan, valid_until))
}

/// Merge the customer payload into an organization's usage state.
///
/// Active subscriptions report per-product usage; unsubscribed customers get
/// the last usage summary snapshot. Either way each metric goes through the
/// overlay op, so locally stamped quota fields and unmentioned sibling
/// metrics survive, and re-applying the same payload is a no-op.
fn merge_remote_usage(current: &OrganizationUsage, customer: &BillingCustomer) -> OrganizationUsage {
    let mut merged = current.clone();

    if customer.has_active_subscription {
        if let Some(products) = &customer.products {
            for product in products {
                let key = product.usage_key.as_deref().unwrap_or(&product.product_type);
                if let Some(metric) = UsageMetric::from_product_type(key) {
                    merged.apply_remote_metric(
                        metric,
                        &MetricUsageUpdate {
                            usage: product.current_usage,
                            limit: product.usage_limit,
                            todays_usage: product.todays_usage,
                        },
                    );
                }
            }
        }
    } else if let Some(summary) = &customer.usage_summary {
        if let Some(update) = &summary.events {
            merged.apply_remote_metric(UsageMetric::Events, update);
        }
        if let Some(update) = &summary.recordings {
            merged.apply_remote_metric(UsageMetric::Recordings, update);
        }
        if let Some(update) = &summary.rows_synced {
            merged.apply_remote_metric(UsageMetric::RowsSynced, update);
        }
    }

    if let Some(period) = &customer.billing_period {
        merged.period = Some(BillingPeriod {
            start: period.current_period_start,
            end: period.current_period_end,
        });
    }

    merged
}

/// First instant of the month containing `now` (UTC).
pub fn current_month_start(now: OffsetDateTime) -> OffsetDateTime {
    let date = Date::from_calendar_date(now.year(), now.month(), 1).unwrap_or(now.date());
    date.with_time(Time::MIDNIGHT).assume_utc()
}

/// First instant of the month after the one containing `now` (UTC).
pub fn next_month_start(now: OffsetDateTime) -> OffsetDateTime {
    let month = now.month().next();
    let year = if month == Month::January {
        now.year() + 1
    } else {
        now.year()
    };
    let date = Date::from_calendar_date(year, month, 1).unwrap_or(now.date());
    date.with_time(Time::MIDNIGHT).assume_utc()
}

/// Cache TTL for fallback usage: the configured max, but never past the end
/// of the current month, where the counts reset.
fn usage_cache_ttl(max_ttl_secs: u64, now: OffsetDateTime) -> u64 {
    let until_month_end = (next_month_start(now) - now).whole_seconds().max(1) as u64;
    max_ttl_secs.min(until_month_end)
}

// =============================================================================
// Manager
// =============================================================================

/// Orchestrates billing-service calls and local state sync
#[derive(Clone)]
pub struct BillingManager {
    pool: PgPool,
    redis: ConnectionManager,
    client: BillingApiClient,
    issuer: BillingTokenIssuer,
    licenses: LicenseRepository,
    usage_cache_ttl_max: u64,
}

impl BillingManager {
    pub fn new(
        pool: PgPool,
        redis: ConnectionManager,
        client: BillingApiClient,
        usage_cache_ttl_max: u64,
    ) -> Self {
        let issuer = BillingTokenIssuer::new(pool.clone());
        let licenses = LicenseRepository::new(pool.clone());
        Self {
            pool,
            redis,
            client,
            issuer,
            licenses,
            usage_cache_ttl_max,
        }
    }

    /// Build from `BILLING_SERVICE_URL`/`LICENSE_ACTIVATION_URL` and
    /// `USAGE_CACHE_TTL_SECS`.
    pub fn from_env(pool: PgPool, redis: ConnectionManager) -> BillingResult<Self> {
        let client = BillingApiClient::from_env()?;
        let ttl = match std::env::var("USAGE_CACHE_TTL_SECS") {
            Ok(raw) => raw.parse().map_err(|_| {
                BillingError::Config(format!("invalid USAGE_CACHE_TTL_SECS: {}", raw))
            })?,
            Err(_) => DEFAULT_USAGE_CACHE_TTL_SECS,
        };
        Ok(Self::new(pool, redis, client, ttl))
    }

    /// Current billing status for `organization`.
    ///
    /// V2-licensed instances hit the billing service and sync its answer
    /// into the local license and organization rows. Everything else gets
    /// the free-tier catalog with locally computed usage; a missing remote
    /// subscription is a supported state, not an error.
    pub async fn get_billing(
        &self,
        license: Option<&License>,
        organization: &Organization,
        user: Option<&User>,
        query: &[(String, String)],
    ) -> BillingResult<BillingResponse> {
        let Some(license) = license.filter(|l| l.is_v2()) else {
            return self.unsubscribed_response(organization, None).await;
        };

        let token = self
            .issuer
            .build_token(Some(license), Some(organization), user, None)
            .await?;

        let Some(status) = self.client.get_billing(&token, query).await? else {
            return self.unsubscribed_response(organization, Some(license)).await;
        };

        let license = match &status.license {
            Some(remote) => self.update_license_details(license, remote).await?,
            None => license.clone(),
        };

        let customer = status.customer.unwrap_or_default();
        let organization = self.update_org_details(organization, &customer).await?;

        let products = match customer.products {
            Some(products) if !products.is_empty() => products,
            _ => {
                let current = self.cached_current_usage(organization.id).await?;
                default_products(&current)
            }
        };

        Ok(BillingResponse {
            available_features: organization.available_features.0.clone(),
            license: Some(LicensePlan {
                plan: license.plan.clone(),
            }),
            customer_id: customer.customer_id,
            deactivated: customer.deactivated,
            has_active_subscription: customer.has_active_subscription,
            billing_period: customer.billing_period,
            usage_summary: customer.usage_summary,
            products,
        })
    }

    /// Sync the license row with what the billing service reports.
    /// Idempotent: a no-op unless the plan changed or validity needs
    /// extending.
    pub async fn update_license_details(
        &self,
        license: &License,
        remote: &RemoteLicense,
    ) -> BillingResult<License> {
        match license_refresh(license, remote, OffsetDateTime::now_utc()) {
            Some((plan, valid_until)) => {
                tracing::info!(license_id = %license.id, plan = %plan, "Refreshing license details");
                self.licenses
                    .update_details(license.id, &plan, valid_until)
                    .await
            }
            None => Ok(license.clone()),
        }
    }

    /// Merge the customer payload into the organization row.
    pub async fn update_org_details(
        &self,
        organization: &Organization,
        customer: &BillingCustomer,
    ) -> BillingResult<Organization> {
        let merged = merge_remote_usage(&organization.usage.0, customer);

        let customer_id = customer
            .customer_id
            .clone()
            .or_else(|| organization.customer_id.clone());

        // An absent feature list means "unchanged", not "none".
        let features = if customer.available_features.is_empty() {
            organization.available_features.0.clone()
        } else {
            customer.available_features.clone()
        };

        let updated: Organization = sqlx::query_as(
            r#"
            UPDATE organizations
            SET customer_id = $2,
                usage = $3,
                available_features = $4,
                updated_at = now()
            WHERE id = $1
            RETURNING id, name, customer_id, usage, available_features,
                      for_internal_metrics, created_at, updated_at
            "#,
        )
        .bind(organization.id)
        .bind(customer_id)
        .bind(sqlx::types::Json(&merged))
        .bind(sqlx::types::Json(&features))
        .fetch_one(&self.pool)
        .await?;

        Ok(updated)
    }

    /// PATCH customer state (custom limits, startup flags), then return the
    /// refreshed status.
    pub async fn update_billing(
        &self,
        license: &License,
        organization: &Organization,
        user: Option<&User>,
        payload: &serde_json::Value,
    ) -> BillingResult<BillingResponse> {
        let token = self
            .issuer
            .build_token(Some(license), Some(organization), user, None)
            .await?;
        self.client.update_billing(&token, payload).await?;

        self.get_billing(Some(license), organization, user, &[]).await
    }

    /// Attach a license key to the organization's billing account and
    /// persist the canonical record the billing service reports for it.
    pub async fn attach_license(
        &self,
        organization: &Organization,
        user: Option<&User>,
        key: &str,
    ) -> BillingResult<License> {
        let transient = License {
            id: Uuid::new_v4(),
            key: key.to_string(),
            plan: String::new(),
            valid_until: None,
            max_users: None,
            created_at: OffsetDateTime::now_utc(),
        };
        if !transient.is_v2() {
            return Err(BillingError::InvalidLicenseKey(
                "license keys must be of the form id::secret".into(),
            ));
        }

        let token = self
            .issuer
            .build_token(Some(&transient), Some(organization), user, None)
            .await?;
        self.client
            .update_billing(&token, &serde_json::json!({ "license": key }))
            .await?;

        let status = self.client.get_billing(&token, &[]).await?;
        let remote = status.and_then(|s| s.license).ok_or_else(|| {
            BillingError::NotFound("billing service reported no license after attach".into())
        })?;

        self.licenses
            .create(key, &remote.plan, remote.valid_until, None)
            .await
    }

    pub async fn get_usage(
        &self,
        license: &License,
        organization: &Organization,
        user: Option<&User>,
        query: &[(String, String)],
    ) -> BillingResult<serde_json::Value> {
        let token = self.token_for(license, organization, user).await?;
        self.client.get_usage(&token, query).await
    }

    pub async fn get_spend(
        &self,
        license: &License,
        organization: &Organization,
        user: Option<&User>,
        query: &[(String, String)],
    ) -> BillingResult<serde_json::Value> {
        let token = self.token_for(license, organization, user).await?;
        self.client.get_spend(&token, query).await
    }

    pub async fn get_invoices(
        &self,
        license: &License,
        organization: &Organization,
        user: Option<&User>,
        status: Option<&str>,
    ) -> BillingResult<serde_json::Value> {
        let token = self.token_for(license, organization, user).await?;
        self.client.get_invoices(&token, status).await
    }

    pub async fn portal_url(
        &self,
        license: &License,
        organization: &Organization,
        user: Option<&User>,
    ) -> BillingResult<String> {
        let token = self.token_for(license, organization, user).await?;
        self.client.portal_url(&token).await
    }

    /// Where to send the browser for the billing service's self-serve
    /// subscription activation flow.
    pub async fn activation_url(
        &self,
        license: &License,
        organization: &Organization,
        user: Option<&User>,
        query: &[(String, String)],
    ) -> BillingResult<String> {
        let token = self.token_for(license, organization, user).await?;
        self.client.activation_url(&token, query)
    }

    pub async fn purchase_credits(
        &self,
        license: &License,
        organization: &Organization,
        user: Option<&User>,
        payload: &serde_json::Value,
    ) -> BillingResult<serde_json::Value> {
        let token = self.token_for(license, organization, user).await?;
        self.client.purchase_credits(&token, payload).await
    }

    pub async fn activate_trial(
        &self,
        license: &License,
        organization: &Organization,
        user: Option<&User>,
        payload: &serde_json::Value,
    ) -> BillingResult<serde_json::Value> {
        let token = self.token_for(license, organization, user).await?;
        self.client.activate_trial(&token, payload).await
    }

    pub async fn apply_startup_program(
        &self,
        license: &License,
        organization: &Organization,
        user: Option<&User>,
        payload: &serde_json::Value,
    ) -> BillingResult<serde_json::Value> {
        let token = self.token_for(license, organization, user).await?;
        self.client.apply_startup_program(&token, payload).await
    }

    async fn token_for(
        &self,
        license: &License,
        organization: &Organization,
        user: Option<&User>,
    ) -> BillingResult<String> {
        self.issuer
            .build_token(Some(license), Some(organization), user, None)
            .await
    }

    async fn unsubscribed_response(
        &self,
        organization: &Organization,
        license: Option<&License>,
    ) -> BillingResult<BillingResponse> {
        let current = self.cached_current_usage(organization.id).await?;

        Ok(BillingResponse {
            available_features: Vec::new(),
            license: license.map(|l| LicensePlan {
                plan: l.plan.clone(),
            }),
            customer_id: organization.customer_id.clone(),
            deactivated: false,
            has_active_subscription: false,
            billing_period: None,
            usage_summary: None,
            products: default_products(&current),
        })
    }

    /// Current-month usage across the org's non-demo teams, cached so the
    /// billing page does not re-scan the event store on every load.
    async fn cached_current_usage(&self, organization_id: Uuid) -> BillingResult<CurrentUsage> {
        let key = format!("{}{}", USAGE_CACHE_KEY_PREFIX, organization_id);
        let mut redis = self.redis.clone();

        let cached: Option<String> = redis.get(&key).await?;
        if let Some(raw) = cached {
            if let Ok(usage) = serde_json::from_str::<CurrentUsage>(&raw) {
                return Ok(usage);
            }
            // Unparseable entries fall through and get recomputed.
        }

        let usage = self.compute_current_usage(organization_id).await?;

        let ttl = usage_cache_ttl(self.usage_cache_ttl_max, OffsetDateTime::now_utc());
        let raw = serde_json::to_string(&usage)?;
        let _: () = redis.set_ex(&key, raw, ttl).await?;

        Ok(usage)
    }

    async fn compute_current_usage(&self, organization_id: Uuid) -> BillingResult<CurrentUsage> {
        let month_start = current_month_start(OffsetDateTime::now_utc());

        let events: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM events e
            JOIN teams t ON t.id = e.team_id
            WHERE t.organization_id = $1 AND t.is_demo = false AND e.created_at >= $2
            "#,
        )
        .bind(organization_id)
        .bind(month_start)
        .fetch_one(&self.pool)
        .await?;

        let recordings: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM recordings r
            JOIN teams t ON t.id = r.team_id
            WHERE t.organization_id = $1 AND t.is_demo = false AND r.created_at >= $2
            "#,
        )
        .bind(organization_id)
        .bind(month_start)
        .fetch_one(&self.pool)
        .await?;

        let rows_synced: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(j.rows_synced), 0)::bigint
            FROM external_data_jobs j
            JOIN teams t ON t.id = j.team_id
            WHERE t.organization_id = $1 AND t.is_demo = false
              AND j.billable AND j.finished_at IS NOT NULL AND j.finished_at >= $2
            "#,
        )
        .bind(organization_id)
        .bind(month_start)
        .fetch_one(&self.pool)
        .await?;

        Ok(CurrentUsage {
            events,
            recordings,
            rows_synced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sightline_shared::MetricUsage;
    use time::macros::datetime;

    fn make_license(plan: &str, valid_until: Option<OffsetDateTime>) -> License {
        License {
            id: Uuid::new_v4(),
            key: "id::secret".to_string(),
            plan: plan.to_string(),
            valid_until,
            max_users: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn remote(plan: &str) -> RemoteLicense {
        RemoteLicense {
            plan: plan.to_string(),
            valid_until: None,
        }
    }

    #[test]
    fn test_refresh_extends_validity_inside_window() {
        let now = datetime!(2026-03-10 12:00 UTC);
        let license = make_license("scale", Some(now + Duration::days(10)));

        let (plan, valid_until) =
            license_refresh(&license, &remote("scale"), now).expect("write expected");

        assert_eq!(plan, "scale");
        assert_eq!(valid_until, Some(now + Duration::days(30)));
    }

    #[test]
    fn test_refresh_extends_unset_validity() {
        let now = datetime!(2026-03-10 12:00 UTC);
        let license = make_license("scale", None);

        let (_, valid_until) =
            license_refresh(&license, &remote("scale"), now).expect("write expected");
        assert_eq!(valid_until, Some(now + Duration::days(30)));
    }

    #[test]
    fn test_refresh_updates_changed_plan() {
        let now = datetime!(2026-03-10 12:00 UTC);
        let license = make_license("scale", Some(now + Duration::days(90)));

        let (plan, valid_until) =
            license_refresh(&license, &remote("enterprise"), now).expect("write expected");

        assert_eq!(plan, "enterprise");
        // Validity is far out, so it is left alone.
        assert_eq!(valid_until, license.valid_until);
    }

    #[test]
    fn test_refresh_is_noop_when_nothing_changed() {
        let now = datetime!(2026-03-10 12:00 UTC);
        let license = make_license("scale", Some(now + Duration::days(90)));

        assert!(license_refresh(&license, &remote("scale"), now).is_none());
    }

    fn customer_with_products(products: Vec<BillingProduct>) -> BillingCustomer {
        BillingCustomer {
            has_active_subscription: true,
            products: Some(products),
            ..BillingCustomer::default()
        }
    }

    fn events_product(current: i64, limit: Option<i64>) -> BillingProduct {
        BillingProduct {
            product_type: "events".to_string(),
            name: None,
            usage_key: Some("events".to_string()),
            current_usage: Some(current),
            usage_limit: limit,
            todays_usage: None,
            free_allocation: None,
            percentage_usage: 0.0,
            has_exceeded_limit: false,
        }
    }

    #[test]
    fn test_merge_preserves_quota_fields_and_siblings() {
        let mut current = OrganizationUsage::default();
        current.events.usage = Some(10);
        current.events.quota_limited_until = Some(1_700_000_000);
        current.recordings.usage = Some(7);

        let customer = customer_with_products(vec![events_product(500, Some(1_000_000))]);
        let merged = merge_remote_usage(&current, &customer);

        assert_eq!(merged.events.usage, Some(500));
        assert_eq!(merged.events.limit, Some(1_000_000));
        // Locally stamped quota state survives the remote merge.
        assert_eq!(merged.events.quota_limited_until, Some(1_700_000_000));
        // Sibling metrics the payload never mentioned survive too.
        assert_eq!(merged.recordings.usage, Some(7));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut current = OrganizationUsage::default();
        current.events.quota_limited_until = Some(42);

        let customer = customer_with_products(vec![events_product(500, Some(1_000))]);
        let once = merge_remote_usage(&current, &customer);
        let twice = merge_remote_usage(&once, &customer);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_unsubscribed_uses_usage_summary() {
        let current = OrganizationUsage {
            events: MetricUsage {
                usage: Some(1),
                ..MetricUsage::default()
            },
            ..OrganizationUsage::default()
        };

        let customer = BillingCustomer {
            has_active_subscription: false,
            usage_summary: Some(UsageSummary {
                events: Some(MetricUsageUpdate {
                    usage: Some(123),
                    limit: None,
                    todays_usage: None,
                }),
                ..UsageSummary::default()
            }),
            ..BillingCustomer::default()
        };

        let merged = merge_remote_usage(&current, &customer);
        assert_eq!(merged.events.usage, Some(123));
        // None is a real value: the cap was lifted.
        assert_eq!(merged.events.limit, None);
    }

    #[test]
    fn test_merge_records_billing_period() {
        let customer = BillingCustomer {
            billing_period: Some(BillingPeriodPayload {
                current_period_start: datetime!(2026-03-01 0:00 UTC),
                current_period_end: datetime!(2026-04-01 0:00 UTC),
            }),
            ..BillingCustomer::default()
        };

        let merged = merge_remote_usage(&OrganizationUsage::default(), &customer);
        let period = merged.period.expect("period expected");
        assert_eq!(period.start, datetime!(2026-03-01 0:00 UTC));
        assert_eq!(period.end, datetime!(2026-04-01 0:00 UTC));
    }

    #[test]
    fn test_month_boundaries() {
        let now = datetime!(2026-03-10 15:30 UTC);
        assert_eq!(current_month_start(now), datetime!(2026-03-01 0:00 UTC));
        assert_eq!(next_month_start(now), datetime!(2026-04-01 0:00 UTC));

        let december = datetime!(2025-12-31 23:59 UTC);
        assert_eq!(next_month_start(december), datetime!(2026-01-01 0:00 UTC));
    }

    #[test]
    fn test_usage_cache_ttl_capped_by_month_end() {
        // Mid-month: the configured max wins.
        let mid_month = datetime!(2026-03-10 0:00 UTC);
        assert_eq!(usage_cache_ttl(43_200, mid_month), 43_200);

        // One hour before the month ends: the boundary wins.
        let almost_over = datetime!(2026-03-31 23:00 UTC);
        assert_eq!(usage_cache_ttl(43_200, almost_over), 3_600);
    }
}
