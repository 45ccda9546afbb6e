//! Row tracking and the pre-flight billing limit guard.
//!
//! External data syncs report rows in two places: `external_data_jobs` holds
//! the durable count once a job finishes, and a Redis counter per
//! `(team, schema)` estimates rows still in flight. The guard combines both
//! across the whole organization against the billing-reported limit. It is
//! strictly advisory: the sync pipeline asks before ingesting more rows, and
//! nothing is ever blocked retroactively.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use sightline_shared::{Organization, OrganizationUsage};

use crate::error::BillingResult;
use crate::manager::current_month_start;

const ROWS_IN_FLIGHT_KEY_PREFIX: &str = "rows_in_flight:";

/// Counters from abandoned jobs expire on their own within a day.
const ROW_COUNTER_TTL_SECS: i64 = 86_400;

fn counter_key(team_id: Uuid, schema_id: Uuid) -> String {
    format!("{}{}:{}", ROWS_IN_FLIGHT_KEY_PREFIX, team_id, schema_id)
}

/// Whether committed plus in-flight rows leave no room under the limit.
/// No configured limit means nothing to exceed.
fn exceeds_limit(committed: i64, in_flight: i64, limit: Option<i64>) -> bool {
    match limit {
        Some(limit) => committed.saturating_add(in_flight) >= limit,
        None => false,
    }
}

/// Start of the billing period the committed rows count against: the synced
/// billing period when one is known, else the current calendar month.
fn period_start(usage: &OrganizationUsage, now: OffsetDateTime) -> OffsetDateTime {
    usage
        .period
        .as_ref()
        .map(|p| p.start)
        .unwrap_or_else(|| current_month_start(now))
}

// =============================================================================
// In-flight counters
// =============================================================================

/// Redis counters for rows a running sync has processed but not committed.
#[derive(Clone)]
pub struct RowTracker {
    redis: ConnectionManager,
}

impl RowTracker {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Reset the counter at sync start.
    pub async fn start_tracking(&self, team_id: Uuid, schema_id: Uuid) -> BillingResult<()> {
        let mut redis = self.redis.clone();
        let _: () = redis
            .set_ex(
                counter_key(team_id, schema_id),
                0i64,
                ROW_COUNTER_TTL_SECS as u64,
            )
            .await?;
        Ok(())
    }

    /// Add processed rows, returning the new in-flight total.
    pub async fn increment_rows(
        &self,
        team_id: Uuid,
        schema_id: Uuid,
        count: i64,
    ) -> BillingResult<i64> {
        let mut redis = self.redis.clone();
        let key = counter_key(team_id, schema_id);
        let total: i64 = redis.incr(&key, count).await?;
        // Keep the expiry moving while the job is alive.
        let _: bool = redis.expire(&key, ROW_COUNTER_TTL_SECS).await?;
        Ok(total)
    }

    /// Current in-flight count; a missing counter reads as zero.
    pub async fn rows_in_flight(&self, team_id: Uuid, schema_id: Uuid) -> BillingResult<i64> {
        let mut redis = self.redis.clone();
        let count: Option<i64> = redis.get(counter_key(team_id, schema_id)).await?;
        Ok(count.unwrap_or(0))
    }

    /// Drop the counter once the job has committed its durable count.
    pub async fn finish_tracking(&self, team_id: Uuid, schema_id: Uuid) -> BillingResult<()> {
        let mut redis = self.redis.clone();
        let _: () = redis.del(counter_key(team_id, schema_id)).await?;
        Ok(())
    }
}

// =============================================================================
// Guard
// =============================================================================

/// Pre-flight check of organization-wide synced rows against the billing
/// limit.
#[derive(Clone)]
pub struct BillingLimitGuard {
    pool: PgPool,
    tracker: RowTracker,
}

impl BillingLimitGuard {
    pub fn new(pool: PgPool, tracker: RowTracker) -> Self {
        Self { pool, tracker }
    }

    /// Whether another sync batch for `team_id` would push the organization
    /// past its `rows_synced` limit. Limits are organization-wide, so every
    /// team in the initiating team's org counts.
    pub async fn would_exceed_rows_limit(&self, team_id: Uuid) -> BillingResult<bool> {
        let Some(organization) = self.organization_for_team(team_id).await? else {
            // Orphaned team: nothing to bill against.
            return Ok(false);
        };

        let limit = organization.usage.rows_synced.limit;
        if limit.is_none() {
            return Ok(false);
        }

        let start = period_start(&organization.usage, OffsetDateTime::now_utc());
        let committed = self.committed_rows(organization.id, start).await?;
        let in_flight = self.org_rows_in_flight(organization.id).await?;

        let exceeded = exceeds_limit(committed, in_flight, limit);
        if exceeded {
            tracing::warn!(
                org_id = %organization.id,
                team_id = %team_id,
                committed,
                in_flight,
                limit = limit.unwrap_or(0),
                "Rows synced limit reached"
            );
        }

        Ok(exceeded)
    }

    async fn organization_for_team(&self, team_id: Uuid) -> BillingResult<Option<Organization>> {
        let organization: Option<Organization> = sqlx::query_as(
            r#"
            SELECT o.id, o.name, o.customer_id, o.usage, o.available_features,
                   o.for_internal_metrics, o.created_at, o.updated_at
            FROM organizations o
            JOIN teams t ON t.organization_id = o.id
            WHERE t.id = $1
            "#,
        )
        .bind(team_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(organization)
    }

    /// Billable rows from finished jobs this period, across all org teams.
    async fn committed_rows(
        &self,
        organization_id: Uuid,
        since: OffsetDateTime,
    ) -> BillingResult<i64> {
        let committed: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(j.rows_synced), 0)::bigint
            FROM external_data_jobs j
            JOIN teams t ON t.id = j.team_id
            WHERE t.organization_id = $1
              AND j.billable
              AND j.finished_at IS NOT NULL
              AND j.finished_at >= $2
            "#,
        )
        .bind(organization_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(committed)
    }

    /// In-flight counters for every unfinished job in the organization.
    async fn org_rows_in_flight(&self, organization_id: Uuid) -> BillingResult<i64> {
        let running: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            SELECT j.team_id, j.schema_id
            FROM external_data_jobs j
            JOIN teams t ON t.id = j.team_id
            WHERE t.organization_id = $1 AND j.finished_at IS NULL
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        let mut total = 0i64;
        for (team_id, schema_id) in running {
            total = total.saturating_add(self.tracker.rows_in_flight(team_id, schema_id).await?);
        }

        Ok(total)
    }
}
