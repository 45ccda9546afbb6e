//! Periodic usage reporting.
//!
//! Aggregates per-team product metrics into one report per organization and
//! pushes them to the billing service. One organization failing must never
//! starve the rest of billing visibility, so the send loop records failures
//! and keeps going.

use std::collections::HashMap;

use serde::Serialize;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime, Time};
use uuid::Uuid;

use sightline_shared::{is_cloud_deployment, License, Organization, Team, User};

use crate::audit::{AuditEventBuilder, AuditEventType, BillingAuditLogger};
use crate::client::BillingApiClient;
use crate::error::BillingResult;
use crate::license::LicenseRepository;
use crate::token::BillingTokenIssuer;

// =============================================================================
// Report payloads
// =============================================================================

/// Usage metrics for one team over the reporting period
#[derive(Debug, Clone, Default, Serialize)]
pub struct TeamUsageReport {
    pub team_id: Uuid,
    pub event_count_lifetime: i64,
    pub event_count_in_period: i64,
    pub event_count_by_lib: HashMap<String, i64>,
    pub event_count_by_name: HashMap<String, i64>,
    pub recording_count_lifetime: i64,
    pub recording_count_in_period: i64,
    pub person_count: i64,
    /// Distinct ids attached to more than one person (ingestion diagnostics)
    pub duplicate_distinct_ids: i64,
    pub persons_with_multiple_ids: i64,
    pub dashboard_count: i64,
    pub feature_flags_total: i64,
    pub feature_flags_active: i64,
}

/// Organization-level rollup sent to the billing service
#[derive(Debug, Clone, Serialize)]
pub struct OrgUsageReport {
    pub organization_id: Uuid,
    pub organization_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub instance_version: String,
    pub deployment: String,
    pub event_count_lifetime: i64,
    pub event_count_in_period: i64,
    pub event_count_by_lib: HashMap<String, i64>,
    pub event_count_by_name: HashMap<String, i64>,
    pub recording_count_lifetime: i64,
    pub recording_count_in_period: i64,
    pub person_count: i64,
    pub duplicate_distinct_ids: i64,
    pub persons_with_multiple_ids: i64,
    pub dashboard_count: i64,
    pub feature_flags_total: i64,
    pub feature_flags_active: i64,
    pub teams: Vec<TeamUsageReport>,
}

/// Summary of one reporting run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageReportOutcome {
    pub generated: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// The UTC day before the one containing `now`.
pub fn reporting_period_yesterday(now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    let today = now.replace_time(Time::MIDNIGHT);
    (today - Duration::days(1), today)
}

/// Sum team metrics into the organization report.
fn rollup_org_report(
    organization: &Organization,
    teams: Vec<TeamUsageReport>,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
) -> OrgUsageReport {
    let deployment = if is_cloud_deployment() {
        "cloud"
    } else {
        "self_hosted"
    };

    let mut report = OrgUsageReport {
        organization_id: organization.id,
        organization_name: organization.name.clone(),
        period_start,
        period_end,
        instance_version: env!("CARGO_PKG_VERSION").to_string(),
        deployment: deployment.to_string(),
        event_count_lifetime: 0,
        event_count_in_period: 0,
        event_count_by_lib: HashMap::new(),
        event_count_by_name: HashMap::new(),
        recording_count_lifetime: 0,
        recording_count_in_period: 0,
        person_count: 0,
        duplicate_distinct_ids: 0,
        persons_with_multiple_ids: 0,
        dashboard_count: 0,
        feature_flags_total: 0,
        feature_flags_active: 0,
        teams: Vec::new(),
    };

    for team in &teams {
        report.event_count_lifetime += team.event_count_lifetime;
        report.event_count_in_period += team.event_count_in_period;
        report.recording_count_lifetime += team.recording_count_lifetime;
        report.recording_count_in_period += team.recording_count_in_period;
        report.person_count += team.person_count;
        report.duplicate_distinct_ids += team.duplicate_distinct_ids;
        report.persons_with_multiple_ids += team.persons_with_multiple_ids;
        report.dashboard_count += team.dashboard_count;
        report.feature_flags_total += team.feature_flags_total;
        report.feature_flags_active += team.feature_flags_active;

        for (lib, count) in &team.event_count_by_lib {
            *report.event_count_by_lib.entry(lib.clone()).or_insert(0) += count;
        }
        for (name, count) in &team.event_count_by_name {
            *report.event_count_by_name.entry(name.clone()).or_insert(0) += count;
        }
    }

    report.teams = teams;
    report
}

// =============================================================================
// Reporter
// =============================================================================

/// Computes and sends per-organization usage reports
#[derive(Clone)]
pub struct UsageReporter {
    pool: PgPool,
    client: BillingApiClient,
    issuer: BillingTokenIssuer,
    licenses: LicenseRepository,
    audit: BillingAuditLogger,
}

impl UsageReporter {
    pub fn new(pool: PgPool, client: BillingApiClient) -> Self {
        let issuer = BillingTokenIssuer::new(pool.clone());
        let licenses = LicenseRepository::new(pool.clone());
        let audit = BillingAuditLogger::new(pool.clone());
        Self {
            pool,
            client,
            issuer,
            licenses,
            audit,
        }
    }

    /// Report yesterday's UTC day.
    pub async fn run(&self, dry_run: bool) -> BillingResult<UsageReportOutcome> {
        let (period_start, period_end) = reporting_period_yesterday(OffsetDateTime::now_utc());
        self.run_for_period(period_start, period_end, dry_run).await
    }

    /// Compute a report per organization and send each one, isolating
    /// per-organization failures.
    pub async fn run_for_period(
        &self,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
        dry_run: bool,
    ) -> BillingResult<UsageReportOutcome> {
        let mut outcome = UsageReportOutcome::default();

        let license = self.licenses.first_valid().await?;
        let organizations = self.reportable_organizations().await?;

        tracing::info!(
            org_count = organizations.len(),
            period_start = %period_start,
            period_end = %period_end,
            dry_run,
            "Starting usage report run"
        );

        for organization in organizations {
            let report = match self
                .report_for_org(&organization, period_start, period_end)
                .await
            {
                Ok(report) => {
                    outcome.generated += 1;
                    report
                }
                Err(e) => {
                    tracing::error!(org_id = %organization.id, error = %e, "Failed to compute usage report");
                    outcome.failed += 1;
                    continue;
                }
            };

            if dry_run {
                tracing::info!(
                    org_id = %organization.id,
                    events_in_period = report.event_count_in_period,
                    "Dry run: usage report computed, not sent"
                );
                continue;
            }

            let Some(license) = &license else {
                tracing::debug!(org_id = %organization.id, "No valid license, skipping send");
                outcome.skipped += 1;
                continue;
            };

            match self.send_for_org(license, &organization, &report).await {
                Ok(true) => outcome.sent += 1,
                Ok(false) => outcome.skipped += 1,
                Err(e) => {
                    tracing::error!(org_id = %organization.id, error = %e, "Failed to send usage report");
                    outcome.failed += 1;
                }
            }
        }

        tracing::info!(
            generated = outcome.generated,
            sent = outcome.sent,
            failed = outcome.failed,
            skipped = outcome.skipped,
            "Usage report run finished"
        );

        Ok(outcome)
    }

    /// Aggregate one organization's teams into a report.
    pub async fn report_for_org(
        &self,
        organization: &Organization,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<OrgUsageReport> {
        let teams = self.billable_teams(organization.id).await?;

        let mut team_reports = Vec::with_capacity(teams.len());
        for team in &teams {
            team_reports.push(self.report_for_team(team.id, period_start, period_end).await?);
        }

        Ok(rollup_org_report(
            organization,
            team_reports,
            period_start,
            period_end,
        ))
    }

    /// Send, requiring at least one resolvable member to vouch for the org.
    /// Returns Ok(false) when the org was skipped.
    async fn send_for_org(
        &self,
        license: &License,
        organization: &Organization,
        report: &OrgUsageReport,
    ) -> BillingResult<bool> {
        let Some(member) = self.reporting_member(organization.id).await? else {
            tracing::warn!(org_id = %organization.id, "No resolvable member, skipping usage report");
            return Ok(false);
        };

        let token = self
            .issuer
            .build_token(Some(license), Some(organization), Some(&member), None)
            .await?;
        let payload = serde_json::to_value(report)?;
        self.client.post_usage_report(&token, &payload).await?;

        tracing::info!(
            org_id = %organization.id,
            events_in_period = report.event_count_in_period,
            "Usage report sent"
        );

        let event = AuditEventBuilder::new(AuditEventType::UsageReportSent)
            .organization(organization.id)
            .data(serde_json::json!({
                "period_start": report.period_start.to_string(),
                "period_end": report.period_end.to_string(),
                "events_in_period": report.event_count_in_period,
                "team_count": report.teams.len(),
            }));
        if let Err(e) = self.audit.log(event).await {
            tracing::warn!(error = %e, "Failed to record usage report audit event");
        }

        Ok(true)
    }

    async fn reportable_organizations(&self) -> BillingResult<Vec<Organization>> {
        let organizations: Vec<Organization> = sqlx::query_as(
            r#"
            SELECT id, name, customer_id, usage, available_features,
                   for_internal_metrics, created_at, updated_at
            FROM organizations
            WHERE for_internal_metrics = false
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(organizations)
    }

    async fn billable_teams(&self, organization_id: Uuid) -> BillingResult<Vec<Team>> {
        let teams: Vec<Team> = sqlx::query_as(
            r#"
            SELECT id, organization_id, name, is_demo, created_at
            FROM teams
            WHERE organization_id = $1 AND is_demo = false
            ORDER BY created_at
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(teams)
    }

    /// Highest-level member, used as the report's acting user.
    async fn reporting_member(&self, organization_id: Uuid) -> BillingResult<Option<User>> {
        let member: Option<User> = sqlx::query_as(
            r#"
            SELECT u.id, u.email, u.distinct_id, u.created_at
            FROM users u
            JOIN organization_memberships m ON m.user_id = u.id
            WHERE m.organization_id = $1
            ORDER BY m.level DESC, m.joined_at ASC
            LIMIT 1
            "#,
        )
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(member)
    }

    async fn report_for_team(
        &self,
        team_id: Uuid,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<TeamUsageReport> {
        let event_count_lifetime: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE team_id = $1")
                .bind(team_id)
                .fetch_one(&self.pool)
                .await?;

        let event_count_in_period: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM events WHERE team_id = $1 AND created_at >= $2 AND created_at < $3",
        )
        .bind(team_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await?;

        let by_lib: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT COALESCE(lib, 'unknown') AS lib, COUNT(*)
            FROM events
            WHERE team_id = $1 AND created_at >= $2 AND created_at < $3
            GROUP BY 1
            ORDER BY 2 DESC
            "#,
        )
        .bind(team_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&self.pool)
        .await?;

        let by_name: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT name, COUNT(*)
            FROM events
            WHERE team_id = $1 AND created_at >= $2 AND created_at < $3
            GROUP BY name
            ORDER BY 2 DESC
            "#,
        )
        .bind(team_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&self.pool)
        .await?;

        let recording_count_lifetime: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM recordings WHERE team_id = $1")
                .bind(team_id)
                .fetch_one(&self.pool)
                .await?;

        let recording_count_in_period: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM recordings WHERE team_id = $1 AND created_at >= $2 AND created_at < $3",
        )
        .bind(team_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await?;

        let person_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM persons WHERE team_id = $1")
                .bind(team_id)
                .fetch_one(&self.pool)
                .await?;

        let duplicate_distinct_ids: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM (
                SELECT distinct_id
                FROM person_distinct_ids
                WHERE team_id = $1
                GROUP BY distinct_id
                HAVING COUNT(DISTINCT person_id) > 1
            ) dupes
            "#,
        )
        .bind(team_id)
        .fetch_one(&self.pool)
        .await?;

        let persons_with_multiple_ids: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM (
                SELECT person_id
                FROM person_distinct_ids
                WHERE team_id = $1
                GROUP BY person_id
                HAVING COUNT(*) > 1
            ) multi
            "#,
        )
        .bind(team_id)
        .fetch_one(&self.pool)
        .await?;

        let dashboard_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dashboards WHERE team_id = $1")
                .bind(team_id)
                .fetch_one(&self.pool)
                .await?;

        let feature_flags_total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM feature_flags WHERE team_id = $1")
                .bind(team_id)
                .fetch_one(&self.pool)
                .await?;

        let feature_flags_active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM feature_flags WHERE team_id = $1 AND active AND NOT deleted",
        )
        .bind(team_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(TeamUsageReport {
            team_id,
            event_count_lifetime,
            event_count_in_period,
            event_count_by_lib: by_lib.into_iter().collect(),
            event_count_by_name: by_name.into_iter().collect(),
            recording_count_lifetime,
            recording_count_in_period,
            person_count,
            duplicate_distinct_ids,
            persons_with_multiple_ids,
            dashboard_count,
            feature_flags_total,
            feature_flags_active,
        })
    }
}
