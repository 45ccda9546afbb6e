//! License persistence and the instance-wide license cache.

use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use sightline_shared::License;

use crate::error::BillingResult;

/// Pick the winning license among the currently valid ones.
///
/// Ordered by plan rank, then `valid_until` with perpetual (None) ranked
/// greatest, then `created_at`, then id, so repeated calls always agree
/// regardless of row order.
fn select_first_valid(mut licenses: Vec<License>, now: OffsetDateTime) -> Option<License> {
    licenses.retain(|l| l.is_valid_at(now));
    licenses.into_iter().max_by_key(|l| {
        (
            l.sorting_value(),
            l.valid_until
                .map(|v| v.unix_timestamp())
                .unwrap_or(i64::MAX),
            l.created_at.unix_timestamp(),
            l.id,
        )
    })
}

/// License CRUD on top of Postgres.
#[derive(Clone)]
pub struct LicenseRepository {
    pool: PgPool,
}

impl LicenseRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Highest-ranked currently valid license, if any.
    pub async fn first_valid(&self) -> BillingResult<Option<License>> {
        let now = OffsetDateTime::now_utc();
        let licenses = sqlx::query_as::<_, License>(
            r#"
            SELECT id, key, plan, valid_until, max_users, created_at
            FROM licenses
            WHERE valid_until IS NULL OR valid_until >= $1 OR plan = 'cloud'
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(select_first_valid(licenses, now))
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Option<License>> {
        let license = sqlx::query_as::<_, License>(
            "SELECT id, key, plan, valid_until, max_users, created_at FROM licenses WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(license)
    }

    pub async fn list(&self) -> BillingResult<Vec<License>> {
        let licenses = sqlx::query_as::<_, License>(
            "SELECT id, key, plan, valid_until, max_users, created_at FROM licenses ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(licenses)
    }

    /// Insert a license, or refresh its details if the key was activated before.
    pub async fn create(
        &self,
        key: &str,
        plan: &str,
        valid_until: Option<OffsetDateTime>,
        max_users: Option<i32>,
    ) -> BillingResult<License> {
        let license = sqlx::query_as::<_, License>(
            r#"
            INSERT INTO licenses (id, key, plan, valid_until, max_users, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (key) DO UPDATE SET
                plan = EXCLUDED.plan,
                valid_until = EXCLUDED.valid_until,
                max_users = EXCLUDED.max_users
            RETURNING id, key, plan, valid_until, max_users, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key)
        .bind(plan)
        .bind(valid_until)
        .bind(max_users)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(license_id = %license.id, plan = %license.plan, "License stored");
        Ok(license)
    }

    /// Overwrite plan and expiry, returning the updated row.
    pub async fn update_details(
        &self,
        id: Uuid,
        plan: &str,
        valid_until: Option<OffsetDateTime>,
    ) -> BillingResult<License> {
        let license = sqlx::query_as::<_, License>(
            r#"
            UPDATE licenses
            SET plan = $2, valid_until = $3
            WHERE id = $1
            RETURNING id, key, plan, valid_until, max_users, created_at
            "#,
        )
        .bind(id)
        .bind(plan)
        .bind(valid_until)
        .fetch_one(&self.pool)
        .await?;

        Ok(license)
    }

    pub async fn delete(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query("DELETE FROM licenses WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        tracing::info!(license_id = %id, "License deleted");
        Ok(())
    }

    /// Whether any currently valid license other than `id` exists.
    pub async fn another_valid_exists(&self, id: Uuid) -> BillingResult<bool> {
        let now = OffsetDateTime::now_utc();
        let licenses = sqlx::query_as::<_, License>(
            r#"
            SELECT id, key, plan, valid_until, max_users, created_at
            FROM licenses
            WHERE id != $1 AND (valid_until IS NULL OR valid_until >= $2 OR plan = 'cloud')
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(select_first_valid(licenses, now).is_some())
    }

    /// Remove every non-demo team across the instance. Called when the last
    /// valid license goes away; demo teams are kept so the product still
    /// demos without a license.
    pub async fn delete_non_demo_teams(&self) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM teams WHERE is_demo = false")
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected();
        tracing::warn!(teams_deleted = deleted, "Removed non-demo teams after license cancellation");
        Ok(deleted)
    }
}

/// Process-wide cache of the instance's winning license.
///
/// Both outcomes are cached: "queried, nothing valid" is recorded too, so
/// unlicensed installs don't hit `licenses` on every request. The cache is
/// constructed once and shared via `Arc`; tests build their own instance.
pub struct InstanceLicenseCache {
    repo: LicenseRepository,
    // None = not queried yet, Some(None) = no valid license, Some(Some(_)) = licensed
    slot: RwLock<Option<Option<License>>>,
}

impl InstanceLicenseCache {
    pub fn new(repo: LicenseRepository) -> Self {
        Self {
            repo,
            slot: RwLock::new(None),
        }
    }

    /// The cached license, querying the repository on first use.
    pub async fn get(&self) -> BillingResult<Option<License>> {
        if let Some(cached) = self.slot.read().await.as_ref() {
            return Ok(cached.clone());
        }

        let mut slot = self.slot.write().await;
        // Another task may have populated the slot while we waited.
        if let Some(cached) = slot.as_ref() {
            return Ok(cached.clone());
        }

        let fetched = match self.repo.first_valid().await {
            Ok(license) => license,
            // Fresh installs may not have run migrations yet.
            Err(err) if err.is_undefined_table() => None,
            Err(err) => return Err(err),
        };

        *slot = Some(fetched.clone());
        Ok(fetched)
    }

    /// Whether a valid license exists, via the same cached slot.
    pub async fn is_licensed(&self) -> BillingResult<bool> {
        Ok(self.get().await?.is_some())
    }

    /// Drop the cached value; the next `get` re-queries. Called after
    /// license activation and cancellation.
    pub async fn invalidate(&self) {
        *self.slot.write().await = None;
        tracing::debug!("Instance license cache invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn license(key: &str, plan: &str, valid_until: Option<OffsetDateTime>) -> License {
        License {
            id: Uuid::new_v4(),
            key: key.to_string(),
            plan: plan.to_string(),
            valid_until,
            max_users: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_empty_set_selects_none() {
        let now = OffsetDateTime::now_utc();
        assert!(select_first_valid(vec![], now).is_none());
    }

    #[test]
    fn test_only_expired_selects_none() {
        let now = OffsetDateTime::now_utc();
        let expired = license("a::b", "enterprise", Some(now - Duration::days(1)));
        assert!(select_first_valid(vec![expired], now).is_none());
    }

    #[test]
    fn test_higher_plan_wins_regardless_of_insertion_order() {
        let now = OffsetDateTime::now_utc();
        let scale = license("s::s", "scale", Some(now + Duration::days(30)));
        let enterprise = license("e::e", "enterprise", Some(now + Duration::days(30)));

        let picked = select_first_valid(vec![scale.clone(), enterprise.clone()], now).unwrap();
        assert_eq!(picked.key, "e::e");

        let picked = select_first_valid(vec![enterprise, scale], now).unwrap();
        assert_eq!(picked.key, "e::e");
    }

    #[test]
    fn test_expired_enterprise_loses_to_valid_scale() {
        let now = OffsetDateTime::now_utc();
        let expired_ent = license("e::e", "enterprise", Some(now - Duration::days(1)));
        let scale = license("s::s", "scale", Some(now + Duration::days(30)));

        let picked = select_first_valid(vec![expired_ent, scale], now).unwrap();
        assert_eq!(picked.key, "s::s");
    }

    #[test]
    fn test_equal_rank_breaks_tie_on_latest_expiry() {
        let now = OffsetDateTime::now_utc();
        let sooner = license("a::a", "scale", Some(now + Duration::days(10)));
        let later = license("b::b", "scale", Some(now + Duration::days(20)));

        let picked = select_first_valid(vec![sooner, later], now).unwrap();
        assert_eq!(picked.key, "b::b");
    }

    #[test]
    fn test_perpetual_outranks_dated_at_equal_plan() {
        let now = OffsetDateTime::now_utc();
        let dated = license("a::a", "scale", Some(now + Duration::days(365)));
        let perpetual = license("b::b", "scale", None);

        let picked = select_first_valid(vec![dated, perpetual], now).unwrap();
        assert_eq!(picked.key, "b::b");
    }

    #[test]
    fn test_expired_cloud_license_is_still_eligible() {
        let now = OffsetDateTime::now_utc();
        let cloud = license("c::c", "cloud", Some(now - Duration::days(90)));

        let picked = select_first_valid(vec![cloud], now).unwrap();
        assert_eq!(picked.plan, "cloud");
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_repository_roundtrip() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = sightline_shared::create_pool(&url).await.expect("pool");
        let repo = LicenseRepository::new(pool);

        let created = repo
            .create("itest::secret", "scale", None, Some(10))
            .await
            .expect("create");
        let fetched = repo.get(created.id).await.expect("get").expect("exists");
        assert_eq!(fetched.key, "itest::secret");

        let valid = repo.first_valid().await.expect("first_valid");
        assert!(valid.is_some());

        repo.delete(created.id).await.expect("delete");
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_cancellation_cascade_depends_on_remaining_licenses() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = sightline_shared::create_pool(&url).await.expect("pool");
        let repo = LicenseRepository::new(pool);

        let first = repo
            .create("cascade-a::s", "scale", None, None)
            .await
            .expect("create");
        let second = repo
            .create("cascade-b::s", "enterprise", None, None)
            .await
            .expect("create");

        // With another valid license around, no team cleanup is warranted.
        assert!(repo.another_valid_exists(first.id).await.expect("check"));
        repo.delete(first.id).await.expect("delete");

        // The last one going away is what triggers the cascade.
        assert!(!repo.another_valid_exists(second.id).await.expect("check"));
        repo.delete_non_demo_teams().await.expect("cascade");
        repo.delete(second.id).await.expect("delete");
    }
}
