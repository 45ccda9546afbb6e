//! Common types used across Sightline

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::usage::OrganizationUsage;

// =============================================================================
// Deployment Mode
// =============================================================================

/// Check if running as the managed cloud deployment.
/// Set SIGHTLINE_CLOUD=true on cloud instances; self-hosted installs leave it
/// unset. Affects which distinct ids are embedded in billing tokens.
pub fn is_cloud_deployment() -> bool {
    std::env::var("SIGHTLINE_CLOUD")
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(false)
}

// =============================================================================
// License
// =============================================================================

/// Enterprise license record.
///
/// A v2 key is `"<id>::<secret>"`; the id half identifies the license to the
/// billing service and the secret half signs billing tokens. Legacy v1 keys
/// are opaque strings and cannot talk to the billing service.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct License {
    pub id: Uuid,
    pub key: String,
    pub plan: String,
    /// None means the license never expires (legacy/perpetual).
    pub valid_until: Option<OffsetDateTime>,
    pub max_users: Option<i32>,
    pub created_at: OffsetDateTime,
}

impl License {
    pub const PLAN_SCALE: &'static str = "scale";
    pub const PLAN_ENTERPRISE: &'static str = "enterprise";
    /// Cloud licenses are synthesized on managed deployments and never expire.
    pub const PLAN_CLOUD: &'static str = "cloud";

    /// Sorting weight for a plan name. Unknown plans sort lowest.
    pub fn plan_rank(plan: &str) -> u8 {
        match plan {
            Self::PLAN_SCALE => 10,
            Self::PLAN_ENTERPRISE => 20,
            _ => 0,
        }
    }

    /// Sorting weight of this license's plan.
    pub fn sorting_value(&self) -> u8 {
        Self::plan_rank(&self.plan)
    }

    /// Whether the key is a v2 key (exactly two `::`-separated parts).
    pub fn is_v2(&self) -> bool {
        self.v2_parts().is_some()
    }

    /// Split a v2 key into its (id, secret) halves.
    pub fn v2_parts(&self) -> Option<(&str, &str)> {
        let mut parts = self.key.splitn(3, "::");
        match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(secret), None) if !id.is_empty() && !secret.is_empty() => {
                Some((id, secret))
            }
            _ => None,
        }
    }

    /// A license is valid while unexpired; cloud licenses are always valid.
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        if self.plan == Self::PLAN_CLOUD {
            return true;
        }
        match self.valid_until {
            Some(until) => until >= now,
            None => true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(OffsetDateTime::now_utc())
    }
}

// =============================================================================
// Membership
// =============================================================================

/// Membership level within an organization.
/// Stored as SMALLINT; the gaps leave room for intermediate levels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[repr(i16)]
pub enum MembershipLevel {
    Member = 1,
    Admin = 8,
    Owner = 15,
}

impl MembershipLevel {
    /// Readable role name, as embedded in billing tokens.
    pub fn role_name(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "administrator",
            Self::Owner => "owner",
        }
    }

    /// Check if this level can administer the organization
    pub fn can_administer(&self) -> bool {
        *self >= Self::Admin
    }

    pub fn from_level(level: i16) -> Option<Self> {
        match level {
            1 => Some(Self::Member),
            8 => Some(Self::Admin),
            15 => Some(Self::Owner),
            _ => None,
        }
    }
}

impl std::fmt::Display for MembershipLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.role_name())
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Organization (tenant) model
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    /// Billing service customer reference, set after the first sync.
    pub customer_id: Option<String>,
    /// Synced usage/limit state per metric, merged via the overlay op.
    pub usage: sqlx::types::Json<OrganizationUsage>,
    /// Entitlement keys reported by the billing service.
    pub available_features: sqlx::types::Json<Vec<String>>,
    /// Internal-metrics orgs are excluded from usage reporting.
    pub for_internal_metrics: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Organization {
    pub fn has_feature(&self, key: &str) -> bool {
        self.available_features.iter().any(|f| f == key)
    }
}

/// Project (team) model
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Team {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    /// Demo teams survive license cancellation and are never billed.
    pub is_demo: bool,
    pub created_at: OffsetDateTime,
}

/// User model
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    /// Analytics identity, embedded in billing tokens.
    pub distinct_id: String,
    pub created_at: OffsetDateTime,
}

/// Organization membership model
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrganizationMembership {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub level: MembershipLevel,
    pub joined_at: OffsetDateTime,
}

/// External data warehouse sync job.
/// `rows_synced` becomes billable once `finished_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExternalDataJob {
    pub id: Uuid,
    pub team_id: Uuid,
    pub schema_id: Uuid,
    pub rows_synced: Option<i64>,
    pub billable: bool,
    pub finished_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Tests
// =============================================================================
