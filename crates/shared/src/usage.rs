//! Per-organization usage accounting.
//!
//! The billing service owns `usage` and `limit` for each metric; quota
//! enforcement stamps `quota_limited_until` / `quota_limiting_suspended_until`
//! locally. The merge in [`MetricUsage::apply_remote`] is the only place the
//! two views meet, so a billing sync can never erase a locally stamped field.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// The closed set of billable metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageMetric {
    Events,
    Recordings,
    RowsSynced,
}

impl UsageMetric {
    pub const ALL: [UsageMetric; 3] = [Self::Events, Self::Recordings, Self::RowsSynced];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Recordings => "recordings",
            Self::RowsSynced => "rows_synced",
        }
    }

    /// Map a billing-service product type onto a metric.
    pub fn from_product_type(product_type: &str) -> Option<Self> {
        match product_type {
            "events" => Some(Self::Events),
            "recordings" => Some(Self::Recordings),
            "rows_synced" => Some(Self::RowsSynced),
            _ => None,
        }
    }
}

impl std::fmt::Display for UsageMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Usage state for one metric.
///
/// `usage`/`limit` mirror the billing service (limit None = unlimited);
/// the quota fields are stamped by local quota enforcement and survive
/// remote merges untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub todays_usage: Option<i64>,
    /// Unix timestamp until which the metric is quota limited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_limited_until: Option<i64>,
    /// Unix timestamp until which quota limiting is suspended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_limiting_suspended_until: Option<i64>,
}

/// The remote-owned fields of one metric, as reported by the billing service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricUsageUpdate {
    pub usage: Option<i64>,
    pub limit: Option<i64>,
    pub todays_usage: Option<i64>,
}

impl MetricUsage {
    /// Merge a billing-service report into this metric.
    ///
    /// `usage` and `limit` are replaced wholesale (a None limit means the
    /// subscription is unlimited, which is a real value). `todays_usage` is
    /// only overlaid when the payload carries it. The quota fields are never
    /// touched here. Applying the same update twice is a no-op.
    pub fn apply_remote(&mut self, update: &MetricUsageUpdate) {
        self.usage = update.usage;
        self.limit = update.limit;
        if update.todays_usage.is_some() {
            self.todays_usage = update.todays_usage;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.usage.is_none()
            && self.limit.is_none()
            && self.todays_usage.is_none()
            && self.quota_limited_until.is_none()
            && self.quota_limiting_suspended_until.is_none()
    }
}

/// The billing period the synced usage belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingPeriod {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
}

/// Synced usage/limit state across all metrics for one organization.
/// Stored as JSONB on the organization row; absent keys stay absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizationUsage {
    #[serde(skip_serializing_if = "MetricUsage::is_empty")]
    pub events: MetricUsage,
    #[serde(skip_serializing_if = "MetricUsage::is_empty")]
    pub recordings: MetricUsage,
    #[serde(skip_serializing_if = "MetricUsage::is_empty")]
    pub rows_synced: MetricUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<BillingPeriod>,
}

impl OrganizationUsage {
    pub fn metric(&self, metric: UsageMetric) -> &MetricUsage {
        match metric {
            UsageMetric::Events => &self.events,
            UsageMetric::Recordings => &self.recordings,
            UsageMetric::RowsSynced => &self.rows_synced,
        }
    }

    pub fn metric_mut(&mut self, metric: UsageMetric) -> &mut MetricUsage {
        match metric {
            UsageMetric::Events => &mut self.events,
            UsageMetric::Recordings => &mut self.recordings,
            UsageMetric::RowsSynced => &mut self.rows_synced,
        }
    }

    /// Merge a remote report for one metric. Sibling metrics are untouched.
    pub fn apply_remote_metric(&mut self, metric: UsageMetric, update: &MetricUsageUpdate) {
        self.metric_mut(metric).apply_remote(update);
    }
}
