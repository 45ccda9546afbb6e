//! Default product catalog.
//!
//! Unlicensed and unsubscribed instances still get a meaningful billing
//! response: the free-tier catalog with locally computed usage filled in.

use serde::{Deserialize, Serialize};

use sightline_shared::UsageMetric;

use crate::client::BillingProduct;

/// Locally computed usage for the current calendar month
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUsage {
    pub events: i64,
    pub recordings: i64,
    pub rows_synced: i64,
}

impl CurrentUsage {
    pub fn metric(&self, metric: UsageMetric) -> i64 {
        match metric {
            UsageMetric::Events => self.events,
            UsageMetric::Recordings => self.recordings,
            UsageMetric::RowsSynced => self.rows_synced,
        }
    }
}

/// Free-tier monthly allocation per metric
pub fn free_allocation(metric: UsageMetric) -> i64 {
    match metric {
        UsageMetric::Events => 1_000_000,
        UsageMetric::Recordings => 5_000,
        UsageMetric::RowsSynced => 1_000_000,
    }
}

fn product_name(metric: UsageMetric) -> &'static str {
    match metric {
        UsageMetric::Events => "Product analytics",
        UsageMetric::Recordings => "Session replay",
        UsageMetric::RowsSynced => "Data warehouse",
    }
}

/// Fraction of the limit consumed. Unlimited usage is always at 0.
pub fn percentage_usage(current: i64, limit: Option<i64>) -> f64 {
    match limit {
        Some(limit) if limit > 0 => current as f64 / limit as f64,
        _ => 0.0,
    }
}

/// Whether usage passed the limit. No limit configured means never exceeded.
pub fn has_exceeded_limit(current: i64, limit: Option<i64>) -> bool {
    match limit {
        Some(limit) => current > limit,
        None => false,
    }
}

/// Build the free-tier catalog with `current` filled in per metric.
pub fn default_products(current: &CurrentUsage) -> Vec<BillingProduct> {
    UsageMetric::ALL
        .iter()
        .map(|&metric| {
            let usage = current.metric(metric);
            let allocation = free_allocation(metric);
            BillingProduct {
                product_type: metric.as_str().to_string(),
                name: Some(product_name(metric).to_string()),
                usage_key: Some(metric.as_str().to_string()),
                current_usage: Some(usage),
                usage_limit: Some(allocation),
                todays_usage: None,
                free_allocation: Some(allocation),
                percentage_usage: percentage_usage(usage, Some(allocation)),
                has_exceeded_limit: has_exceeded_limit(usage, Some(allocation)),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_covers_every_metric() {
        let products = default_products(&CurrentUsage::default());
        assert_eq!(products.len(), UsageMetric::ALL.len());

        let types: Vec<&str> = products.iter().map(|p| p.product_type.as_str()).collect();
        assert_eq!(types, vec!["events", "recordings", "rows_synced"]);
        for product in &products {
            assert_eq!(product.current_usage, Some(0));
            assert_eq!(product.usage_limit, product.free_allocation);
            assert!(!product.has_exceeded_limit);
        }
    }

    #[test]
    fn test_catalog_reflects_current_usage() {
        let current = CurrentUsage {
            events: 500_000,
            recordings: 6_000,
            rows_synced: 0,
        };
        let products = default_products(&current);

        let events = &products[0];
        assert_eq!(events.current_usage, Some(500_000));
        assert!((events.percentage_usage - 0.5).abs() < f64::EPSILON);
        assert!(!events.has_exceeded_limit);

        let recordings = &products[1];
        assert_eq!(recordings.current_usage, Some(6_000));
        assert!(recordings.has_exceeded_limit);
    }

    #[test]
    fn test_percentage_usage_handles_unlimited() {
        assert_eq!(percentage_usage(1_000, None), 0.0);
        assert_eq!(percentage_usage(0, Some(100)), 0.0);
        assert!((percentage_usage(50, Some(100)) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_exceeded_limit_boundary() {
        assert!(!has_exceeded_limit(100, Some(100)));
        assert!(has_exceeded_limit(101, Some(100)));
        assert!(!has_exceeded_limit(i64::MAX, None));
    }
}
