// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Sightline Shared Types and Utilities
//!
//! This crate contains the models, usage accounting types, and database
//! helpers shared across the Sightline licensing platform.

pub mod db;
pub mod types;
pub mod usage;

pub use db::*;
pub use types::*;
pub use usage::{BillingPeriod, MetricUsage, MetricUsageUpdate, OrganizationUsage, UsageMetric};
