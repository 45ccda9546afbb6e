//! HTTP client for the remote billing service.
//!
//! Thin, typed wrapper around the billing API and the license activation
//! endpoint. Every call is a single round trip authenticated with a billing
//! token; there are no retries here, callers own that decision.

use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use sightline_shared::MetricUsageUpdate;

use crate::error::{BillingError, BillingResult};

const DEFAULT_BILLING_SERVICE_URL: &str = "https://billing.sightline.com";
const DEFAULT_LICENSE_ACTIVATION_URL: &str = "https://license.sightline.com";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// Configuration
// =============================================================================

/// Endpoints and timeout for the billing service
#[derive(Debug, Clone)]
pub struct BillingApiConfig {
    /// Base URL of the billing service (no trailing slash)
    pub url: String,
    /// Base URL of the license activation endpoint (no trailing slash)
    pub license_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl BillingApiConfig {
    /// Load from `BILLING_SERVICE_URL`, `LICENSE_ACTIVATION_URL` and
    /// `BILLING_HTTP_TIMEOUT_SECS`, falling back to production defaults.
    pub fn from_env() -> BillingResult<Self> {
        let url = std::env::var("BILLING_SERVICE_URL")
            .unwrap_or_else(|_| DEFAULT_BILLING_SERVICE_URL.to_string());
        let license_url = std::env::var("LICENSE_ACTIVATION_URL")
            .unwrap_or_else(|_| DEFAULT_LICENSE_ACTIVATION_URL.to_string());
        let timeout_secs = match std::env::var("BILLING_HTTP_TIMEOUT_SECS") {
            Ok(raw) => raw.parse().map_err(|_| {
                BillingError::Config(format!("invalid BILLING_HTTP_TIMEOUT_SECS: {}", raw))
            })?,
            Err(_) => DEFAULT_HTTP_TIMEOUT_SECS,
        };

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            license_url: license_url.trim_end_matches('/').to_string(),
            timeout_secs,
        })
    }
}

// =============================================================================
// Billing service payloads
// =============================================================================

/// License state as reported by the billing service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLicense {
    /// Plan name; the wire field is `type`
    #[serde(rename = "type")]
    pub plan: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_until: Option<OffsetDateTime>,
}

/// Current billing period bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingPeriodPayload {
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
}

/// Per-metric usage snapshot reported for unsubscribed customers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageSummary {
    pub events: Option<MetricUsageUpdate>,
    pub recordings: Option<MetricUsageUpdate>,
    pub rows_synced: Option<MetricUsageUpdate>,
}

/// One product entry in the billing status payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingProduct {
    /// Product identifier; the wire field is `type`
    #[serde(rename = "type")]
    pub product_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub usage_key: Option<String>,
    #[serde(default)]
    pub current_usage: Option<i64>,
    /// None means unlimited
    #[serde(default)]
    pub usage_limit: Option<i64>,
    #[serde(default)]
    pub todays_usage: Option<i64>,
    #[serde(default)]
    pub free_allocation: Option<i64>,
    #[serde(default)]
    pub percentage_usage: f64,
    #[serde(default)]
    pub has_exceeded_limit: bool,
}

/// Customer block of the billing status payload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingCustomer {
    pub customer_id: Option<String>,
    pub deactivated: bool,
    pub has_active_subscription: bool,
    pub billing_period: Option<BillingPeriodPayload>,
    pub available_features: Vec<String>,
    pub products: Option<Vec<BillingProduct>>,
    pub usage_summary: Option<UsageSummary>,
}

/// Response of `GET /api/billing`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingStatus {
    pub license: Option<RemoteLicense>,
    pub customer: Option<BillingCustomer>,
}

/// Canonical license record returned by the activation endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseActivation {
    pub plan: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_until: Option<OffsetDateTime>,
    #[serde(default)]
    pub max_users: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceErrorPayload {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PortalResponse {
    url: String,
}

// =============================================================================
// Client
// =============================================================================

/// Client for the billing service and the license activation endpoint
#[derive(Clone)]
pub struct BillingApiClient {
    http: Client,
    config: BillingApiConfig,
}

impl BillingApiClient {
    pub fn new(config: BillingApiConfig) -> BillingResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(BillingApiConfig::from_env()?)
    }

    /// Fetch the billing status for the organization behind `token`.
    ///
    /// 404 and 401 mean "no subscription known", a supported state, and map
    /// to `Ok(None)`. Any other non-success status is an error.
    pub async fn get_billing(
        &self,
        token: &str,
        query: &[(String, String)],
    ) -> BillingResult<Option<BillingStatus>> {
        let res = self
            .http
            .get(format!("{}/api/billing", self.config.url))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .query(query)
            .send()
            .await?;

        match res.status() {
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED => Ok(None),
            _ => {
                let res = Self::error_for_status(res).await?;
                Ok(Some(res.json::<BillingStatus>().await?))
            }
        }
    }

    /// Update customer state (custom limits, startup program flags, license
    /// attach). The caller re-fetches billing status afterwards.
    pub async fn update_billing(
        &self,
        token: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<()> {
        let res = self
            .http
            .patch(format!("{}/api/billing/", self.config.url))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .json(payload)
            .send()
            .await?;

        Self::error_for_status(res).await?;
        Ok(())
    }

    /// Product catalog as the billing service advertises it.
    pub async fn get_products(&self, token: &str) -> BillingResult<serde_json::Value> {
        self.get_json("/api/products", token, &[]).await
    }

    /// Available subscription plans.
    pub async fn get_plans(&self, token: &str) -> BillingResult<serde_json::Value> {
        self.get_json("/api/plans", token, &[]).await
    }

    pub async fn get_usage(
        &self,
        token: &str,
        query: &[(String, String)],
    ) -> BillingResult<serde_json::Value> {
        self.get_json("/api/usage", token, query).await
    }

    pub async fn get_spend(
        &self,
        token: &str,
        query: &[(String, String)],
    ) -> BillingResult<serde_json::Value> {
        self.get_json("/api/spend", token, query).await
    }

    pub async fn get_invoices(
        &self,
        token: &str,
        status: Option<&str>,
    ) -> BillingResult<serde_json::Value> {
        let query: Vec<(String, String)> = status
            .map(|s| vec![("status".to_string(), s.to_string())])
            .unwrap_or_default();
        self.get_json("/api/billing/invoices", token, &query).await
    }

    /// Resolve the customer's self-serve billing portal URL.
    pub async fn portal_url(&self, token: &str) -> BillingResult<String> {
        let res = self
            .http
            .get(format!("{}/api/billing/portal", self.config.url))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;

        let res = Self::error_for_status(res).await?;
        let payload: PortalResponse = res.json().await?;
        Ok(payload.url)
    }

    /// URL for the billing service's self-serve subscription activation
    /// flow. The billing token rides along as a query parameter so the
    /// service can attribute the session; remaining pairs (plan selection,
    /// redirect path) are forwarded as given.
    pub fn activation_url(
        &self,
        token: &str,
        query: &[(String, String)],
    ) -> BillingResult<String> {
        let mut url = reqwest::Url::parse(&format!("{}/activate", self.config.url))
            .map_err(|e| BillingError::Config(format!("invalid billing service url: {}", e)))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("token", token);
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url.to_string())
    }

    pub async fn purchase_credits(
        &self,
        token: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<serde_json::Value> {
        self.post_json("/api/credits/purchase", token, payload).await
    }

    pub async fn activate_trial(
        &self,
        token: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<serde_json::Value> {
        self.post_json("/api/trials/activate", token, payload).await
    }

    pub async fn apply_startup_program(
        &self,
        token: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<serde_json::Value> {
        self.post_json("/api/startups/apply", token, payload).await
    }

    /// Submit an aggregated usage report.
    pub async fn post_usage_report(
        &self,
        token: &str,
        report: &serde_json::Value,
    ) -> BillingResult<()> {
        let res = self
            .http
            .post(format!("{}/api/usage", self.config.url))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .json(report)
            .send()
            .await?;

        Self::error_for_status(res).await?;
        Ok(())
    }

    /// Activate a license key against the activation endpoint.
    ///
    /// A rejection surfaces the endpoint's `code`/`detail` fields verbatim
    /// so API clients can show them.
    pub async fn activate_license(&self, key: &str) -> BillingResult<LicenseActivation> {
        let res = self
            .http
            .post(format!("{}/licenses/activate", self.config.license_url))
            .json(&serde_json::json!({ "key": key }))
            .send()
            .await?;

        if res.status().is_success() {
            return Ok(res.json::<LicenseActivation>().await?);
        }

        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        tracing::warn!(status = %status, "License activation rejected");

        let payload: ServiceErrorPayload = serde_json::from_str(&body).unwrap_or_default();
        Err(BillingError::License {
            code: payload.code.unwrap_or_else(|| "activation_error".to_string()),
            detail: payload
                .detail
                .unwrap_or_else(|| "License could not be activated.".to_string()),
        })
    }

    async fn get_json(
        &self,
        path: &str,
        token: &str,
        query: &[(String, String)],
    ) -> BillingResult<serde_json::Value> {
        let res = self
            .http
            .get(format!("{}{}", self.config.url, path))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .query(query)
            .send()
            .await?;

        let res = Self::error_for_status(res).await?;
        Ok(res.json().await?)
    }

    async fn post_json(
        &self,
        path: &str,
        token: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<serde_json::Value> {
        let res = self
            .http
            .post(format!("{}{}", self.config.url, path))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .json(payload)
            .send()
            .await?;

        let res = Self::error_for_status(res).await?;
        Ok(res.json().await?)
    }

    /// Accept any success status; map everything else to a typed error,
    /// logging status and body.
    async fn error_for_status(res: reqwest::Response) -> BillingResult<reqwest::Response> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }

        let body = res.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %body, "Billing service returned an error");

        let payload: ServiceErrorPayload = serde_json::from_str(&body).unwrap_or_default();
        Err(BillingError::ServiceResponse {
            status: status.as_u16(),
            detail: payload.detail.unwrap_or(body),
            code: payload.code,
            link: payload.link,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn test_client(server: &mockito::ServerGuard) -> BillingApiClient {
        let config = BillingApiConfig {
            url: server.url(),
            license_url: server.url(),
            timeout_secs: 5,
        };
        BillingApiClient::new(config).expect("client should build")
    }

    #[tokio::test]
    async fn test_get_billing_parses_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/billing")
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "license": {"type": "scale", "valid_until": "2026-01-15T00:00:00Z"},
                    "customer": {
                        "customer_id": "cus_123",
                        "has_active_subscription": true,
                        "available_features": ["zapier", "saml"],
                        "products": [
                            {"type": "events", "usage_key": "events", "current_usage": 1200, "usage_limit": 1000000}
                        ]
                    }
                }"#,
            )
            .create_async()
            .await;

        let client = test_client(&server);
        let status = client
            .get_billing("tok", &[])
            .await
            .expect("call should succeed")
            .expect("status expected");

        mock.assert_async().await;

        let license = status.license.expect("license block expected");
        assert_eq!(license.plan, "scale");
        assert_eq!(license.valid_until, Some(datetime!(2026-01-15 0:00 UTC)));

        let customer = status.customer.expect("customer block expected");
        assert_eq!(customer.customer_id.as_deref(), Some("cus_123"));
        assert!(customer.has_active_subscription);
        assert_eq!(customer.available_features, vec!["zapier", "saml"]);

        let products = customer.products.expect("products expected");
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].product_type, "events");
        assert_eq!(products[0].current_usage, Some(1200));
        assert_eq!(products[0].usage_limit, Some(1_000_000));
    }

    #[tokio::test]
    async fn test_get_billing_404_means_no_subscription() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/billing")
            .with_status(404)
            .create_async()
            .await;

        let client = test_client(&server);
        let status = client
            .get_billing("tok", &[])
            .await
            .expect("404 is not an error");
        assert!(status.is_none());
    }

    #[tokio::test]
    async fn test_get_billing_401_means_no_subscription() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/billing")
            .with_status(401)
            .create_async()
            .await;

        let client = test_client(&server);
        let status = client
            .get_billing("tok", &[])
            .await
            .expect("401 is not an error");
        assert!(status.is_none());
    }

    #[tokio::test]
    async fn test_get_billing_server_error_is_typed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/billing")
            .with_status(500)
            .with_body(r#"{"detail": "upstream exploded", "code": "server_error"}"#)
            .create_async()
            .await;

        let client = test_client(&server);
        let err = client
            .get_billing("tok", &[])
            .await
            .expect_err("500 is an error");

        match err {
            BillingError::ServiceResponse {
                status,
                detail,
                code,
                ..
            } => {
                assert_eq!(status, 500);
                assert_eq!(detail, "upstream exploded");
                assert_eq!(code.as_deref(), Some("server_error"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_activate_license_success() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/licenses/activate")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"plan": "enterprise", "valid_until": "2027-06-01T00:00:00Z", "max_users": 50}"#,
            )
            .create_async()
            .await;

        let client = test_client(&server);
        let activation = client
            .activate_license("id::secret")
            .await
            .expect("activation should succeed");

        assert_eq!(activation.plan, "enterprise");
        assert_eq!(activation.valid_until, Some(datetime!(2027-06-01 0:00 UTC)));
        assert_eq!(activation.max_users, Some(50));
    }

    #[tokio::test]
    async fn test_activate_license_rejection_surfaces_code_and_detail() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/licenses/activate")
            .with_status(400)
            .with_body(
                r#"{"type": "validation_error", "code": "invalid_key", "detail": "Provided key is invalid.", "attr": null}"#,
            )
            .create_async()
            .await;

        let client = test_client(&server);
        let err = client
            .activate_license("bogus")
            .await
            .expect_err("rejection is an error");

        match err {
            BillingError::License { code, detail } => {
                assert_eq!(code, "invalid_key");
                assert_eq!(detail, "Provided key is invalid.");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_post_usage_report_sends_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/usage")
            .match_header("authorization", "Bearer report-token")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = test_client(&server);
        client
            .post_usage_report("report-token", &serde_json::json!({"organization_id": "x"}))
            .await
            .expect("report should send");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_products_and_plans_are_passthroughs() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/products")
            .with_status(200)
            .with_body(r#"{"products": [{"type": "events"}]}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/api/plans")
            .with_status(200)
            .with_body(r#"{"plans": [{"plan_key": "scale"}]}"#)
            .create_async()
            .await;

        let client = test_client(&server);
        let products = client.get_products("tok").await.expect("products");
        assert_eq!(products["products"][0]["type"], "events");

        let plans = client.get_plans("tok").await.expect("plans");
        assert_eq!(plans["plans"][0]["plan_key"], "scale");
    }

    #[test]
    fn test_activation_url_carries_token_and_query() {
        let config = BillingApiConfig {
            url: "https://billing.example.com".to_string(),
            license_url: "https://license.example.com".to_string(),
            timeout_secs: 5,
        };
        let client = BillingApiClient::new(config).expect("client should build");

        let url = client
            .activation_url(
                "tok123",
                &[("products".to_string(), "events:scale".to_string())],
            )
            .expect("url should build");

        assert_eq!(
            url,
            "https://billing.example.com/activate?token=tok123&products=events%3Ascale"
        );
    }

    #[tokio::test]
    async fn test_portal_url_extracted() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/billing/portal")
            .with_status(200)
            .with_body(r#"{"url": "https://billing.example.com/portal/session"}"#)
            .create_async()
            .await;

        let client = test_client(&server);
        let url = client.portal_url("tok").await.expect("portal url expected");
        assert_eq!(url, "https://billing.example.com/portal/session");
    }

    #[tokio::test]
    async fn test_update_billing_propagates_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PATCH", "/api/billing/")
            .with_status(403)
            .with_body(r#"{"detail": "forbidden"}"#)
            .create_async()
            .await;

        let client = test_client(&server);
        let err = client
            .update_billing(
                "tok",
                &serde_json::json!({"custom_limits_usd": {"events": 100}}),
            )
            .await
            .expect_err("403 is an error");

        assert!(matches!(
            err,
            BillingError::ServiceResponse { status: 403, .. }
        ));
    }
}
