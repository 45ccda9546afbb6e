//! Billing routes: thin wrappers over the billing manager.

use std::collections::BTreeMap;

use axum::{
    extract::{Extension, Query, State},
    response::Redirect,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sightline_billing::BillingResponse;
use sightline_shared::{License, Organization, User};

use crate::{auth::AuthUser, error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct AttachLicenseRequest {
    pub license: String,
}

#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct InvoicesQuery {
    pub status: Option<String>,
}

async fn load_organization(state: &AppState, org_id: Uuid) -> Result<Organization, ApiError> {
    let organization: Option<Organization> = sqlx::query_as(
        r#"
        SELECT id, name, customer_id, usage, available_features,
               for_internal_metrics, created_at, updated_at
        FROM organizations
        WHERE id = $1
        "#,
    )
    .bind(org_id)
    .fetch_optional(&state.pool)
    .await?;

    organization.ok_or(ApiError::NoOrganization)
}

async fn load_user(state: &AppState, user_id: Uuid) -> Result<User, ApiError> {
    let user: Option<User> =
        sqlx::query_as("SELECT id, email, distinct_id, created_at FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&state.pool)
            .await?;

    user.ok_or(ApiError::InvalidToken)
}

/// Cached instance license, required for any call that talks to the billing
/// service on the caller's behalf.
async fn require_license(state: &AppState) -> Result<License, ApiError> {
    state
        .billing
        .license_cache
        .get()
        .await?
        .ok_or_else(|| ApiError::BadRequest("this instance has no billing license".to_string()))
}

fn forwarded_query(query: BTreeMap<String, String>) -> Vec<(String, String)> {
    query.into_iter().collect()
}

/// Current billing status. Unlicensed instances get the free-tier catalog,
/// never an error.
pub async fn get_billing(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Result<Json<BillingResponse>, ApiError> {
    let organization = load_organization(&state, auth_user.org_id).await?;
    let user = load_user(&state, auth_user.user_id).await?;
    let license = state.billing.license_cache.get().await?;

    let response = state
        .billing
        .manager
        .get_billing(
            license.as_ref(),
            &organization,
            Some(&user),
            &forwarded_query(query),
        )
        .await?;

    Ok(Json(response))
}

/// Update customer state: custom limits, startup flags, limit resets.
pub async fn update_billing(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<BillingResponse>, ApiError> {
    auth_user.require_admin()?;

    let organization = load_organization(&state, auth_user.org_id).await?;
    let user = load_user(&state, auth_user.user_id).await?;
    let license = require_license(&state).await?;

    let response = state
        .billing
        .manager
        .update_billing(&license, &organization, Some(&user), &payload)
        .await?;

    Ok(Json(response))
}

/// The instance license the billing account runs on, secret half masked.
pub async fn get_license(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
) -> Result<Json<super::license::LicenseResponse>, ApiError> {
    let license = state
        .billing
        .license_cache
        .get()
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(license.into()))
}

/// Hand the browser off to the billing service's subscription activation
/// flow, carrying a fresh billing token and the caller's plan selection.
pub async fn activate_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Result<Redirect, ApiError> {
    auth_user.require_admin()?;

    let organization = load_organization(&state, auth_user.org_id).await?;
    let user = load_user(&state, auth_user.user_id).await?;
    let license = require_license(&state).await?;

    let url = state
        .billing
        .manager
        .activation_url(&license, &organization, Some(&user), &forwarded_query(query))
        .await?;

    Ok(Redirect::temporary(&url))
}

/// Attach a license key to the organization's billing account.
pub async fn attach_license(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<AttachLicenseRequest>,
) -> Result<Json<BillingResponse>, ApiError> {
    auth_user.require_admin()?;

    let organization = load_organization(&state, auth_user.org_id).await?;
    let user = load_user(&state, auth_user.user_id).await?;

    let license = state
        .billing
        .manager
        .attach_license(&organization, Some(&user), &req.license)
        .await?;
    state.billing.license_cache.invalidate().await;

    let response = state
        .billing
        .manager
        .get_billing(Some(&license), &organization, Some(&user), &[])
        .await?;

    Ok(Json(response))
}

pub async fn get_usage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let organization = load_organization(&state, auth_user.org_id).await?;
    let user = load_user(&state, auth_user.user_id).await?;
    let license = require_license(&state).await?;

    let usage = state
        .billing
        .manager
        .get_usage(&license, &organization, Some(&user), &forwarded_query(query))
        .await?;

    Ok(Json(usage))
}

pub async fn get_spend(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<BTreeMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let organization = load_organization(&state, auth_user.org_id).await?;
    let user = load_user(&state, auth_user.user_id).await?;
    let license = require_license(&state).await?;

    let spend = state
        .billing
        .manager
        .get_spend(&license, &organization, Some(&user), &forwarded_query(query))
        .await?;

    Ok(Json(spend))
}

pub async fn get_invoices(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<InvoicesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let organization = load_organization(&state, auth_user.org_id).await?;
    let user = load_user(&state, auth_user.user_id).await?;
    let license = require_license(&state).await?;

    let invoices = state
        .billing
        .manager
        .get_invoices(&license, &organization, Some(&user), query.status.as_deref())
        .await?;

    Ok(Json(invoices))
}

/// Redirect target for the customer's self-serve billing portal.
pub async fn get_portal(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Result<Json<PortalResponse>, ApiError> {
    let organization = load_organization(&state, auth_user.org_id).await?;
    let user = load_user(&state, auth_user.user_id).await?;
    let license = require_license(&state).await?;

    let url = state
        .billing
        .manager
        .portal_url(&license, &organization, Some(&user))
        .await?;

    Ok(Json(PortalResponse { url }))
}

pub async fn purchase_credits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth_user.require_admin()?;

    let organization = load_organization(&state, auth_user.org_id).await?;
    let user = load_user(&state, auth_user.user_id).await?;
    let license = require_license(&state).await?;

    let result = state
        .billing
        .manager
        .purchase_credits(&license, &organization, Some(&user), &payload)
        .await?;

    Ok(Json(result))
}

pub async fn activate_trial(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth_user.require_admin()?;

    let organization = load_organization(&state, auth_user.org_id).await?;
    let user = load_user(&state, auth_user.user_id).await?;
    let license = require_license(&state).await?;

    let result = state
        .billing
        .manager
        .activate_trial(&license, &organization, Some(&user), &payload)
        .await?;

    Ok(Json(result))
}

/// Startup program application, forwarded to the billing service.
pub async fn apply_startup_program(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let organization = load_organization(&state, auth_user.org_id).await?;
    let user = load_user(&state, auth_user.user_id).await?;
    let license = require_license(&state).await?;

    let result = state
        .billing
        .manager
        .apply_startup_program(&license, &organization, Some(&user), &payload)
        .await?;

    Ok(Json(result))
}
