//! Instance license management routes

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use sightline_billing::{ActorType, AuditEventBuilder, AuditEventType};
use sightline_shared::License;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// License as exposed over the API. The secret half of a v2 key never
/// leaves the instance.
#[derive(Debug, Serialize)]
pub struct LicenseResponse {
    pub id: Uuid,
    pub key: String,
    pub plan: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_until: Option<OffsetDateTime>,
    pub max_users: Option<i32>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<License> for LicenseResponse {
    fn from(license: License) -> Self {
        let key = match license.v2_parts() {
            Some((id, _)) => format!("{}::…", id),
            None => license.key.clone(),
        };
        Self {
            id: license.id,
            key,
            plan: license.plan,
            valid_until: license.valid_until,
            max_users: license.max_users,
            created_at: license.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ActivateLicenseRequest {
    pub key: String,
}

/// List all licenses on this instance
pub async fn list_licenses(
    State(state): State<AppState>,
    Extension(_auth_user): Extension<AuthUser>,
) -> Result<Json<Vec<LicenseResponse>>, ApiError> {
    let licenses = state.billing.licenses.list().await?;
    Ok(Json(licenses.into_iter().map(Into::into).collect()))
}

/// Activate a license key against the activation service and store the
/// canonical record it returns.
pub async fn create_license(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<ActivateLicenseRequest>,
) -> Result<(StatusCode, Json<LicenseResponse>), ApiError> {
    let activation = state.billing.client.activate_license(&req.key).await?;

    let license = state
        .billing
        .licenses
        .create(
            &req.key,
            &activation.plan,
            activation.valid_until,
            activation.max_users,
        )
        .await?;

    state.billing.license_cache.invalidate().await;

    let event = AuditEventBuilder::new(AuditEventType::LicenseActivated)
        .organization(auth_user.org_id)
        .actor(auth_user.user_id, ActorType::User)
        .data(serde_json::json!({ "license_id": license.id, "plan": license.plan }));
    if let Err(e) = state.billing.audit.log(event).await {
        tracing::warn!(error = %e, "Failed to record license activation audit event");
    }

    Ok((StatusCode::CREATED, Json(license.into())))
}

/// Cancel a license.
///
/// If no other valid license remains, every non-demo team across the
/// instance is deleted first; the licensed product does not run unlicensed.
pub async fn delete_license(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(license_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    auth_user.require_admin()?;

    let license = state
        .billing
        .licenses
        .get(license_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let mut teams_deleted = 0;
    if !state.billing.licenses.another_valid_exists(license.id).await? {
        teams_deleted = state.billing.licenses.delete_non_demo_teams().await?;
    }

    state.billing.licenses.delete(license.id).await?;
    state.billing.license_cache.invalidate().await;

    let event = AuditEventBuilder::new(AuditEventType::LicenseCanceled)
        .organization(auth_user.org_id)
        .actor(auth_user.user_id, ActorType::Admin)
        .data(serde_json::json!({
            "license_id": license.id,
            "plan": license.plan,
            "teams_deleted": teams_deleted,
        }));
    if let Err(e) = state.billing.audit.log(event).await {
        tracing::warn!(error = %e, "Failed to record license cancellation audit event");
    }

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_masks_v2_secret() {
        let license = License {
            id: Uuid::new_v4(),
            key: "lic_abc::super-secret".to_string(),
            plan: "scale".to_string(),
            valid_until: None,
            max_users: None,
            created_at: OffsetDateTime::now_utc(),
        };

        let response: LicenseResponse = license.into();
        assert_eq!(response.key, "lic_abc::…");
    }

    #[test]
    fn test_response_keeps_v1_key_verbatim() {
        let license = License {
            id: Uuid::new_v4(),
            key: "legacy-key".to_string(),
            plan: "enterprise".to_string(),
            valid_until: None,
            max_users: Some(10),
            created_at: OffsetDateTime::now_utc(),
        };

        let response: LicenseResponse = license.into();
        assert_eq!(response.key, "legacy-key");
        assert_eq!(response.max_users, Some(10));
    }
}
