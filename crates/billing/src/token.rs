//! Billing token construction.
//!
//! The remote billing service has no session store of its own. Instead every
//! call carries a short-lived HS256 token signed with the license key's
//! secret half, so possession of a verifiable token proves possession of the
//! license and names the organization (and optionally the acting user) it
//! speaks for.

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use sightline_shared::{is_cloud_deployment, License, MembershipLevel, Organization, User};

use crate::audit::{ActorType, AuditEventBuilder, AuditEventType, BillingAuditLogger};
use crate::error::{BillingError, BillingResult};

/// Audience the billing service validates tokens against
pub const BILLING_TOKEN_AUDIENCE: &str = "sightline:license-key";

/// Token lifetime in minutes
pub const BILLING_TOKEN_TTL_MINUTES: i64 = 15;

/// Claims carried by a billing token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingTokenClaims {
    /// Expiration (unix seconds)
    pub exp: i64,
    /// License key id half
    pub id: String,
    pub organization_id: Uuid,
    pub organization_name: String,
    /// Audience
    pub aud: String,
    /// Known analytics identities: org members on cloud, all local users
    /// on self-hosted instances.
    pub distinct_ids: Vec<String>,
    /// Acting user's analytics identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distinct_id: Option<String>,
    /// Readable role name the token acts with (member/administrator/owner)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_role: Option<String>,
    /// Present only for escalated tokens: the acting user's own role,
    /// or JSON null when that user holds no membership.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_role: Option<Option<String>>,
}

/// Role claims resolved from org memberships before signing.
#[derive(Debug, Default, PartialEq)]
struct ResolvedRoles {
    distinct_id: Option<String>,
    organization_role: Option<String>,
    original_role: Option<Option<String>>,
    /// Set when someone other than the acting user vouched for the token
    escalated_by: Option<Uuid>,
}

/// Decide the role claims for a token request.
///
/// A user acting alone must hold a membership. An authorizer distinct from
/// the user puts their own role on the token and records the user's actual
/// role (possibly none) as `original_role`.
fn resolve_roles(
    user: Option<&User>,
    user_level: Option<MembershipLevel>,
    authorizer: Option<&User>,
    authorizer_level: Option<MembershipLevel>,
) -> BillingResult<ResolvedRoles> {
    let mut roles = ResolvedRoles::default();

    if let Some(user) = user {
        roles.distinct_id = Some(user.distinct_id.clone());
    }

    match authorizer {
        Some(authorizer) if user.map(|u| u.id) != Some(authorizer.id) => {
            let level = authorizer_level.ok_or_else(|| {
                BillingError::NotAuthenticated(
                    "authorizer is not a member of the organization".into(),
                )
            })?;
            roles.organization_role = Some(level.role_name().to_string());
            roles.original_role = Some(user_level.map(|l| l.role_name().to_string()));
            roles.escalated_by = Some(authorizer.id);
        }
        _ => {
            if user.is_some() {
                let level = user_level.ok_or_else(|| {
                    BillingError::NotAuthenticated(
                        "user is not a member of the organization".into(),
                    )
                })?;
                roles.organization_role = Some(level.role_name().to_string());
            }
        }
    }

    Ok(roles)
}

/// Both halves of the billing context must exist before any token work;
/// callers pass options because "no license yet" is a routine state.
fn require_billing_context<'a>(
    license: Option<&'a License>,
    organization: Option<&'a Organization>,
) -> BillingResult<(&'a License, &'a Organization)> {
    let license =
        license.ok_or_else(|| BillingError::NotAuthenticated("no billing license".into()))?;
    let organization =
        organization.ok_or_else(|| BillingError::NotAuthenticated("no organization".into()))?;
    Ok((license, organization))
}

/// Assemble the claims and extract the signing secret from the license key.
fn build_claims(
    license: &License,
    organization: &Organization,
    distinct_ids: Vec<String>,
    roles: ResolvedRoles,
    now: OffsetDateTime,
) -> BillingResult<(BillingTokenClaims, String)> {
    let (key_id, secret) = license
        .v2_parts()
        .ok_or_else(|| BillingError::InvalidLicenseKey("only v2 keys can sign tokens".into()))?;

    let claims = BillingTokenClaims {
        exp: (now + Duration::minutes(BILLING_TOKEN_TTL_MINUTES)).unix_timestamp(),
        id: key_id.to_string(),
        organization_id: organization.id,
        organization_name: organization.name.clone(),
        aud: BILLING_TOKEN_AUDIENCE.to_string(),
        distinct_ids,
        distinct_id: roles.distinct_id,
        organization_role: roles.organization_role,
        original_role: roles.original_role,
    };

    Ok((claims, secret.to_string()))
}

fn sign_claims(claims: &BillingTokenClaims, secret: &str) -> BillingResult<String> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| BillingError::TokenEncoding(e.to_string()))
}

/// Issues billing tokens, resolving membership roles from the database.
#[derive(Clone)]
pub struct BillingTokenIssuer {
    pool: PgPool,
    audit: BillingAuditLogger,
}

impl BillingTokenIssuer {
    pub fn new(pool: PgPool) -> Self {
        let audit = BillingAuditLogger::new(pool.clone());
        Self { pool, audit }
    }

    /// Build a signed token for `license` + `organization`.
    ///
    /// `user` adds `distinct_id`/`organization_role` claims and must be an
    /// org member unless `authorizer` (a different member) vouches for them,
    /// in which case the token carries the authorizer's role and the
    /// escalation is written to the audit log.
    pub async fn build_token(
        &self,
        license: Option<&License>,
        organization: Option<&Organization>,
        user: Option<&User>,
        authorizer: Option<&User>,
    ) -> BillingResult<String> {
        let (license, organization) = require_billing_context(license, organization)?;

        let distinct_ids = if is_cloud_deployment() {
            self.org_member_distinct_ids(organization.id).await?
        } else {
            self.all_distinct_ids().await?
        };

        let user_level = match user {
            Some(u) => self.membership_level(organization.id, u.id).await?,
            None => None,
        };
        let authorizer_level = match authorizer {
            Some(a) if user.map(|u| u.id) != Some(a.id) => {
                self.membership_level(organization.id, a.id).await?
            }
            _ => None,
        };

        let roles = resolve_roles(user, user_level, authorizer, authorizer_level)?;
        let escalated_by = roles.escalated_by;

        let (claims, secret) =
            build_claims(license, organization, distinct_ids, roles, OffsetDateTime::now_utc())?;
        let token = sign_claims(&claims, &secret)?;

        if let Some(authorizer_id) = escalated_by {
            tracing::info!(
                organization_id = %organization.id,
                authorizer_id = %authorizer_id,
                "Billing token escalation authorized"
            );
            let event = AuditEventBuilder::new(AuditEventType::TokenEscalationAuthorized)
                .organization(organization.id)
                .actor(authorizer_id, ActorType::User)
                .data(serde_json::json!({
                    "acting_user_id": user.map(|u| u.id),
                    "organization_role": claims.organization_role,
                    "original_role": claims.original_role,
                }));
            // Token issuance must not fail because the audit insert did.
            if let Err(e) = self.audit.log(event).await {
                tracing::warn!(error = %e, "Failed to record token escalation audit event");
            }
        }

        Ok(token)
    }

    async fn membership_level(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> BillingResult<Option<MembershipLevel>> {
        let level: Option<MembershipLevel> = sqlx::query_scalar(
            "SELECT level FROM organization_memberships WHERE organization_id = $1 AND user_id = $2",
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(level)
    }

    async fn org_member_distinct_ids(&self, organization_id: Uuid) -> BillingResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT u.distinct_id
            FROM users u
            JOIN organization_memberships m ON m.user_id = u.id
            WHERE m.organization_id = $1
            ORDER BY u.created_at
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn all_distinct_ids(&self) -> BillingResult<Vec<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT distinct_id FROM users ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;

        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use sightline_shared::OrganizationUsage;

    fn decode_claims(token: &str, secret: &str) -> BillingTokenClaims {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60;
        validation.set_audience(&[BILLING_TOKEN_AUDIENCE]);
        decode::<BillingTokenClaims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .expect("token should verify")
        .claims
    }

    fn make_license(key: &str) -> License {
        License {
            id: Uuid::new_v4(),
            key: key.to_string(),
            plan: "enterprise".to_string(),
            valid_until: Some(OffsetDateTime::now_utc() + Duration::days(30)),
            max_users: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn make_org(name: &str) -> Organization {
        Organization {
            id: Uuid::new_v4(),
            name: name.to_string(),
            customer_id: None,
            usage: sqlx::types::Json(OrganizationUsage::default()),
            available_features: sqlx::types::Json(Vec::new()),
            for_internal_metrics: false,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    fn make_user(distinct_id: &str) -> User {
        User {
            id: Uuid::new_v4(),
            email: format!("{}@example.com", distinct_id),
            distinct_id: distinct_id.to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_signed_token_round_trips() {
        let license = make_license("lic_123::secret_abc");
        let org = make_org("Acme");
        let now = OffsetDateTime::now_utc();

        let (claims, secret) = build_claims(
            &license,
            &org,
            vec!["a".to_string(), "b".to_string()],
            ResolvedRoles::default(),
            now,
        )
        .expect("claims should build");
        assert_eq!(secret, "secret_abc");

        let token = sign_claims(&claims, &secret).expect("signing should succeed");
        let decoded = decode_claims(&token, "secret_abc");

        assert_eq!(decoded.id, "lic_123");
        assert_eq!(decoded.organization_id, org.id);
        assert_eq!(decoded.organization_name, "Acme");
        assert_eq!(decoded.aud, BILLING_TOKEN_AUDIENCE);
        assert_eq!(decoded.distinct_ids, vec!["a", "b"]);
        assert!(decoded.distinct_id.is_none());
        assert!(decoded.organization_role.is_none());
        assert!(decoded.original_role.is_none());
    }

    #[test]
    fn test_token_expiry_is_fifteen_minutes() {
        let license = make_license("id::secret");
        let org = make_org("Acme");
        let now = OffsetDateTime::now_utc();

        let (claims, _) =
            build_claims(&license, &org, vec![], ResolvedRoles::default(), now).unwrap();

        assert_eq!(
            claims.exp,
            (now + Duration::minutes(BILLING_TOKEN_TTL_MINUTES)).unix_timestamp()
        );
    }

    #[test]
    fn test_v1_key_cannot_sign() {
        let license = make_license("legacy-key-without-separator");
        let org = make_org("Acme");

        let result = build_claims(
            &license,
            &org,
            vec![],
            ResolvedRoles::default(),
            OffsetDateTime::now_utc(),
        );
        assert!(matches!(result, Err(BillingError::InvalidLicenseKey(_))));
    }

    #[test]
    fn test_wrong_secret_fails_verification() {
        let license = make_license("id::right-secret");
        let org = make_org("Acme");
        let (claims, secret) = build_claims(
            &license,
            &org,
            vec![],
            ResolvedRoles::default(),
            OffsetDateTime::now_utc(),
        )
        .unwrap();
        let token = sign_claims(&claims, &secret).unwrap();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[BILLING_TOKEN_AUDIENCE]);
        let result = decode::<BillingTokenClaims>(
            &token,
            &DecodingKey::from_secret(b"wrong-secret"),
            &validation,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let license = make_license("id::secret");
        let org = make_org("Acme");
        // Backdate past the 60s verification leeway.
        let issued = OffsetDateTime::now_utc()
            - Duration::minutes(BILLING_TOKEN_TTL_MINUTES)
            - Duration::minutes(5);

        let (claims, secret) =
            build_claims(&license, &org, vec![], ResolvedRoles::default(), issued).unwrap();
        let token = sign_claims(&claims, &secret).unwrap();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[BILLING_TOKEN_AUDIENCE]);
        let result = decode::<BillingTokenClaims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_license_is_not_authenticated() {
        let org = make_org("Acme");

        let result = require_billing_context(None, Some(&org));
        assert!(matches!(result, Err(BillingError::NotAuthenticated(_))));
    }

    #[test]
    fn test_missing_organization_is_not_authenticated() {
        let license = make_license("id::secret");

        let result = require_billing_context(Some(&license), None);
        assert!(matches!(result, Err(BillingError::NotAuthenticated(_))));
    }

    #[test]
    fn test_present_context_passes_through() {
        let license = make_license("id::secret");
        let org = make_org("Acme");

        let (l, o) = require_billing_context(Some(&license), Some(&org))
            .expect("full context should resolve");
        assert_eq!(l.id, license.id);
        assert_eq!(o.id, org.id);
    }

    #[test]
    fn test_sole_user_requires_membership() {
        let user = make_user("u1");

        let result = resolve_roles(Some(&user), None, None, None);
        assert!(matches!(result, Err(BillingError::NotAuthenticated(_))));
    }

    #[test]
    fn test_member_user_gets_role_claims() {
        let user = make_user("u1");

        let roles = resolve_roles(Some(&user), Some(MembershipLevel::Admin), None, None)
            .expect("member should resolve");

        assert_eq!(roles.distinct_id.as_deref(), Some("u1"));
        assert_eq!(roles.organization_role.as_deref(), Some("administrator"));
        assert!(roles.original_role.is_none());
        assert!(roles.escalated_by.is_none());
    }

    #[test]
    fn test_escalation_uses_authorizer_role() {
        let user = make_user("u1");
        let authorizer = make_user("boss");

        let roles = resolve_roles(
            Some(&user),
            Some(MembershipLevel::Member),
            Some(&authorizer),
            Some(MembershipLevel::Owner),
        )
        .expect("escalation should resolve");

        assert_eq!(roles.organization_role.as_deref(), Some("owner"));
        assert_eq!(roles.original_role, Some(Some("member".to_string())));
        assert_eq!(roles.escalated_by, Some(authorizer.id));
        assert_eq!(roles.distinct_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_escalation_for_nonmember_user_records_null_role() {
        let user = make_user("outsider");
        let authorizer = make_user("boss");

        let roles = resolve_roles(
            Some(&user),
            None,
            Some(&authorizer),
            Some(MembershipLevel::Admin),
        )
        .expect("escalation should resolve");
        assert_eq!(roles.original_role, Some(None));

        // A recorded-but-null original role must serialize as JSON null,
        // not disappear.
        let license = make_license("id::secret");
        let org = make_org("Acme");
        let (claims, _) =
            build_claims(&license, &org, vec![], roles, OffsetDateTime::now_utc()).unwrap();
        let value = serde_json::to_value(&claims).unwrap();
        assert!(value["original_role"].is_null());
        assert!(value.as_object().unwrap().contains_key("original_role"));
    }

    #[test]
    fn test_unescalated_claims_omit_original_role() {
        let user = make_user("u1");
        let roles =
            resolve_roles(Some(&user), Some(MembershipLevel::Member), None, None).unwrap();

        let license = make_license("id::secret");
        let org = make_org("Acme");
        let (claims, _) =
            build_claims(&license, &org, vec![], roles, OffsetDateTime::now_utc()).unwrap();
        let value = serde_json::to_value(&claims).unwrap();
        assert!(!value.as_object().unwrap().contains_key("original_role"));
    }

    #[test]
    fn test_nonmember_authorizer_fails() {
        let user = make_user("u1");
        let authorizer = make_user("impostor");

        let result = resolve_roles(
            Some(&user),
            Some(MembershipLevel::Member),
            Some(&authorizer),
            None,
        );
        assert!(matches!(result, Err(BillingError::NotAuthenticated(_))));
    }

    #[test]
    fn test_self_authorization_is_not_escalation() {
        let user = make_user("u1");

        let roles = resolve_roles(
            Some(&user),
            Some(MembershipLevel::Member),
            Some(&user),
            None,
        )
        .expect("self-authorized member should resolve");

        assert_eq!(roles.organization_role.as_deref(), Some("member"));
        assert!(roles.original_role.is_none());
        assert!(roles.escalated_by.is_none());
    }
}
