//! Billing audit events.
//!
//! Append-only log of sensitive billing operations: license lifecycle,
//! billing-token escalations, limit changes, usage report submissions.
//! Used to answer "who attached this license?" and to reconstruct the
//! history behind a subscription dispute.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of audited billing actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    LicenseActivated,
    LicenseCanceled,
    TokenEscalationAuthorized,
    CustomLimitsChanged,
    UsageReportSent,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditEventType::LicenseActivated => "LICENSE_ACTIVATED",
            AuditEventType::LicenseCanceled => "LICENSE_CANCELED",
            AuditEventType::TokenEscalationAuthorized => "TOKEN_ESCALATION_AUTHORIZED",
            AuditEventType::CustomLimitsChanged => "CUSTOM_LIMITS_CHANGED",
            AuditEventType::UsageReportSent => "USAGE_REPORT_SENT",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through the API
    User,
    /// Organization admin
    Admin,
    /// System automation (worker jobs)
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Admin => write!(f, "admin"),
            ActorType::System => write!(f, "system"),
        }
    }
}

/// A stored audit event
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEvent {
    pub id: Uuid,
    pub organization_id: Option<Uuid>,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub actor_id: Option<Uuid>,
    pub actor_type: String,
    pub created_at: OffsetDateTime,
}

/// Builder for audit events
pub struct AuditEventBuilder {
    organization_id: Option<Uuid>,
    event_type: AuditEventType,
    event_data: serde_json::Value,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
}

impl AuditEventBuilder {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            organization_id: None,
            event_type,
            event_data: serde_json::json!({}),
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    pub fn organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }
}

/// Service for recording and reading audit events
#[derive(Clone)]
pub struct BillingAuditLogger {
    pool: PgPool,
}

impl BillingAuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append an event, returning its id.
    pub async fn log(&self, builder: AuditEventBuilder) -> BillingResult<Uuid> {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_audit_events (
                organization_id,
                event_type,
                event_data,
                actor_id,
                actor_type
            )
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(builder.organization_id)
        .bind(builder.event_type.to_string())
        .bind(&builder.event_data)
        .bind(builder.actor_id)
        .bind(builder.actor_type.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(event_id.0)
    }

    /// Recent events for an organization, newest first.
    pub async fn events_for_org(
        &self,
        organization_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<AuditEvent>> {
        let events: Vec<AuditEvent> = sqlx::query_as(
            r#"
            SELECT id, organization_id, event_type, event_data, actor_id, actor_type, created_at
            FROM billing_audit_events
            WHERE organization_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(organization_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}
