use super::{DetectedIssue, Detector, EventContext};
use async_trait::async_trait;
use chrono::Utc;
use revback_core::error::AppError;
use revback_core::models::{DetectionTier, Entitlement, EventStatus, EventType, Severity};
use revback_core::repo;
use sqlx::PgPool;
use uuid::Uuid;

/// Flags a success purchase/renewal whose entitlement is still inactive
/// after the reducer ran — the reducer only skips an update when the event
/// is stale (P3), so this catches money that was recorded but never
/// translated into access.
pub struct PaymentWithoutEntitlement;

#[async_trait]
impl Detector for PaymentWithoutEntitlement {
    fn id(&self) -> &'static str {
        "payment_without_entitlement"
    }

    fn name(&self) -> &'static str {
        "Payment without entitlement"
    }

    fn description(&self) -> &'static str {
        "A successful purchase or renewal event did not result in an active entitlement."
    }

    fn has_scheduled_scan(&self) -> bool {
        true
    }

    async fn check_event(
        &self,
        _pool: &PgPool,
        _org_id: Uuid,
        ctx: &EventContext<'_>,
    ) -> Result<Vec<DetectedIssue>, AppError> {
        let is_payment = matches!(
            (ctx.event.event_type, ctx.event.status),
            (EventType::Purchase, EventStatus::Success) | (EventType::Renewal, EventStatus::Success)
        );
        if !is_payment {
            return Ok(vec![]);
        }

        let Some(current) = ctx.current else {
            return Ok(vec![]);
        };
        if current.state.is_active_family() {
            return Ok(vec![]);
        }

        Ok(vec![DetectedIssue {
            issue_type: self.id(),
            severity: Severity::Critical,
            title: "Payment recorded without a resulting active entitlement".to_string(),
            description: format!(
                "A {:?} event ({}) for product {} did not activate the entitlement, currently {:?}.",
                ctx.event.event_type, ctx.event.external_event_id, current.product_id, current.state
            ),
            user_id: Some(ctx.event.user_id),
            estimated_revenue_cents: ctx.event.amount_cents,
            confidence: 0.95,
            evidence: serde_json::json!({
                "event_id": ctx.event.id,
                "external_event_id": ctx.event.external_event_id,
                "entitlement_state": current.state,
            }),
            detection_tier: DetectionTier::BillingOnly,
        }])
    }

    /// Inactive entitlements with a success purchase/renewal event in the
    /// last 30 minutes — catches the same condition when the event path
    /// detector was skipped (e.g. job retried after a partial failure).
    async fn scheduled_scan(&self, pool: &PgPool, org_id: Uuid) -> Result<Vec<DetectedIssue>, AppError> {
        let inactive = repo::Entitlement::list_by_states(
            pool,
            org_id,
            &[
                revback_core::models::EntitlementState::Inactive,
                revback_core::models::EntitlementState::Expired,
                revback_core::models::EntitlementState::Revoked,
                revback_core::models::EntitlementState::Refunded,
            ],
        )
        .await?;

        let mut issues = Vec::new();
        let since = Utc::now() - chrono::Duration::minutes(30);
        for entitlement in &inactive {
            let recent = repo::CanonicalEvent::list_since(
                pool,
                org_id,
                entitlement.user_id,
                &entitlement.product_id,
                since,
            )
            .await?;
            if recent
                .iter()
                .any(|e| is_recent_payment(e.event_type, e.status))
            {
                issues.push(issue_for(entitlement));
            }
        }
        Ok(issues)
    }
}

fn is_recent_payment(event_type: EventType, status: EventStatus) -> bool {
    matches!(
        (event_type, status),
        (EventType::Purchase, EventStatus::Success) | (EventType::Renewal, EventStatus::Success)
    )
}

fn issue_for(entitlement: &Entitlement) -> DetectedIssue {
    DetectedIssue {
        issue_type: "payment_without_entitlement",
        severity: Severity::Critical,
        title: "Payment recorded without a resulting active entitlement".to_string(),
        description: format!(
            "Product {} is {:?} despite a successful payment event in the last 30 minutes.",
            entitlement.product_id, entitlement.state
        ),
        user_id: Some(entitlement.user_id),
        estimated_revenue_cents: None,
        confidence: 0.95,
        evidence: serde_json::json!({"entitlement_id": entitlement.id, "state": entitlement.state}),
        detection_tier: DetectionTier::BillingOnly,
    }
}
