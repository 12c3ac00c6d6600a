use super::{DetectedIssue, Detector, EventContext};
use async_trait::async_trait;
use chrono::Utc;
use revback_core::error::AppError;
use revback_core::models::{DetectionTier, Entitlement, EntitlementState, EventStatus, EventType, Severity};
use revback_core::repo;
use sqlx::PgPool;
use uuid::Uuid;

/// Flags a failed billing retry while the entitlement was still `active`
/// just before the reducer downgraded it — and, on schedule, entitlements
/// stuck `active` well past their period end.
pub struct EntitlementWithoutPayment;

#[async_trait]
impl Detector for EntitlementWithoutPayment {
    fn id(&self) -> &'static str {
        "entitlement_without_payment"
    }

    fn name(&self) -> &'static str {
        "Entitlement without payment"
    }

    fn description(&self) -> &'static str {
        "An entitlement remains active without a corresponding successful payment."
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
        if !matches!(
            (ctx.event.event_type, ctx.event.status),
            (EventType::BillingRetry, EventStatus::Failed)
        ) {
            return Ok(vec![]);
        }

        let was_active = ctx
            .prior
            .map(|e| e.state == EntitlementState::Active)
            .unwrap_or(false);
        if !was_active {
            return Ok(vec![]);
        }

        Ok(vec![DetectedIssue {
            issue_type: self.id(),
            severity: Severity::Warning,
            title: "Billing retry failed against an active entitlement".to_string(),
            description: format!(
                "A failed billing retry ({}) was recorded while the entitlement was still active.",
                ctx.event.external_event_id
            ),
            user_id: Some(ctx.event.user_id),
            estimated_revenue_cents: ctx.event.amount_cents,
            confidence: 0.8,
            evidence: serde_json::json!({"event_id": ctx.event.id}),
            detection_tier: DetectionTier::BillingOnly,
        }])
    }

    async fn scheduled_scan(&self, pool: &PgPool, org_id: Uuid) -> Result<Vec<DetectedIssue>, AppError> {
        let active = repo::Entitlement::list_by_states(pool, org_id, &[EntitlementState::Active]).await?;
        let now = Utc::now();

        let mut issues = Vec::new();
        for entitlement in &active {
            let Some(period_end) = entitlement.current_period_end else {
                continue;
            };
            let hours_past = (now - period_end).num_minutes() as f64 / 60.0;
            if hours_past < 2.0 {
                continue;
            }
            issues.push(issue_for(entitlement, hours_past));
        }
        Ok(issues)
    }
}

fn issue_for(entitlement: &Entitlement, hours_past: f64) -> DetectedIssue {
    let (severity, confidence) = if hours_past >= 24.0 {
        (Severity::Critical, 0.9)
    } else {
        (Severity::Warning, 0.7)
    };

    DetectedIssue {
        issue_type: "entitlement_without_payment",
        severity,
        title: "Active entitlement past its billing period".to_string(),
        description: format!(
            "Product {} has been active {hours_past:.1}h past its current period end with no renewal.",
            entitlement.product_id
        ),
        user_id: Some(entitlement.user_id),
        estimated_revenue_cents: None,
        confidence,
        evidence: serde_json::json!({
            "entitlement_id": entitlement.id,
            "hours_past_period_end": hours_past,
        }),
        detection_tier: DetectionTier::BillingOnly,
    }
}
