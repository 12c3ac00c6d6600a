use super::{DetectedIssue, Detector, EventContext};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use revback_core::error::AppError;
use revback_core::models::{DetectionTier, EventType, Severity};
use sqlx::PgPool;
use uuid::Uuid;

fn grace_window() -> Duration {
    Duration::hours(1)
}

fn scan_window() -> Duration {
    Duration::days(30)
}

/// A refund or chargeback event recorded while the entitlement it targets
/// remained in an active-family state past the grace window — revenue
/// clawed back without access being revoked.
pub struct UnrevokedRefund;

#[async_trait]
impl Detector for UnrevokedRefund {
    fn id(&self) -> &'static str {
        "unrevoked_refund"
    }

    fn name(&self) -> &'static str {
        "Unrevoked refund"
    }

    fn description(&self) -> &'static str {
        "A refund or chargeback was recorded but the entitlement was not promptly revoked."
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
        let Some(severity) = severity_for(ctx.event.event_type) else {
            return Ok(vec![]);
        };

        let age = Utc::now() - ctx.event.event_time;
        if age < grace_window() {
            return Ok(vec![]);
        }

        let still_active = ctx.prior.map(|e| e.state.is_active_family()).unwrap_or(false);
        if !still_active {
            return Ok(vec![]);
        }

        Ok(vec![DetectedIssue {
            issue_type: self.id(),
            severity,
            title: "Refund or chargeback recorded without revoking access".to_string(),
            description: format!(
                "A {:?} event ({}) is {} old and the entitlement was still active.",
                ctx.event.event_type,
                ctx.event.external_event_id,
                format_age(age),
            ),
            user_id: Some(ctx.event.user_id),
            estimated_revenue_cents: ctx.event.amount_cents,
            confidence: 0.85,
            evidence: serde_json::json!({"event_id": ctx.event.id, "age_minutes": age.num_minutes()}),
            detection_tier: DetectionTier::BillingOnly,
        }])
    }

    async fn scheduled_scan(&self, pool: &PgPool, org_id: Uuid) -> Result<Vec<DetectedIssue>, AppError> {
        let now = Utc::now();
        let window_start = now - scan_window();
        let grace_cutoff = now - Duration::hours(24);

        let entitlements = revback_core::repo::Entitlement::list_for_org(pool, org_id).await?;
        let mut issues = Vec::new();

        for entitlement in &entitlements {
            if !entitlement.state.is_active_family() {
                continue;
            }
            let events = revback_core::repo::CanonicalEvent::list_since(
                pool,
                org_id,
                entitlement.user_id,
                &entitlement.product_id,
                window_start,
            )
            .await?;

            for event in events.iter().filter(|e| e.event_time < grace_cutoff) {
                let Some(severity) = severity_for(event.event_type) else {
                    continue;
                };
                issues.push(DetectedIssue {
                    issue_type: "unrevoked_refund",
                    severity,
                    title: "Refund or chargeback recorded without revoking access".to_string(),
                    description: format!(
                        "Product {} entitlement remains {:?} despite a {:?} event on {}.",
                        entitlement.product_id, entitlement.state, event.event_type, event.event_time
                    ),
                    user_id: Some(entitlement.user_id),
                    estimated_revenue_cents: event.amount_cents,
                    confidence: 0.85,
                    evidence: serde_json::json!({"event_id": event.id, "entitlement_id": entitlement.id}),
                    detection_tier: DetectionTier::BillingOnly,
                });
            }
        }

        Ok(issues)
    }
}

fn severity_for(event_type: EventType) -> Option<Severity> {
    match event_type {
        EventType::Chargeback => Some(Severity::Critical),
        EventType::Refund => Some(Severity::Warning),
        _ => None,
    }
}

fn format_age(age: Duration) -> String {
    format!("{}m", age.num_minutes())
}
