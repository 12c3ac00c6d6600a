use super::{DetectedIssue, Detector, EventContext};
use async_trait::async_trait;
use revback_core::error::AppError;
use revback_core::models::{DetectionTier, Severity};
use revback_core::repo;
use sqlx::PgPool;
use uuid::Uuid;

/// For `(user, product)`, one source holds an active-family entitlement
/// while another holds an inactive one — a likely signal the user lost
/// access on one platform without it being reflected elsewhere.
pub struct CrossPlatformConflict;

#[async_trait]
impl Detector for CrossPlatformConflict {
    fn id(&self) -> &'static str {
        "cross_platform_conflict"
    }

    fn name(&self) -> &'static str {
        "Cross-platform conflict"
    }

    fn description(&self) -> &'static str {
        "One source shows an active entitlement while another shows inactive for the same product."
    }

    async fn check_event(
        &self,
        pool: &PgPool,
        org_id: Uuid,
        ctx: &EventContext<'_>,
    ) -> Result<Vec<DetectedIssue>, AppError> {
        let Some(product_id) = &ctx.event.product_id else {
            return Ok(vec![]);
        };

        let entitlements =
            repo::Entitlement::list_for_user_product(pool, org_id, ctx.event.user_id, product_id).await?;
        if entitlements.len() < 2 {
            return Ok(vec![]);
        }

        let has_active = entitlements.iter().any(|e| e.state.is_active_family());
        let has_inactive = entitlements.iter().any(|e| e.state.is_inactive_family());
        if !(has_active && has_inactive) {
            return Ok(vec![]);
        }

        Ok(vec![DetectedIssue {
            issue_type: self.id(),
            severity: Severity::Warning,
            title: "Entitlement disagrees across platforms".to_string(),
            description: format!(
                "Product {product_id} is active on at least one source and inactive on another."
            ),
            user_id: Some(ctx.event.user_id),
            estimated_revenue_cents: None,
            confidence: 0.85,
            evidence: serde_json::json!({
                "sources": entitlements.iter().map(|e| (e.source, e.state)).collect::<Vec<_>>(),
            }),
            detection_tier: DetectionTier::BillingOnly,
        }])
    }
}

/// For `(user, product)`, two or more distinct sources each hold an
/// active-family entitlement — the user is being billed twice for the same
/// access.
pub struct DuplicateBilling;

#[async_trait]
impl Detector for DuplicateBilling {
    fn id(&self) -> &'static str {
        "duplicate_billing"
    }

    fn name(&self) -> &'static str {
        "Duplicate billing"
    }

    fn description(&self) -> &'static str {
        "Two or more sources hold an active entitlement for the same product."
    }

    async fn check_event(
        &self,
        pool: &PgPool,
        org_id: Uuid,
        ctx: &EventContext<'_>,
    ) -> Result<Vec<DetectedIssue>, AppError> {
        let Some(product_id) = &ctx.event.product_id else {
            return Ok(vec![]);
        };

        let entitlements =
            repo::Entitlement::list_for_user_product(pool, org_id, ctx.event.user_id, product_id).await?;
        let active: Vec<_> = entitlements.iter().filter(|e| e.state.is_active_family()).collect();
        let distinct_sources: std::collections::HashSet<_> = active.iter().map(|e| e.source).collect();
        if distinct_sources.len() < 2 {
            return Ok(vec![]);
        }

        Ok(vec![DetectedIssue {
            issue_type: self.id(),
            severity: Severity::Critical,
            title: "User is billed on multiple platforms for the same product".to_string(),
            description: format!(
                "Product {product_id} has {} distinct active sources for this user.",
                distinct_sources.len()
            ),
            user_id: Some(ctx.event.user_id),
            estimated_revenue_cents: ctx.event.amount_cents,
            confidence: 0.90,
            evidence: serde_json::json!({
                "sources": active.iter().map(|e| e.source).collect::<Vec<_>>(),
            }),
            detection_tier: DetectionTier::BillingOnly,
        }])
    }
}
