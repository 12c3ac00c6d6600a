use super::{DetectedIssue, Detector};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use revback_core::error::AppError;
use revback_core::models::{DetectionTier, EntitlementState, Severity};
use revback_core::repo;
use sqlx::PgPool;
use uuid::Uuid;

/// `trial` entitlements whose `trialEnd` passed at least two hours ago with
/// no recorded conversion.
pub struct TrialNoConversion;

#[async_trait]
impl Detector for TrialNoConversion {
    fn id(&self) -> &'static str {
        "trial_no_conversion"
    }

    fn name(&self) -> &'static str {
        "Trial without conversion"
    }

    fn description(&self) -> &'static str {
        "A trial's end date has passed with the entitlement still in trial state."
    }

    fn has_scheduled_scan(&self) -> bool {
        true
    }

    async fn scheduled_scan(&self, pool: &PgPool, org_id: Uuid) -> Result<Vec<DetectedIssue>, AppError> {
        let trials = repo::Entitlement::list_by_states(pool, org_id, &[EntitlementState::Trial]).await?;
        let now = Utc::now();

        let mut issues = Vec::new();
        for entitlement in &trials {
            let Some(trial_end) = entitlement.trial_end else {
                continue;
            };
            if now - trial_end < Duration::hours(2) {
                continue;
            }

            let hours_past = (now - trial_end).num_minutes() as f64 / 60.0;
            issues.push(DetectedIssue {
                issue_type: self.id(),
                severity: Severity::Warning,
                title: "Trial ended without converting".to_string(),
                description: format!(
                    "Product {} trial ended {hours_past:.1}h ago with no conversion event.",
                    entitlement.product_id
                ),
                user_id: Some(entitlement.user_id),
                estimated_revenue_cents: None,
                confidence: 0.75,
                evidence: serde_json::json!({
                    "entitlement_id": entitlement.id,
                    "hours_since_trial_end": hours_past,
                }),
                detection_tier: DetectionTier::BillingOnly,
            });
        }

        Ok(issues)
    }
}
