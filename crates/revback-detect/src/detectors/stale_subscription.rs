use super::{DetectedIssue, Detector};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use revback_core::error::AppError;
use revback_core::models::{DetectionTier, EntitlementState, Severity};
use revback_core::repo;
use sqlx::PgPool;
use uuid::Uuid;

const ACTIVE_FAMILY: &[EntitlementState] = &[
    EntitlementState::Active,
    EntitlementState::Trial,
    EntitlementState::GracePeriod,
    EntitlementState::BillingRetry,
];

/// An active-family entitlement whose most recent event is over 35 days old
/// and whose period ended at least two days ago — stuck state that neither
/// renewed nor was cleaned up.
pub struct StaleSubscription;

#[async_trait]
impl Detector for StaleSubscription {
    fn id(&self) -> &'static str {
        "stale_subscription"
    }

    fn name(&self) -> &'static str {
        "Stale subscription"
    }

    fn description(&self) -> &'static str {
        "An entitlement has seen no activity in over a month past its period end."
    }

    fn has_scheduled_scan(&self) -> bool {
        true
    }

    async fn scheduled_scan(&self, pool: &PgPool, org_id: Uuid) -> Result<Vec<DetectedIssue>, AppError> {
        let entitlements = repo::Entitlement::list_by_states(pool, org_id, ACTIVE_FAMILY).await?;
        let now = Utc::now();

        let mut issues = Vec::new();
        for entitlement in &entitlements {
            let Some(period_end) = entitlement.current_period_end else {
                continue;
            };
            if now - period_end < Duration::days(2) {
                continue;
            }

            let events = repo::CanonicalEvent::list_since(
                pool,
                org_id,
                entitlement.user_id,
                &entitlement.product_id,
                chrono::DateTime::<Utc>::MIN_UTC,
            )
            .await?;
            let most_recent = events.iter().map(|e| e.event_time).max();
            let Some(most_recent) = most_recent else {
                continue;
            };
            if now - most_recent < Duration::days(35) {
                continue;
            }

            let days_past_period_end = (now - period_end).num_hours() as f64 / 24.0;
            let severity = if days_past_period_end >= 60.0 {
                Severity::Critical
            } else {
                Severity::Warning
            };

            issues.push(DetectedIssue {
                issue_type: self.id(),
                severity,
                title: "Subscription has gone stale".to_string(),
                description: format!(
                    "Product {} has seen no events in over 35 days and its period ended {days_past_period_end:.0} days ago.",
                    entitlement.product_id
                ),
                user_id: Some(entitlement.user_id),
                estimated_revenue_cents: None,
                confidence: 0.8,
                evidence: serde_json::json!({
                    "entitlement_id": entitlement.id,
                    "days_past_period_end": days_past_period_end,
                    "last_event_at": most_recent,
                }),
                detection_tier: DetectionTier::BillingOnly,
            });
        }

        Ok(issues)
    }
}
