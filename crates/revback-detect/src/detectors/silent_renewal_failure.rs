use super::{DetectedIssue, Detector};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use revback_core::error::AppError;
use revback_core::models::{DetectionTier, EntitlementState, EventType, Severity};
use revback_core::repo;
use sqlx::PgPool;
use uuid::Uuid;

/// `active` entitlements whose period ended 1-24h ago with no renewal,
/// expiration, cancellation, or billing-retry event recorded since. Scheduled
/// only — there's no single inbound event that signals "nothing happened".
pub struct SilentRenewalFailure;

#[async_trait]
impl Detector for SilentRenewalFailure {
    fn id(&self) -> &'static str {
        "silent_renewal_failure"
    }

    fn name(&self) -> &'static str {
        "Silent renewal failure"
    }

    fn description(&self) -> &'static str {
        "An active entitlement's period ended with no renewal or cancellation event following it."
    }

    fn has_scheduled_scan(&self) -> bool {
        true
    }

    async fn scheduled_scan(&self, pool: &PgPool, org_id: Uuid) -> Result<Vec<DetectedIssue>, AppError> {
        let now = Utc::now();
        let active = repo::Entitlement::list_by_states(pool, org_id, &[EntitlementState::Active]).await?;

        let mut issues = Vec::new();
        for entitlement in &active {
            let Some(period_end) = entitlement.current_period_end else {
                continue;
            };
            let age = now - period_end;
            if age < Duration::hours(1) || age >= Duration::hours(24) {
                continue;
            }

            let events_after =
                repo::CanonicalEvent::list_since(pool, org_id, entitlement.user_id, &entitlement.product_id, period_end)
                    .await?;
            let has_followup = events_after.iter().any(|e| {
                matches!(
                    e.event_type,
                    EventType::Renewal | EventType::Expiration | EventType::Cancellation | EventType::BillingRetry
                )
            });
            if has_followup {
                continue;
            }

            let hours = age.num_minutes() as f64 / 60.0;
            let severity = if hours >= 6.0 { Severity::Critical } else { Severity::Warning };
            let confidence = (0.5 + 0.05 * hours).clamp(0.0, 0.95);

            issues.push(DetectedIssue {
                issue_type: self.id(),
                severity,
                title: "Entitlement period ended with no renewal activity".to_string(),
                description: format!(
                    "Product {} period ended {hours:.1}h ago with no renewal, expiration, cancellation, or retry since.",
                    entitlement.product_id
                ),
                user_id: Some(entitlement.user_id),
                estimated_revenue_cents: None,
                confidence,
                evidence: serde_json::json!({
                    "entitlement_id": entitlement.id,
                    "hours_since_period_end": hours,
                }),
                detection_tier: DetectionTier::BillingOnly,
            });
        }

        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn confidence_clamps_at_upper_bound() {
        let hours = 20.0_f64;
        let confidence: f64 = (0.5 + 0.05 * hours).clamp(0.0, 0.95);
        assert_eq!(confidence, 0.95);
    }

    #[test]
    fn confidence_matches_three_hour_example() {
        let hours = 3.0_f64;
        let confidence: f64 = (0.5 + 0.05 * hours).clamp(0.0, 0.95);
        assert!((confidence - 0.65).abs() < 1e-9);
    }
}
