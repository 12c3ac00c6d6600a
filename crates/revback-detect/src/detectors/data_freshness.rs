use super::{DetectedIssue, Detector};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use revback_core::error::AppError;
use revback_core::models::{DetectionTier, EntitlementState, Severity, Source};
use revback_core::repo;
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

const ACTIVE_FAMILY: &[EntitlementState] = &[
    EntitlementState::Active,
    EntitlementState::Trial,
    EntitlementState::GracePeriod,
    EntitlementState::BillingRetry,
];

/// Per source, at least 10 active entitlements with 10%+ stale (`updatedAt`
/// older than 35 days) is a data-freshness concern; 25%+ is critical. Catches
/// a provider integration that silently stopped delivering updates.
pub struct DataFreshness;

#[async_trait]
impl Detector for DataFreshness {
    fn id(&self) -> &'static str {
        "data_freshness"
    }

    fn name(&self) -> &'static str {
        "Data freshness"
    }

    fn description(&self) -> &'static str {
        "A meaningful share of a source's active entitlements have not been updated recently."
    }

    fn has_scheduled_scan(&self) -> bool {
        true
    }

    async fn scheduled_scan(&self, pool: &PgPool, org_id: Uuid) -> Result<Vec<DetectedIssue>, AppError> {
        let entitlements = repo::Entitlement::list_by_states(pool, org_id, ACTIVE_FAMILY).await?;
        let now = Utc::now();
        let stale_cutoff = now - Duration::days(35);

        let mut totals: HashMap<Source, (usize, usize)> = HashMap::new();
        for entitlement in &entitlements {
            let entry = totals.entry(entitlement.source).or_insert((0, 0));
            entry.0 += 1;
            if entitlement.updated_at < stale_cutoff {
                entry.1 += 1;
            }
        }

        let mut issues = Vec::new();
        for (source, (total, stale)) in totals {
            if total < 10 {
                continue;
            }
            let ratio = stale as f64 / total as f64;
            if ratio < 0.10 {
                continue;
            }

            let severity = if ratio >= 0.25 { Severity::Critical } else { Severity::Warning };
            issues.push(DetectedIssue {
                issue_type: self.id(),
                severity,
                title: format!("{source} data is going stale"),
                description: format!(
                    "{stale} of {total} active {source} entitlements ({:.0}%) have not updated in 35+ days.",
                    ratio * 100.0
                ),
                user_id: None,
                estimated_revenue_cents: None,
                confidence: 0.8,
                evidence: serde_json::json!({"source": source, "total": total, "stale": stale, "ratio": ratio}),
                detection_tier: DetectionTier::BillingOnly,
            });
        }

        Ok(issues)
    }
}
