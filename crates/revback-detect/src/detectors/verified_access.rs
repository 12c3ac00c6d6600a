use super::{DetectedIssue, Detector};
use async_trait::async_trait;
use revback_core::error::AppError;
use revback_core::models::{AccessCheck, DetectionTier, EntitlementState, Severity};
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

fn key(user_id: Uuid, product_id: &str) -> (Uuid, String) {
    (user_id, product_id.to_string())
}

/// Tier-2: an active-family entitlement whose most recent `AccessCheck`
/// reports the app denies access. Short-circuits when the org has no
/// access-check data at all.
pub struct VerifiedPaidNoAccess;

#[async_trait]
impl Detector for VerifiedPaidNoAccess {
    fn id(&self) -> &'static str {
        "verified_paid_no_access"
    }

    fn name(&self) -> &'static str {
        "Paid but no app access"
    }

    fn description(&self) -> &'static str {
        "An active entitlement exists but the app's own access check reports no access."
    }

    fn has_scheduled_scan(&self) -> bool {
        true
    }

    async fn scheduled_scan(&self, pool: &PgPool, org_id: Uuid) -> Result<Vec<DetectedIssue>, AppError> {
        if !repo::AccessCheck::org_has_any(pool, org_id).await? {
            return Ok(vec![]);
        }

        let entitlements = repo::Entitlement::list_by_states(pool, org_id, ACTIVE_FAMILY).await?;
        let checks = repo::AccessCheck::list_latest_per_user_product(pool, org_id).await?;
        let by_key: HashMap<(Uuid, String), &AccessCheck> =
            checks.iter().map(|c| (key(c.user_id, &c.product_id), c)).collect();

        let mut issues = Vec::new();
        for entitlement in &entitlements {
            let Some(check) = by_key.get(&key(entitlement.user_id, &entitlement.product_id)) else {
                continue;
            };
            if check.has_access {
                continue;
            }

            issues.push(DetectedIssue {
                issue_type: self.id(),
                severity: Severity::Critical,
                title: "Entitlement active but app reports no access".to_string(),
                description: format!(
                    "Product {} is {:?} but the latest access check reports no access.",
                    entitlement.product_id, entitlement.state
                ),
                user_id: Some(entitlement.user_id),
                estimated_revenue_cents: None,
                confidence: 0.9,
                evidence: serde_json::json!({
                    "entitlement_id": entitlement.id,
                    "access_check_id": check.id,
                    "reported_at": check.reported_at,
                }),
                detection_tier: DetectionTier::AppVerified,
            });
        }

        Ok(issues)
    }
}

/// Tier-2: the app reports access for a `(user, product)` with no
/// active-family entitlement backing it — access granted without payment.
pub struct VerifiedAccessNoPayment;

#[async_trait]
impl Detector for VerifiedAccessNoPayment {
    fn id(&self) -> &'static str {
        "verified_access_no_payment"
    }

    fn name(&self) -> &'static str {
        "App access without payment"
    }

    fn description(&self) -> &'static str {
        "The app reports access for a user with no active entitlement behind it."
    }

    fn has_scheduled_scan(&self) -> bool {
        true
    }

    async fn scheduled_scan(&self, pool: &PgPool, org_id: Uuid) -> Result<Vec<DetectedIssue>, AppError> {
        if !repo::AccessCheck::org_has_any(pool, org_id).await? {
            return Ok(vec![]);
        }

        let entitlements = repo::Entitlement::list_by_states(pool, org_id, ACTIVE_FAMILY).await?;
        let active_keys: std::collections::HashSet<(Uuid, String)> = entitlements
            .iter()
            .map(|e| key(e.user_id, &e.product_id))
            .collect();

        let checks = repo::AccessCheck::list_latest_per_user_product(pool, org_id).await?;

        let mut issues = Vec::new();
        for check in &checks {
            if !check.has_access {
                continue;
            }
            if active_keys.contains(&key(check.user_id, &check.product_id)) {
                continue;
            }

            issues.push(DetectedIssue {
                issue_type: self.id(),
                severity: Severity::Critical,
                title: "App access granted without a backing entitlement".to_string(),
                description: format!(
                    "The app reports access to product {} with no active entitlement on file.",
                    check.product_id
                ),
                user_id: Some(check.user_id),
                estimated_revenue_cents: None,
                confidence: 0.9,
                evidence: serde_json::json!({
                    "access_check_id": check.id,
                    "reported_at": check.reported_at,
                }),
                detection_tier: DetectionTier::AppVerified,
            });
        }

        Ok(issues)
    }
}
