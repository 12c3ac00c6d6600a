mod cross_platform;
mod data_freshness;
mod entitlement_without_payment;
mod payment_without_entitlement;
mod silent_renewal_failure;
mod stale_subscription;
mod trial_no_conversion;
mod unrevoked_refund;
mod verified_access;
mod webhook_delivery_gap;

use async_trait::async_trait;
use revback_core::error::AppError;
use revback_core::models::{CanonicalEvent, DetectionTier, Entitlement, Severity};
use sqlx::PgPool;
use uuid::Uuid;

/// An issue as produced by a detector, before it is deduplicated and
/// persisted by the detection engine (C5).
#[derive(Debug, Clone)]
pub struct DetectedIssue {
    pub issue_type: &'static str,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub user_id: Option<Uuid>,
    pub estimated_revenue_cents: Option<i64>,
    pub confidence: f64,
    pub evidence: serde_json::Value,
    pub detection_tier: DetectionTier,
}

/// Everything an event-triggered detector needs about the entitlement this
/// event just touched. `prior` is the row as it stood before the reducer ran
/// (`None` if this is the first event for the key); `current` is the row
/// after — which may be unchanged from `prior` if monotonicity (P3)
/// suppressed the update.
pub struct EventContext<'a> {
    pub event: &'a CanonicalEvent,
    pub prior: Option<&'a Entitlement>,
    pub current: Option<&'a Entitlement>,
}

/// A detector is a capability record, not a class hierarchy: both hooks are
/// optional, defaulting to "detects nothing". No inheritance, per §9.
#[async_trait]
pub trait Detector: Send + Sync {
    fn id(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;

    async fn check_event(
        &self,
        _pool: &PgPool,
        _org_id: Uuid,
        _ctx: &EventContext<'_>,
    ) -> Result<Vec<DetectedIssue>, AppError> {
        Ok(vec![])
    }

    async fn scheduled_scan(&self, _pool: &PgPool, _org_id: Uuid) -> Result<Vec<DetectedIssue>, AppError> {
        Ok(vec![])
    }

    fn has_scheduled_scan(&self) -> bool {
        false
    }
}

/// Process-wide registry of every required detector, built once at startup.
pub struct DetectorRegistry {
    detectors: Vec<Box<dyn Detector>>,
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            detectors: vec![
                Box::new(payment_without_entitlement::PaymentWithoutEntitlement),
                Box::new(entitlement_without_payment::EntitlementWithoutPayment),
                Box::new(unrevoked_refund::UnrevokedRefund),
                Box::new(silent_renewal_failure::SilentRenewalFailure),
                Box::new(cross_platform::CrossPlatformConflict),
                Box::new(cross_platform::DuplicateBilling),
                Box::new(webhook_delivery_gap::WebhookDeliveryGap),
                Box::new(trial_no_conversion::TrialNoConversion),
                Box::new(stale_subscription::StaleSubscription),
                Box::new(data_freshness::DataFreshness),
                Box::new(verified_access::VerifiedPaidNoAccess),
                Box::new(verified_access::VerifiedAccessNoPayment),
            ],
        }
    }

    pub fn all(&self) -> &[Box<dyn Detector>] {
        &self.detectors
    }

    pub fn with_scheduled_scan(&self) -> impl Iterator<Item = &Box<dyn Detector>> {
        self.detectors.iter().filter(|d| d.has_scheduled_scan())
    }

    pub fn by_id(&self, id: &str) -> Option<&Box<dyn Detector>> {
        self.detectors.iter().find(|d| d.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_no_duplicate_ids() {
        let registry = DetectorRegistry::new();
        let mut ids: Vec<&str> = registry.all().iter().map(|d| d.id()).collect();
        ids.sort_unstable();
        let mut deduped = ids.clone();
        deduped.dedup();
        assert_eq!(ids.len(), deduped.len(), "detector ids must be unique: {ids:?}");
    }

    #[test]
    fn by_id_finds_registered_detector() {
        let registry = DetectorRegistry::new();
        assert!(registry.by_id("duplicate_billing").is_some());
        assert!(registry.by_id("does_not_exist").is_none());
    }
}
