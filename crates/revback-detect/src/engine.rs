use crate::detectors::{DetectedIssue, DetectorRegistry, EventContext};
use revback_core::models::{CanonicalEvent, Entitlement, Issue};
use sqlx::PgPool;
use tracing::Instrument;
use uuid::Uuid;

/// Run every event-triggered detector against one canonical event. A
/// detector that errors is logged and skipped — it never blocks its
/// siblings or the ingestion path per §4.5.
pub async fn check_for_issues(
    pool: &PgPool,
    registry: &DetectorRegistry,
    org_id: Uuid,
    event: &CanonicalEvent,
    prior: Option<&Entitlement>,
    current: Option<&Entitlement>,
) -> Vec<Issue> {
    let ctx = EventContext { event, prior, current };
    let mut created = Vec::new();

    for detector in registry.all() {
        let span = tracing::info_span!("check_event", detector_id = detector.id(), event_id = %event.id);
        let result = detector.check_event(pool, org_id, &ctx).instrument(span).await;

        match result {
            Ok(detected) => {
                for issue in detected {
                    if let Some(row) = create_deduped(pool, org_id, issue).await {
                        created.push(row);
                    }
                }
            }
            Err(err) => {
                tracing::warn!(detector_id = detector.id(), error = %err, "event detector failed, skipping");
            }
        }
    }

    created
}

/// Per-detector totals for a scheduled run, plus the issues actually
/// created so the caller can fan them out to C9 alert dispatch.
pub struct ScanReport {
    pub detector_id: &'static str,
    pub total: usize,
    pub new: usize,
    pub created: Vec<Issue>,
}

/// Run every detector with a scheduled scan against one org's aggregate
/// state. Each detector's failure is isolated from the others.
pub async fn run_scheduled_scans(pool: &PgPool, registry: &DetectorRegistry, org_id: Uuid) -> Vec<ScanReport> {
    let mut reports = Vec::new();
    for detector in registry.with_scheduled_scan() {
        reports.push(run_single_detector_scan(pool, detector.as_ref(), org_id).await);
    }
    reports
}

pub async fn run_single_detector_scan(
    pool: &PgPool,
    detector: &(dyn crate::detectors::Detector),
    org_id: Uuid,
) -> ScanReport {
    let span = tracing::info_span!("scheduled_scan", detector_id = detector.id(), org_id = %org_id);
    let result = detector.scheduled_scan(pool, org_id).instrument(span).await;

    match result {
        Ok(detected) => {
            let total = detected.len();
            let mut created = Vec::new();
            for issue in detected {
                if let Some(row) = create_deduped(pool, org_id, issue).await {
                    created.push(row);
                }
            }
            let new = created.len();
            ScanReport { detector_id: detector.id(), total, new, created }
        }
        Err(err) => {
            tracing::warn!(detector_id = detector.id(), error = %err, "scheduled scan failed");
            ScanReport { detector_id: detector.id(), total: 0, new: 0, created: Vec::new() }
        }
    }
}

/// Dedup + create for one detected issue. Returns `None` on a deliberate
/// no-op: an existing open issue for the same key, or a unique-constraint
/// race resolved the same way (§4.5 steps 1-2).
async fn create_deduped(pool: &PgPool, org_id: Uuid, detected: DetectedIssue) -> Option<Issue> {
    if let Some(user_id) = detected.user_id {
        match Issue::find_open(pool, org_id, Some(user_id), detected.issue_type).await {
            Ok(Some(_)) => return None,
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(issue_type = detected.issue_type, error = %err, "dedup check failed, skipping issue");
                return None;
            }
        }
    }

    let result = Issue::create(
        pool,
        org_id,
        detected.user_id,
        detected.issue_type,
        detected.severity,
        &detected.title,
        &detected.description,
        detected.estimated_revenue_cents,
        detected.confidence,
        detected.issue_type,
        detected.detection_tier,
        detected.evidence,
    )
    .await;

    match result {
        Ok(issue) => issue,
        Err(err) => {
            tracing::warn!(issue_type = detected.issue_type, error = %err, "issue creation failed");
            None
        }
    }
}

