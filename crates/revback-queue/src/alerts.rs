use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::job::{JobQueue, WEBHOOK_DELIVERY};
use hmac::{Hmac, Mac};
use revback_core::error::AppError;
use revback_core::models::{AlertChannel, AlertConfig, DeliveryOutcome, Issue};
use revback_core::repo;
use sha2::Sha256;
use sqlx::PgPool;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertEventType {
    IssueCreated,
    IssueResolved,
    IssueDismissed,
    IssueAcknowledged,
}

impl AlertEventType {
    fn wire_name(&self) -> &'static str {
        match self {
            AlertEventType::IssueCreated => "issue.created",
            AlertEventType::IssueResolved => "issue.resolved",
            AlertEventType::IssueDismissed => "issue.dismissed",
            AlertEventType::IssueAcknowledged => "issue.acknowledged",
        }
    }
}

const API_VERSION: &str = "2026-02-01";

/// Static metadata enriching an issue for outbound alerts, keyed by
/// detector id. Unknown detector ids fall back to a generic category.
fn detector_metadata(detector_id: &str) -> (&'static str, &'static str) {
    match detector_id {
        "payment_without_entitlement" => {
            ("revenue_leak", "Grant entitlement manually or investigate reducer lag.")
        }
        "entitlement_without_payment" => {
            ("access_risk", "Confirm billing retry outcome before revoking access.")
        }
        "unrevoked_refund" => ("revenue_leak", "Revoke entitlement for the refunded or disputed charge."),
        "silent_renewal_failure" => ("delivery_risk", "Check provider webhook delivery for this subscription."),
        "cross_platform_conflict" => ("data_integrity", "Reconcile entitlement state across platforms for this user."),
        "duplicate_billing" => ("revenue_leak", "Investigate duplicate charges across billing sources."),
        "webhook_delivery_gap" => ("delivery_risk", "Verify the provider's webhook endpoint configuration."),
        "trial_no_conversion" => ("lifecycle", "Review trial conversion flow for this user."),
        "stale_subscription" => ("data_integrity", "Confirm this entitlement still reflects an active subscription."),
        "data_freshness" => ("data_integrity", "Investigate webhook ingestion health for this source."),
        "verified_paid_no_access" => ("access_risk", "Restore app access or investigate entitlement sync."),
        "verified_access_no_payment" => ("revenue_leak", "Revoke app access pending a valid entitlement."),
        _ => ("uncategorized", "Investigate this issue manually."),
    }
}

#[derive(serde::Serialize)]
struct EnrichedIssue<'a> {
    id: Uuid,
    org_id: Uuid,
    user_id: Option<Uuid>,
    issue_type: &'a str,
    severity: String,
    title: &'a str,
    description: &'a str,
    estimated_revenue_cents: Option<i64>,
    confidence: f64,
    category: &'static str,
    recommended_action: &'static str,
    evidence: &'a serde_json::Value,
}

#[derive(serde::Serialize)]
struct AlertWebhookPayload<'a> {
    id: String,
    event_type: &'static str,
    api_version: &'static str,
    timestamp: String,
    data: AlertWebhookData<'a>,
}

#[derive(serde::Serialize)]
struct AlertWebhookData<'a> {
    issue: EnrichedIssue<'a>,
}

fn build_payload(issue: &Issue, event_type: AlertEventType) -> Result<String, AppError> {
    let (category, recommended_action) = detector_metadata(&issue.detector_id);
    let enriched = EnrichedIssue {
        id: issue.id,
        org_id: issue.org_id,
        user_id: issue.user_id,
        issue_type: &issue.issue_type,
        severity: format!("{:?}", issue.severity).to_lowercase(),
        title: &issue.title,
        description: &issue.description,
        estimated_revenue_cents: issue.estimated_revenue_cents,
        confidence: issue.confidence,
        category,
        recommended_action,
        evidence: &issue.evidence,
    };

    let payload = AlertWebhookPayload {
        id: format!("evt_{}", Uuid::new_v4()),
        event_type: event_type.wire_name(),
        api_version: API_VERSION,
        timestamp: chrono::Utc::now().to_rfc3339(),
        data: AlertWebhookData { issue: enriched },
    };

    serde_json::to_string(&payload).map_err(AppError::from)
}

fn sign_payload(secret: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[derive(serde::Serialize, serde::Deserialize)]
pub struct WebhookDeliveryJob {
    pub org_id: Uuid,
    pub issue_id: Uuid,
    pub target: String,
    pub secret: Option<String>,
    pub body: String,
}

/// Dispatch an issue to every active alert channel the org has configured.
/// Email and Slack deliveries are attempted inline and logged immediately;
/// webhook deliveries are handed to the durable queue for retried delivery
/// per §4.9. A dispatch failure never propagates to the detection path —
/// callers should treat this as fire-and-forget (§5).
pub async fn dispatch(
    pool: &PgPool,
    queue: &JobQueue,
    http: &reqwest::Client,
    breakers: &CircuitBreakerRegistry,
    issue: &Issue,
    event_type: AlertEventType,
) -> Result<(), AppError> {
    let configs = repo::AlertConfig::list_active_for_org(pool, issue.org_id).await?;
    let body = build_payload(issue, event_type)?;

    for config in configs {
        if let Err(err) = dispatch_one(pool, queue, http, breakers, issue, &config, &body).await {
            tracing::warn!(channel = ?config.channel, issue_id = %issue.id, error = %err, "alert dispatch failed");
        }
    }

    Ok(())
}

async fn dispatch_one(
    pool: &PgPool,
    queue: &JobQueue,
    http: &reqwest::Client,
    breakers: &CircuitBreakerRegistry,
    issue: &Issue,
    config: &AlertConfig,
    body: &str,
) -> Result<(), AppError> {
    match config.channel {
        AlertChannel::Webhook => {
            let job = WebhookDeliveryJob {
                org_id: issue.org_id,
                issue_id: issue.id,
                target: config.target.clone(),
                secret: config.secret.clone(),
                body: body.to_string(),
            };
            let job_id = format!("alert-{}-{}", issue.id, config.id);
            queue.enqueue(&WEBHOOK_DELIVERY, &job_id, &job).await?;
            Ok(())
        }
        AlertChannel::Slack | AlertChannel::Email => {
            let outcome = deliver_inline(http, breakers, config, body).await;
            let (outcome_kind, error_message) = match &outcome {
                Ok(()) => (DeliveryOutcome::Success, None),
                Err(err) => (DeliveryOutcome::Failed, Some(err.to_string())),
            };
            repo::AlertDeliveryLog::insert(pool, issue.org_id, issue.id, config.channel, 1, outcome_kind, error_message.as_deref())
                .await?;
            Ok(())
        }
    }
}

async fn deliver_inline(
    http: &reqwest::Client,
    breakers: &CircuitBreakerRegistry,
    config: &AlertConfig,
    body: &str,
) -> Result<(), AppError> {
    let breaker = breakers.get_or_create(&config.target);
    if !breaker.allow_request() {
        return Err(AppError::CircuitOpen { target: config.target.clone() });
    }

    let result = http
        .post(&config.target)
        .header("content-type", "application/json")
        .body(body.to_string())
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => {
            breaker.record_success();
            Ok(())
        }
        Ok(response) => {
            breaker.record_failure();
            Err(AppError::TransientIo(format!("alert endpoint responded {}", response.status())))
        }
        Err(err) => {
            breaker.record_failure();
            Err(AppError::TransientIo(err.to_string()))
        }
    }
}

/// Deliver one `webhook-delivery` job attempt, recording the outcome.
/// Called by the queue worker; retry/DLQ decisions live in `job.rs`. Wraps
/// the outbound call in this target's circuit breaker (§4.8) — an open
/// breaker fails the attempt without making a network call, so it still
/// feeds the queue's own retry/backoff decision.
pub async fn deliver_webhook_job(
    pool: &PgPool,
    http: &reqwest::Client,
    breakers: &CircuitBreakerRegistry,
    job: &WebhookDeliveryJob,
    attempt: u32,
) -> Result<(), AppError> {
    let breaker = breakers.get_or_create(&job.target);
    if !breaker.allow_request() {
        let outcome = DeliveryOutcome::Failed;
        let error_message = format!("circuit open for target '{}'", job.target);
        repo::AlertDeliveryLog::insert(pool, job.org_id, job.issue_id, AlertChannel::Webhook, attempt as i32, outcome, Some(&error_message))
            .await?;
        return Err(AppError::CircuitOpen { target: job.target.clone() });
    }

    let signature = job.secret.as_deref().map(|secret| sign_payload(secret, &job.body));

    let mut request = http.post(&job.target).header("content-type", "application/json");
    if let Some(sig) = &signature {
        request = request.header("X-RevBack-Signature", sig.clone());
    }

    let result = request.body(job.body.clone()).send().await;

    let (outcome, error_message) = match &result {
        Ok(response) if response.status().is_success() => {
            breaker.record_success();
            (DeliveryOutcome::Success, None)
        }
        Ok(response) => {
            breaker.record_failure();
            (DeliveryOutcome::Failed, Some(format!("responded {}", response.status())))
        }
        Err(err) => {
            breaker.record_failure();
            (DeliveryOutcome::Failed, Some(err.to_string()))
        }
    };

    repo::AlertDeliveryLog::insert(pool, job.org_id, job.issue_id, AlertChannel::Webhook, attempt as i32, outcome, error_message.as_deref())
        .await?;

    if outcome == DeliveryOutcome::Failed {
        return Err(AppError::TransientIo(error_message.unwrap_or_default()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signs_payload_with_hmac() {
        let signature = sign_payload("secret", "body");
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn detector_metadata_covers_all_eleven_detectors() {
        let ids = [
            "payment_without_entitlement",
            "entitlement_without_payment",
            "unrevoked_refund",
            "silent_renewal_failure",
            "cross_platform_conflict",
            "duplicate_billing",
            "webhook_delivery_gap",
            "trial_no_conversion",
            "stale_subscription",
            "data_freshness",
            "verified_paid_no_access",
            "verified_access_no_payment",
        ];
        for id in ids {
            let (category, _) = detector_metadata(id);
            assert_ne!(category, "uncategorized");
        }
    }

    #[test]
    fn unknown_detector_falls_back_to_uncategorized() {
        let (category, _) = detector_metadata("not_a_real_detector");
        assert_eq!(category, "uncategorized");
    }
}
