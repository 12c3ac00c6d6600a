use super::{DetectedIssue, Detector};
use async_trait::async_trait;
use chrono::Utc;
use revback_core::error::AppError;
use revback_core::models::{DetectionTier, Severity, Source};
use revback_core::repo;
use sqlx::PgPool;
use uuid::Uuid;

/// (warn, critical) hours since last webhook, per provider.
fn thresholds(source: Source) -> (f64, f64) {
    match source {
        Source::Stripe => (4.0, 12.0),
        Source::Apple => (12.0, 48.0),
        Source::Google => (8.0, 24.0),
        Source::Recurly => (6.0, 24.0),
    }
}

/// Per active connection, flags a gap between `now` and `lastWebhookAt`
/// exceeding the provider's warn/critical threshold. A connection that has
/// never received a webhook and is over 24h old is always critical.
pub struct WebhookDeliveryGap;

#[async_trait]
impl Detector for WebhookDeliveryGap {
    fn id(&self) -> &'static str {
        "webhook_delivery_gap"
    }

    fn name(&self) -> &'static str {
        "Webhook delivery gap"
    }

    fn description(&self) -> &'static str {
        "An active billing connection has gone too long without receiving a webhook."
    }

    fn has_scheduled_scan(&self) -> bool {
        true
    }

    async fn scheduled_scan(&self, pool: &PgPool, org_id: Uuid) -> Result<Vec<DetectedIssue>, AppError> {
        let connections = repo::BillingConnection::list_active(pool, org_id).await?;
        let now = Utc::now();

        let mut issues = Vec::new();
        for conn in &connections {
            let (warn_hours, critical_hours) = thresholds(conn.source);

            let (hours_since, never_delivered) = match conn.last_webhook_at {
                Some(last) => ((now - last).num_minutes() as f64 / 60.0, false),
                None => ((now - conn.created_at).num_minutes() as f64 / 60.0, true),
            };

            if never_delivered && hours_since > 24.0 {
                issues.push(issue_for(conn.id, conn.source, hours_since, Severity::Critical, 0.90, true));
                continue;
            }

            if hours_since >= critical_hours {
                issues.push(issue_for(conn.id, conn.source, hours_since, Severity::Critical, 0.90, false));
            } else if hours_since >= warn_hours {
                issues.push(issue_for(conn.id, conn.source, hours_since, Severity::Warning, 0.7, false));
            }
        }

        Ok(issues)
    }
}

fn issue_for(
    connection_id: Uuid,
    source: Source,
    hours_since: f64,
    severity: Severity,
    confidence: f64,
    never_delivered: bool,
) -> DetectedIssue {
    let title = if never_delivered {
        "Connection has never received a webhook".to_string()
    } else {
        "Webhook delivery gap".to_string()
    };

    DetectedIssue {
        issue_type: "webhook_delivery_gap",
        severity,
        title,
        description: format!("{source} connection has gone {hours_since:.1}h without an inbound webhook."),
        user_id: None,
        estimated_revenue_cents: None,
        confidence,
        evidence: serde_json::json!({
            "connection_id": connection_id,
            "source": source,
            "hours_since_last_webhook": hours_since,
        }),
        detection_tier: DetectionTier::BillingOnly,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripe_thresholds_match_spec() {
        assert_eq!(thresholds(Source::Stripe), (4.0, 12.0));
    }

    #[test]
    fn apple_thresholds_match_spec() {
        assert_eq!(thresholds(Source::Apple), (12.0, 48.0));
    }
}
