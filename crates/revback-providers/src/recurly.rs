use crate::Normalizer;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use revback_core::error::AppError;
use revback_core::models::{EventStatus, EventType, IdentityHint, IdentityType, NormalizedEvent, Source};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct RecurlyEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    created_at: DateTime<Utc>,
    data: RecurlyEventData,
}

#[derive(Debug, Deserialize)]
struct RecurlyEventData {
    account: Option<RecurlyAccount>,
    subscription: Option<RecurlySubscription>,
    invoice: Option<RecurlyInvoice>,
}

#[derive(Debug, Deserialize)]
struct RecurlyAccount {
    code: String,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecurlySubscription {
    uuid: String,
    plan_code: Option<String>,
    current_period_ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RecurlyInvoice {
    total_in_cents: Option<i64>,
    currency: Option<String>,
}

pub struct RecurlyNormalizer;

impl Normalizer for RecurlyNormalizer {
    fn source(&self) -> Source {
        Source::Recurly
    }

    /// Recurly signs the raw body with HMAC-SHA256 under `X-Recurly-Signature`,
    /// no timestamp component — a straight hex digest comparison.
    fn verify_signature(&self, headers: &HeaderMap, body: &[u8], secret: &str) -> bool {
        let Some(header) = headers.get("x-recurly-signature").and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(body);
        let computed = hex::encode(mac.finalize().into_bytes());
        constant_time_eq(computed.as_bytes(), header.as_bytes())
    }

    fn normalize(&self, body: &[u8]) -> Result<Vec<NormalizedEvent>, AppError> {
        let event: RecurlyEvent = serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("malformed recurly event: {e}")))?;

        let Some(account) = &event.data.account else {
            tracing::debug!(event_type = %event.event_type, "recurly event has no account, discarding");
            return Ok(vec![]);
        };

        let (event_type, status) = match event.event_type.as_str() {
            "new_subscription_notification" => (EventType::Purchase, EventStatus::Success),
            "renewed_subscription_notification" => (EventType::Renewal, EventStatus::Success),
            "canceled_subscription_notification" => (EventType::Cancellation, EventStatus::Success),
            "expired_subscription_notification" => (EventType::Expiration, EventStatus::Success),
            "failed_payment_notification" => (EventType::BillingRetry, EventStatus::Failed),
            "successful_refund_notification" => (EventType::Refund, EventStatus::Success),
            "chargeback_notification" => (EventType::Chargeback, EventStatus::Success),
            other => {
                tracing::debug!(event_type = other, "unrecognized recurly event type, discarding");
                return Ok(vec![]);
            }
        };

        let mut hints = vec![IdentityHint {
            source: Source::Recurly,
            id_type: IdentityType::CustomerId,
            external_id: account.code.clone(),
        }];
        if let Some(email) = &account.email {
            hints.push(IdentityHint {
                source: Source::Recurly,
                id_type: IdentityType::Email,
                external_id: email.clone(),
            });
        }
        if let Some(sub) = &event.data.subscription {
            hints.push(IdentityHint {
                source: Source::Recurly,
                id_type: IdentityType::SubscriptionId,
                external_id: sub.uuid.clone(),
            });
        }

        Ok(vec![NormalizedEvent {
            external_event_id: event.id,
            event_type,
            status,
            product_id: event.data.subscription.as_ref().and_then(|s| s.plan_code.clone()),
            amount_cents: event.data.invoice.as_ref().and_then(|i| i.total_in_cents),
            currency: event.data.invoice.as_ref().and_then(|i| i.currency.clone()),
            event_time: event.created_at,
            period_end: event.data.subscription.as_ref().and_then(|s| s.current_period_ends_at),
            identity_hints: hints,
        }])
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(event_type: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "evt-recurly-1",
            "type": event_type,
            "created_at": Utc::now().to_rfc3339(),
            "data": {
                "account": {"code": "acct_1", "email": "u@example.com"},
                "subscription": {
                    "uuid": "sub-uuid-1",
                    "plan_code": "pro_monthly",
                    "current_period_ends_at": (Utc::now() + chrono::Duration::days(30)).to_rfc3339(),
                },
                "invoice": {"total_in_cents": 2999, "currency": "USD"},
            }
        })
    }

    #[test]
    fn normalizes_new_subscription() {
        let body = sample_event("new_subscription_notification");
        let events = RecurlyNormalizer.normalize(body.to_string().as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Purchase);
        assert_eq!(events[0].identity_hints.len(), 3);
        assert!(events[0].period_end.is_some());
    }

    #[test]
    fn discards_unrecognized_type() {
        let body = sample_event("something_else_notification");
        let events = RecurlyNormalizer.normalize(body.to_string().as_bytes()).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn verifies_hmac_signature() {
        let body = br#"{"id":"evt-1"}"#;
        let secret = "recurly_secret";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());

        let mut headers = HeaderMap::new();
        headers.insert("x-recurly-signature", sig.parse().unwrap());
        assert!(RecurlyNormalizer.verify_signature(&headers, body, secret));
    }
}
