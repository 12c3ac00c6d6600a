use crate::Normalizer;
use axum::http::HeaderMap;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use revback_core::error::AppError;
use revback_core::models::{EventStatus, EventType, IdentityHint, IdentityType, NormalizedEvent, Source};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
struct StripeEventData {
    object: serde_json::Value,
}

pub struct StripeNormalizer;

impl Normalizer for StripeNormalizer {
    fn source(&self) -> Source {
        Source::Stripe
    }

    /// Stripe's `t=<ts>,v1=<hex hmac>` scheme: sign `<ts>.<body>` with
    /// HMAC-SHA256 over the connection's webhook secret.
    fn verify_signature(&self, headers: &HeaderMap, body: &[u8], secret: &str) -> bool {
        let Some(header) = headers.get("stripe-signature").and_then(|v| v.to_str().ok()) else {
            return false;
        };
        verify_stripe_signature(body, header, secret)
    }

    fn normalize(&self, body: &[u8]) -> Result<Vec<NormalizedEvent>, AppError> {
        let event: StripeEvent = serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("malformed stripe event: {e}")))?;

        let object = &event.data.object;
        let hints = identity_hints(object);
        if hints.is_empty() {
            tracing::warn!(event_id = %event.id, event_type = %event.event_type, "stripe event carries no identity hints, skipping");
            return Ok(vec![]);
        }

        let event_time = object
            .get("created")
            .and_then(|v| v.as_i64())
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(Utc::now);

        let product_id = object
            .get("metadata")
            .and_then(|m| m.get("product_id"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| {
                object
                    .get("plan")
                    .and_then(|p| p.get("product"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            });

        let amount_cents = object
            .get("amount_total")
            .or_else(|| object.get("amount_paid"))
            .or_else(|| object.get("amount"))
            .and_then(|v| v.as_i64());

        let currency = object.get("currency").and_then(|v| v.as_str()).map(str::to_string);

        let period_end = object
            .get("current_period_end")
            .or_else(|| object.get("lines").and_then(|l| l.get("data")).and_then(|d| d.get(0)).and_then(|l| l.get("period")).and_then(|p| p.get("end")))
            .and_then(|v| v.as_i64())
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single());

        let (event_type, status) = match event.event_type.as_str() {
            "checkout.session.completed" | "customer.subscription.created" => {
                (EventType::Purchase, EventStatus::Success)
            }
            "customer.subscription.updated" | "invoice.payment_succeeded" => {
                (EventType::Renewal, EventStatus::Success)
            }
            "invoice.payment_failed" => (EventType::BillingRetry, EventStatus::Failed),
            "customer.subscription.deleted" => (EventType::Cancellation, EventStatus::Success),
            "charge.refunded" => (EventType::Refund, EventStatus::Success),
            "charge.dispute.created" => (EventType::Chargeback, EventStatus::Success),
            other => {
                tracing::debug!(event_type = other, "unrecognized stripe event type, discarding");
                return Ok(vec![]);
            }
        };

        Ok(vec![NormalizedEvent {
            external_event_id: event.id,
            event_type,
            status,
            product_id,
            amount_cents,
            currency,
            event_time,
            period_end,
            identity_hints: hints,
        }])
    }
}

fn identity_hints(object: &serde_json::Value) -> Vec<IdentityHint> {
    let mut hints = Vec::new();

    if let Some(customer) = object.get("customer").and_then(|v| v.as_str()) {
        hints.push(IdentityHint {
            source: Source::Stripe,
            id_type: IdentityType::CustomerId,
            external_id: customer.to_string(),
        });
    }

    if let Some(subscription) = object.get("subscription").and_then(|v| v.as_str()) {
        hints.push(IdentityHint {
            source: Source::Stripe,
            id_type: IdentityType::SubscriptionId,
            external_id: subscription.to_string(),
        });
    }

    if let Some(email) = object.get("customer_email").and_then(|v| v.as_str()) {
        hints.push(IdentityHint {
            source: Source::Stripe,
            id_type: IdentityType::Email,
            external_id: email.to_string(),
        });
    }

    hints
}

fn verify_stripe_signature(body: &[u8], signature_header: &str, secret: &str) -> bool {
    let parts: HashMap<&str, &str> = signature_header
        .split(',')
        .filter_map(|part| {
            let mut split = part.splitn(2, '=');
            Some((split.next()?, split.next()?))
        })
        .collect();

    let (Some(timestamp), Some(expected_sig)) = (parts.get("t"), parts.get("v1")) else {
        return false;
    };

    let Ok(ts): Result<i64, _> = timestamp.parse() else {
        return false;
    };
    let now = Utc::now().timestamp();
    if (now - ts).abs() > SIGNATURE_TOLERANCE_SECS {
        return false;
    }

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    let computed = hex::encode(mac.finalize().into_bytes());

    constant_time_eq(computed.as_bytes(), expected_sig.as_bytes())
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

    fn sign(body: &str, secret: &str, ts: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(ts.to_string().as_bytes());
        mac.update(b".");
        mac.update(body.as_bytes());
        format!("t={ts},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn verifies_valid_signature() {
        let body = r#"{"id":"evt_1"}"#;
        let secret = "whsec_test";
        let header = sign(body, secret, Utc::now().timestamp());
        assert!(verify_stripe_signature(body.as_bytes(), &header, secret));
    }

    #[test]
    fn rejects_wrong_secret() {
        let body = r#"{"id":"evt_1"}"#;
        let header = sign(body, "whsec_right", Utc::now().timestamp());
        assert!(!verify_stripe_signature(body.as_bytes(), &header, "whsec_wrong"));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let body = r#"{"id":"evt_1"}"#;
        let secret = "whsec_test";
        let header = sign(body, secret, Utc::now().timestamp() - 10_000);
        assert!(!verify_stripe_signature(body.as_bytes(), &header, secret));
    }

    #[test]
    fn normalizes_checkout_completed() {
        let body = serde_json::json!({
            "id": "evt_123",
            "type": "checkout.session.completed",
            "data": {"object": {
                "customer": "cus_A",
                "amount_total": 1999,
                "currency": "usd",
                "created": Utc::now().timestamp(),
            }}
        });
        let events = StripeNormalizer.normalize(body.to_string().as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Purchase);
        assert_eq!(events[0].identity_hints.len(), 1);
    }

    #[test]
    fn normalizes_subscription_updated_with_period_end() {
        let period_end_ts = Utc::now().timestamp() + 2_592_000;
        let body = serde_json::json!({
            "id": "evt_124",
            "type": "customer.subscription.updated",
            "data": {"object": {
                "customer": "cus_A",
                "current_period_end": period_end_ts,
                "created": Utc::now().timestamp(),
            }}
        });
        let events = StripeNormalizer.normalize(body.to_string().as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].period_end, Utc.timestamp_opt(period_end_ts, 0).single());
    }

    #[test]
    fn discards_unrecognized_event_type() {
        let body = serde_json::json!({
            "id": "evt_999",
            "type": "something.unknown",
            "data": {"object": {"customer": "cus_A"}}
        });
        let events = StripeNormalizer.normalize(body.to_string().as_bytes()).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn skips_when_no_identity_hints() {
        let body = serde_json::json!({
            "id": "evt_000",
            "type": "checkout.session.completed",
            "data": {"object": {"amount_total": 500}}
        });
        let events = StripeNormalizer.normalize(body.to_string().as_bytes()).unwrap();
        assert!(events.is_empty());
    }
}
