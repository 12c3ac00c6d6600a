use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use revback_core::error::AppError;
use revback_core::models::Source;
use revback_queue::job::WEBHOOK_PROCESSING;
use revback_queue::rate_limiter::RateLimitTier;
use std::str::FromStr;

/// Maps an `AppError` to the HTTP response the route layer returns. Kept
/// local to the server crate since `revback-core` stays axum-agnostic.
fn error_response(err: &AppError) -> Response {
    let status = match err {
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::Auth(_) | AppError::SignatureVerification => StatusCode::UNAUTHORIZED,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::Conflict(_) => StatusCode::CONFLICT,
        AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        AppError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AppError::TransientIo(_) => StatusCode::BAD_GATEWAY,
        AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

#[derive(serde::Serialize, serde::Deserialize)]
pub struct WebhookProcessingJob {
    pub log_id: uuid::Uuid,
}

/// `POST /webhooks/{orgSlug}/{source}` — §4.6 steps 1-7.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path((org_slug, source)): Path<(String, String)>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    match handle(state, &org_slug, &source, headers, &body).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(org_slug, source, error = %err, "webhook ingress failed");
            error_response(&err)
        }
    }
}

async fn handle(
    state: AppState,
    org_slug: &str,
    source_raw: &str,
    headers: HeaderMap,
    body: &[u8],
) -> Result<Response, AppError> {
    let decision = state.rate_limiter.check(RateLimitTier::Webhook, org_slug).await;
    if !decision.allowed {
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", decision.retry_after_secs.to_string())],
            "rate limited",
        )
            .into_response());
    }

    let source = Source::from_str(source_raw)
        .map_err(|_| AppError::NotFound(format!("unknown provider '{source_raw}'")))?;

    let Some((org, connection)) =
        revback_core::repo::BillingConnection::find_by_org_slug_and_source(&state.db, org_slug, source).await?
    else {
        return Err(AppError::NotFound(format!("no {source} connection for org '{org_slug}'")));
    };

    let (secret, _) = revback_core::crypto::decrypt(
        &connection.encrypted_credentials,
        &state.config.credential_encryption_key,
        state.config.credential_encryption_key_previous.as_ref(),
    )?;

    let normalizer = state.normalizers.get(source);
    if !normalizer.verify_signature(&headers, body, &secret) {
        return Err(AppError::SignatureVerification);
    }

    let headers_json = headers_to_json(&headers);
    let log_id =
        revback_core::repo::RawWebhookLog::insert(&state.db, org.id, source, headers_json, body).await?;

    let job_id = format!("webhook-{log_id}");
    state
        .queue
        .enqueue(&WEBHOOK_PROCESSING, &job_id, &WebhookProcessingJob { log_id })
        .await?;

    revback_core::repo::BillingConnection::touch_last_webhook_at(&state.db, connection.id).await?;

    Ok((
        StatusCode::OK,
        [("X-RateLimit-Remaining", decision.remaining.to_string())],
        "ok",
    )
        .into_response())
}

fn headers_to_json(headers: &HeaderMap) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
            )
        })
        .collect();
    serde_json::Value::Object(map)
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn headers_to_json_preserves_values() {
        let mut headers = HeaderMap::new();
        headers.insert("stripe-signature", HeaderValue::from_static("t=1,v1=abc"));
        let json = headers_to_json(&headers);
        assert_eq!(json["stripe-signature"], "t=1,v1=abc");
    }

    #[test]
    fn unknown_provider_maps_to_not_found_status() {
        let err = AppError::NotFound("unknown provider 'paypal'".to_string());
        let response = error_response(&err);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn signature_failure_maps_to_unauthorized() {
        let response = error_response(&AppError::SignatureVerification);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn rate_limited_maps_to_429() {
        let response = error_response(&AppError::RateLimited { retry_after_secs: 5 });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
