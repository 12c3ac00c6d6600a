use crate::state::AppState;
use revback_core::error::AppError;
use revback_core::models::{CanonicalEvent, Entitlement, ProcessingStatus, RawWebhookLog};
use revback_detect::{engine, reducer, resolver};
use revback_queue::alerts::{self, AlertEventType};

/// Worker-side processing for one `webhook-processing` job — §4.6
/// "Worker-side job processing" steps 1-5.
pub async fn process_webhook_job(state: &AppState, log_id: uuid::Uuid) -> Result<(), AppError> {
    revback_core::repo::RawWebhookLog::mark_status(&state.db, log_id, ProcessingStatus::Processing, None).await?;

    let result = run(state, log_id).await;

    match &result {
        Ok(skipped) => {
            tracing::info!(log_id = %log_id, skipped, "webhook job succeeded");
            revback_core::repo::RawWebhookLog::mark_status(&state.db, log_id, ProcessingStatus::Succeeded, None)
                .await?;
        }
        Err(err) => {
            revback_core::repo::RawWebhookLog::mark_status(
                &state.db,
                log_id,
                ProcessingStatus::Failed,
                Some(&err.to_string()),
            )
            .await?;
        }
    }

    result.map(|_| ())
}

async fn run(state: &AppState, log_id: uuid::Uuid) -> Result<usize, AppError> {
    let Some(log) = RawWebhookLog::find_by_id(&state.db, log_id).await? else {
        return Err(AppError::NotFound(format!("raw webhook log {log_id} vanished")));
    };

    let normalizer = state.normalizers.get(log.source);
    let normalized = normalizer.normalize(&log.body)?;

    if normalized.is_empty() {
        return Ok(0);
    }

    for event in &normalized {
        process_one_event(state, &log, event).await?;
    }

    Ok(normalized.len())
}

async fn process_one_event(
    state: &AppState,
    log: &RawWebhookLog,
    normalized: &revback_core::models::NormalizedEvent,
) -> Result<(), AppError> {
    let user_id = resolver::resolve(&state.db, log.org_id, &normalized.identity_hints).await?;

    let canonical =
        CanonicalEvent::insert_if_new(&state.db, log.org_id, log.source, user_id, normalized).await?;

    let Some(canonical) = canonical else {
        tracing::debug!(
            org_id = %log.org_id,
            external_event_id = %normalized.external_event_id,
            "canonical event already processed, skipping"
        );
        return Ok(());
    };

    let prior = match &canonical.product_id {
        Some(product_id) => {
            Entitlement::find(&state.db, log.org_id, canonical.user_id, product_id, log.source).await?
        }
        None => None,
    };

    let current = reducer::reduce(&state.db, &canonical).await?;

    let issues = engine::check_for_issues(
        &state.db,
        &state.detectors,
        log.org_id,
        &canonical,
        prior.as_ref(),
        current.as_ref(),
    )
    .await;

    for issue in issues {
        if let Err(err) = alerts::dispatch(
            &state.db,
            &state.queue,
            &state.http,
            &state.circuit_breakers,
            &issue,
            AlertEventType::IssueCreated,
        )
        .await
        {
            tracing::warn!(issue_id = %issue.id, error = %err, "alert dispatch failed, continuing");
        }
    }

    Ok(())
}
