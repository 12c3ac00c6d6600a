use crate::pipeline::process_webhook_job;
use crate::state::AppState;
use crate::webhook::WebhookProcessingJob;
use revback_core::models::ProcessingStatus;
use revback_queue::job::{JobEnvelope, WEBHOOK_PROCESSING};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;

/// Runs the `webhook-processing` consumer loop: bounded concurrency via a
/// semaphore, short poll timeout so shutdown is noticed promptly, and a
/// `JoinSet` drain on the way out so in-flight jobs finish before the
/// process exits (§4.7 "worker close() drains in-flight jobs", P6).
pub async fn run(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let semaphore = Arc::new(Semaphore::new(WEBHOOK_PROCESSING.concurrency));
    let mut in_flight = JoinSet::new();

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }

        let promoted = state.queue.promote_due(&WEBHOOK_PROCESSING).await;
        if let Err(err) = promoted {
            tracing::warn!(error = %err, "failed to promote delayed webhook-processing jobs");
        }

        let envelope = state
            .queue
            .dequeue::<WebhookProcessingJob>(&WEBHOOK_PROCESSING, Duration::from_millis(500))
            .await;

        let envelope = match envelope {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(error = %err, "webhook-processing dequeue failed");
                continue;
            }
        };

        let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
        let state = state.clone();
        let span =
            tracing::info_span!("webhook_job", log_id = %envelope.payload.log_id, attempt = envelope.attempt);
        in_flight.spawn(
            async move {
                handle_job(&state, envelope).await;
                drop(permit);
            }
            .instrument(span),
        );

        while in_flight.try_join_next().is_some() {}
    }

    tracing::info!("webhook-processing worker draining in-flight jobs");
    while in_flight.join_next().await.is_some() {}
}

async fn handle_job(state: &AppState, envelope: JobEnvelope<WebhookProcessingJob>) {
    let result = process_webhook_job(state, envelope.payload.log_id).await;

    match result {
        Ok(()) => {
            let _ = state.queue.forget(&WEBHOOK_PROCESSING, &envelope.job_id).await;
        }
        Err(err) => {
            tracing::warn!(error = %err, "webhook job failed");
            let outcome = state
                .queue
                .retry_or_dead_letter(&WEBHOOK_PROCESSING, &envelope.job_id, envelope.attempt, &envelope.payload)
                .await;

            match outcome {
                Ok(revback_queue::job::RetryOutcome::DeadLettered) => {
                    let _ = revback_core::repo::RawWebhookLog::mark_status(
                        &state.db,
                        envelope.payload.log_id,
                        ProcessingStatus::Dlq,
                        Some(&err.to_string()),
                    )
                    .await;
                    let _ = state.queue.forget(&WEBHOOK_PROCESSING, &envelope.job_id).await;
                }
                Ok(revback_queue::job::RetryOutcome::Scheduled { .. }) => {}
                Err(queue_err) => {
                    tracing::error!(error = %queue_err, "failed to schedule retry, job may be lost");
                }
            }
        }
    }
}
