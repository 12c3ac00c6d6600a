use crate::state::AppState;
use revback_core::models::{AlertChannel, DeliveryOutcome};
use revback_queue::alerts::{self, WebhookDeliveryJob};
use revback_queue::job::{JobEnvelope, WEBHOOK_DELIVERY};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

/// Consumer for the `webhook-delivery` queue: one job in, one HTTP POST
/// attempt out, 7 exponential retries before the log stays at its last
/// recorded `AlertDeliveryLog` row (§4.9).
pub async fn run(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let semaphore = Arc::new(Semaphore::new(WEBHOOK_DELIVERY.concurrency));
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

        if let Err(err) = state.queue.promote_due(&WEBHOOK_DELIVERY).await {
            tracing::warn!(error = %err, "failed to promote delayed webhook-delivery jobs");
        }

        let envelope = state
            .queue
            .dequeue::<WebhookDeliveryJob>(&WEBHOOK_DELIVERY, Duration::from_millis(500))
            .await;

        let envelope: JobEnvelope<WebhookDeliveryJob> = match envelope {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(error = %err, "webhook-delivery dequeue failed");
                continue;
            }
        };

        let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
        let state = state.clone();
        in_flight.spawn(async move {
            handle_job(&state, envelope).await;
            drop(permit);
        });

        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
}

async fn handle_job(state: &AppState, envelope: JobEnvelope<WebhookDeliveryJob>) {
    let result = alerts::deliver_webhook_job(
        &state.db,
        &state.http,
        &state.circuit_breakers,
        &envelope.payload,
        envelope.attempt,
    )
    .await;

    match result {
        Ok(()) => {
            let _ = state.queue.forget(&WEBHOOK_DELIVERY, &envelope.job_id).await;
        }
        Err(err) => {
            tracing::warn!(error = %err, "alert webhook delivery attempt failed");
            let outcome = state
                .queue
                .retry_or_dead_letter(&WEBHOOK_DELIVERY, &envelope.job_id, envelope.attempt, &envelope.payload)
                .await;

            if let Ok(revback_queue::job::RetryOutcome::DeadLettered) = outcome {
                let _ = revback_core::repo::AlertDeliveryLog::insert(
                    &state.db,
                    envelope.payload.org_id,
                    envelope.payload.issue_id,
                    AlertChannel::Webhook,
                    envelope.attempt as i32,
                    DeliveryOutcome::Exhausted,
                    Some("webhook delivery attempts exhausted"),
                )
                .await;
                let _ = state.queue.forget(&WEBHOOK_DELIVERY, &envelope.job_id).await;
            }
        }
    }
}
