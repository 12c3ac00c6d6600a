use crate::state::AppState;
use revback_queue::job::{JobEnvelope, SCHEDULED_SCANS};
use revback_queue::scheduler::{self, ScanSchedule};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(serde::Serialize, serde::Deserialize, Clone)]
pub struct ScheduledScanJob {
    pub detector_id: String,
    pub org_id: Uuid,
}

/// Cron reconciliation loop: ticks once a minute, and for each registry
/// entry whose next fire time has passed, enqueues one `ScheduledScanJob`
/// per target org (§4.7 "reconciled at boot", "`orgId='all'` fans out").
pub async fn run_scheduler(state: AppState, mut shutdown: watch::Receiver<bool>) {
    if !state.config.enable_scheduled_scans {
        tracing::info!("scheduled scans disabled via ENABLE_SCHEDULED_SCANS");
        return;
    }

    let schedules = scheduler::default_schedules();
    if let Err(err) = scheduler::validate_schedules(&schedules) {
        tracing::error!(error = %err, "invalid scan schedule registry, scheduler not starting");
        return;
    }

    let mut next_fire: HashMap<String, chrono::DateTime<chrono::Utc>> = HashMap::new();
    let now = chrono::Utc::now();
    for schedule in &schedules {
        if let Some(fire_at) = scheduler::next_fire_time(schedule, now) {
            next_fire.insert(schedule.name.clone(), fire_at);
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        }
        if *shutdown.borrow() {
            break;
        }

        let now = chrono::Utc::now();
        for schedule in &schedules {
            let due = next_fire.get(&schedule.name).map(|t| *t <= now).unwrap_or(true);
            if !due {
                continue;
            }

            if let Err(err) = fire(&state, schedule).await {
                tracing::warn!(schedule = schedule.name, error = %err, "failed to fan out scheduled scan");
            }

            if let Some(fire_at) = scheduler::next_fire_time(schedule, now) {
                next_fire.insert(schedule.name.clone(), fire_at);
            }
        }
    }
}

async fn fire(state: &AppState, schedule: &ScanSchedule) -> Result<(), revback_core::error::AppError> {
    let orgs = scheduler::target_orgs(&state.db, schedule).await?;
    for org_id in orgs {
        let job = ScheduledScanJob { detector_id: schedule.detector_id.to_string(), org_id };
        let job_id = format!("scan-{}-{}-{}", schedule.detector_id, org_id, chrono::Utc::now().timestamp());
        state.queue.enqueue(&SCHEDULED_SCANS, &job_id, &job).await?;
    }
    Ok(())
}

/// Consumer loop for the `scheduled-scans` queue: one job in, one
/// detector's `scheduled_scan` run against one org.
pub async fn run_consumer(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let semaphore = Arc::new(tokio::sync::Semaphore::new(SCHEDULED_SCANS.concurrency));
    let mut in_flight = tokio::task::JoinSet::new();

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

        let envelope = state
            .queue
            .dequeue::<ScheduledScanJob>(&SCHEDULED_SCANS, Duration::from_millis(500))
            .await;

        let envelope: JobEnvelope<ScheduledScanJob> = match envelope {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(error = %err, "scheduled-scans dequeue failed");
                continue;
            }
        };

        let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
        let state = state.clone();
        in_flight.spawn(async move {
            run_one(&state, &envelope.payload).await;
            drop(permit);
        });

        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
}

async fn run_one(state: &AppState, job: &ScheduledScanJob) {
    let Some(detector) = state.detectors.by_id(&job.detector_id) else {
        tracing::warn!(detector_id = job.detector_id, "unknown detector in scheduled scan job");
        return;
    };

    let report = revback_detect::engine::run_single_detector_scan(&state.db, detector.as_ref(), job.org_id).await;
    tracing::info!(
        detector_id = report.detector_id,
        org_id = %job.org_id,
        total = report.total,
        new = report.new,
        "scheduled scan completed"
    );

    for issue in &report.created {
        if let Err(err) = revback_queue::alerts::dispatch(
            &state.db,
            &state.queue,
            &state.http,
            &state.circuit_breakers,
            issue,
            revback_queue::alerts::AlertEventType::IssueCreated,
        )
        .await
        {
            tracing::warn!(issue_id = %issue.id, error = %err, "alert dispatch failed, continuing");
        }
    }
}
