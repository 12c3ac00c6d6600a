use chrono::Utc;
use revback_core::error::AppError;
use revback_core::repo;
use sqlx::PgPool;
use std::str::FromStr;
use uuid::Uuid;

/// One cron registry entry: `orgId = None` means "fan out to every active
/// org at run time" (spec's `orgId='all'`).
#[derive(Debug, Clone)]
pub struct ScanSchedule {
    pub name: String,
    pub cron_pattern: &'static str,
    pub detector_id: &'static str,
    pub org_id: Option<Uuid>,
}

/// The built-in registry reconciled at boot. All entries fan out to every
/// active org (`org_id: None`) — per-org overrides, if ever needed, would
/// be inserted here with a concrete `org_id`.
pub fn default_schedules() -> Vec<ScanSchedule> {
    let detector_ids = [
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

    detector_ids
        .iter()
        .map(|id| ScanSchedule {
            name: format!("scan-{id}"),
            cron_pattern: "0 */15 * * * *",
            detector_id: id,
            org_id: None,
        })
        .collect()
}

/// Parses each schedule's cron pattern, failing fast at boot on a typo
/// rather than silently never firing.
pub fn validate_schedules(schedules: &[ScanSchedule]) -> Result<(), AppError> {
    for schedule in schedules {
        cron::Schedule::from_str(schedule.cron_pattern)
            .map_err(|e| AppError::Internal(format!("invalid cron pattern for {}: {e}", schedule.name)))?;
    }
    Ok(())
}

/// Resolve the next fire time for a schedule strictly after `after`.
pub fn next_fire_time(schedule: &ScanSchedule, after: chrono::DateTime<Utc>) -> Option<chrono::DateTime<Utc>> {
    cron::Schedule::from_str(schedule.cron_pattern)
        .ok()
        .and_then(|s| s.after(&after).next())
}

/// Expand an `org_id: None` schedule into one entry per active org in the
/// platform; a concrete `org_id` schedule expands to itself.
pub async fn target_orgs(pool: &PgPool, schedule: &ScanSchedule) -> Result<Vec<Uuid>, AppError> {
    match schedule.org_id {
        Some(id) => Ok(vec![id]),
        None => repo::Organization::list_active_ids(pool).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedules_cover_every_detector() {
        let schedules = default_schedules();
        assert_eq!(schedules.len(), 12);
        assert!(validate_schedules(&schedules).is_ok());
    }

    #[test]
    fn fan_out_schedules_have_no_org_id() {
        for schedule in default_schedules() {
            assert!(schedule.org_id.is_none());
        }
    }

    #[test]
    fn next_fire_time_advances() {
        let schedule = ScanSchedule {
            name: "test".to_string(),
            cron_pattern: "0 */15 * * * *",
            detector_id: "test",
            org_id: None,
        };
        let now = Utc::now();
        let next = next_fire_time(&schedule, now).expect("schedule should have a next fire time");
        assert!(next > now);
    }
}
