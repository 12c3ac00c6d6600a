use revback_core::error::AppError;
use revback_core::models::{CanonicalEvent, Entitlement, EntitlementState, EventStatus, EventType};
use revback_core::repo::{self, EntitlementUpdate};
use sqlx::PgPool;

/// Apply a canonical event to its `(orgId, userId, productId, source)`
/// entitlement per the state transition table in §4.3. A missing `productId`
/// skips the reducer entirely — there is nothing to key the upsert on.
pub async fn reduce(pool: &PgPool, event: &CanonicalEvent) -> Result<Option<Entitlement>, AppError> {
    let Some(product_id) = &event.product_id else {
        tracing::debug!(event_id = %event.id, "event has no product_id, skipping reducer");
        return Ok(None);
    };

    let Some(transition) = transition_for(event) else {
        tracing::debug!(event_id = %event.id, event_type = ?event.event_type, "no state transition for this event, skipping reducer");
        return Ok(None);
    };

    let existing = Entitlement::find(pool, event.org_id, event.user_id, product_id, event.source).await?;

    let update = EntitlementUpdate {
        state: transition,
        current_period_start: period_start(event, existing.as_ref()),
        current_period_end: period_end(event, existing.as_ref()),
        trial_end: trial_end(event, existing.as_ref()),
        external_subscription_id: existing.as_ref().and_then(|e| e.external_subscription_id.clone()),
    };

    let entitlement = repo::Entitlement::apply_event(
        pool,
        event.org_id,
        event.user_id,
        product_id,
        event.source,
        event.event_time,
        &update,
    )
    .await?;

    Ok(Some(entitlement))
}

fn transition_for(event: &CanonicalEvent) -> Option<EntitlementState> {
    use EntitlementState::*;
    use EventStatus::*;
    use EventType::*;

    match (event.event_type, event.status) {
        (Purchase, Success) => Some(Active),
        (TrialStart, Success) => Some(Trial),
        (TrialConversion, Success) => Some(Active),
        (Renewal, Success) => Some(Active),
        (BillingRetry, Failed) => Some(BillingRetry),
        // A cancellation means "don't renew" — access stays active until
        // currentPeriodEnd per §4.3. The terminal transition to Expired is
        // driven by the later expiration event or the scheduled expiry scan,
        // not by the cancellation itself.
        (Cancellation, Success) => Some(Active),
        (Expiration, Success) => Some(Expired),
        (Refund, Success) => Some(Refunded),
        (Chargeback, Success) => Some(Revoked),
        _ => None,
    }
}

fn period_start(event: &CanonicalEvent, existing: Option<&Entitlement>) -> Option<chrono::DateTime<chrono::Utc>> {
    match event.event_type {
        EventType::Purchase | EventType::Renewal | EventType::TrialConversion => Some(event.event_time),
        _ => existing.and_then(|e| e.current_period_start),
    }
}

fn period_end(event: &CanonicalEvent, existing: Option<&Entitlement>) -> Option<chrono::DateTime<chrono::Utc>> {
    match event.event_type {
        // Purchase sets the period from the event; renewal and trial
        // conversion roll it forward. Fall back to the existing row if the
        // provider didn't report one on this particular event.
        EventType::Purchase | EventType::Renewal | EventType::TrialConversion => {
            event.period_end.or_else(|| existing.and_then(|e| e.current_period_end))
        }
        _ => existing.and_then(|e| e.current_period_end),
    }
}

fn trial_end(event: &CanonicalEvent, existing: Option<&Entitlement>) -> Option<chrono::DateTime<chrono::Utc>> {
    match event.event_type {
        EventType::TrialStart => Some(event.event_time),
        _ => existing.and_then(|e| e.trial_end),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use revback_core::models::Source;
    use uuid::Uuid;

    fn event(event_type: EventType, status: EventStatus) -> CanonicalEvent {
        CanonicalEvent {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            source: Source::Stripe,
            external_event_id: "evt_1".to_string(),
            event_type,
            status,
            user_id: Uuid::new_v4(),
            product_id: Some("prod_pro".to_string()),
            amount_cents: Some(999),
            currency: Some("usd".to_string()),
            event_time: Utc::now(),
            period_end: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn purchase_success_transitions_to_active() {
        let e = event(EventType::Purchase, EventStatus::Success);
        assert_eq!(transition_for(&e), Some(EntitlementState::Active));
    }

    #[test]
    fn billing_retry_failed_transitions_to_billing_retry() {
        let e = event(EventType::BillingRetry, EventStatus::Failed);
        assert_eq!(transition_for(&e), Some(EntitlementState::BillingRetry));
    }

    #[test]
    fn billing_retry_success_has_no_transition() {
        let e = event(EventType::BillingRetry, EventStatus::Success);
        assert_eq!(transition_for(&e), None);
    }

    #[test]
    fn refund_transitions_to_refunded() {
        let e = event(EventType::Refund, EventStatus::Success);
        assert_eq!(transition_for(&e), Some(EntitlementState::Refunded));
    }

    #[test]
    fn chargeback_transitions_to_revoked() {
        let e = event(EventType::Chargeback, EventStatus::Success);
        assert_eq!(transition_for(&e), Some(EntitlementState::Revoked));
    }

    #[test]
    fn cancellation_stays_active_until_period_end() {
        let e = event(EventType::Cancellation, EventStatus::Success);
        assert_eq!(transition_for(&e), Some(EntitlementState::Active));
    }

    #[test]
    fn expiration_transitions_to_expired() {
        let e = event(EventType::Expiration, EventStatus::Success);
        assert_eq!(transition_for(&e), Some(EntitlementState::Expired));
    }

    #[test]
    fn purchase_sets_period_end_from_event() {
        let mut e = event(EventType::Purchase, EventStatus::Success);
        let end = Utc::now() + chrono::Duration::days(30);
        e.period_end = Some(end);
        assert_eq!(period_end(&e, None), Some(end));
    }

    #[test]
    fn renewal_rolls_period_end_forward() {
        let mut e = event(EventType::Renewal, EventStatus::Success);
        let new_end = Utc::now() + chrono::Duration::days(30);
        e.period_end = Some(new_end);
        assert_eq!(period_end(&e, None), Some(new_end));
    }

    #[test]
    fn cancellation_preserves_existing_period_end() {
        let e = event(EventType::Cancellation, EventStatus::Success);
        let existing_end = Utc::now() + chrono::Duration::days(10);
        let existing = Entitlement {
            id: Uuid::new_v4(),
            org_id: e.org_id,
            user_id: e.user_id,
            product_id: "prod_pro".to_string(),
            source: Source::Stripe,
            state: EntitlementState::Active,
            current_period_start: None,
            current_period_end: Some(existing_end),
            trial_end: None,
            external_subscription_id: None,
            last_event_time: None,
            updated_at: Utc::now(),
        };
        assert_eq!(period_end(&e, Some(&existing)), Some(existing_end));
    }
}
