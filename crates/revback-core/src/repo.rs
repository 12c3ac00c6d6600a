use crate::error::AppError;
pub use crate::models::*;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub async fn connect(database_url: &str) -> Result<PgPool, AppError> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(AppError::from)
}

// ── Organizations ────────────────────────────────────────────────────────

impl Organization {
    pub async fn find_by_slug(pool: &PgPool, slug: &str) -> Result<Option<Organization>, AppError> {
        sqlx::query_as::<_, Organization>(
            "select id, slug, name, created_at from organizations where slug = $1",
        )
        .bind(slug)
        .fetch_optional(pool)
        .await
        .map_err(AppError::from)
    }

    pub async fn list_active_ids(pool: &PgPool) -> Result<Vec<Uuid>, AppError> {
        let rows = sqlx::query("select id from organizations")
            .fetch_all(pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("id")).collect())
    }
}

// ── BillingConnection ────────────────────────────────────────────────────

impl BillingConnection {
    pub async fn find_by_org_slug_and_source(
        pool: &PgPool,
        org_slug: &str,
        source: Source,
    ) -> Result<Option<(Organization, BillingConnection)>, AppError> {
        let Some(org) = Organization::find_by_slug(pool, org_slug).await? else {
            return Ok(None);
        };
        let conn = sqlx::query_as::<_, BillingConnection>(
            "select id, org_id, source, encrypted_credentials, is_active, last_webhook_at, created_at
             from billing_connections where org_id = $1 and source = $2",
        )
        .bind(org.id)
        .bind(source)
        .fetch_optional(pool)
        .await?;
        Ok(conn.map(|c| (org, c)))
    }

    pub async fn touch_last_webhook_at(pool: &PgPool, id: Uuid) -> Result<(), AppError> {
        sqlx::query("update billing_connections set last_webhook_at = now() where id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn list_active(pool: &PgPool, org_id: Uuid) -> Result<Vec<BillingConnection>, AppError> {
        sqlx::query_as::<_, BillingConnection>(
            "select id, org_id, source, encrypted_credentials, is_active, last_webhook_at, created_at
             from billing_connections where org_id = $1 and is_active = true",
        )
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::from)
    }

    pub async fn list_all_active(pool: &PgPool) -> Result<Vec<BillingConnection>, AppError> {
        sqlx::query_as::<_, BillingConnection>(
            "select id, org_id, source, encrypted_credentials, is_active, last_webhook_at, created_at
             from billing_connections where is_active = true",
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::from)
    }
}

// ── RawWebhookLog ────────────────────────────────────────────────────────

impl RawWebhookLog {
    pub async fn insert(
        pool: &PgPool,
        org_id: Uuid,
        source: Source,
        headers: serde_json::Value,
        body: &[u8],
    ) -> Result<Uuid, AppError> {
        let row = sqlx::query(
            "insert into raw_webhook_logs (org_id, source, headers, body, processing_status)
             values ($1, $2, $3, $4, 'received') returning id",
        )
        .bind(org_id)
        .bind(source)
        .bind(headers)
        .bind(body)
        .fetch_one(pool)
        .await?;
        Ok(row.get("id"))
    }

    pub async fn mark_status(
        pool: &PgPool,
        id: Uuid,
        status: ProcessingStatus,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "update raw_webhook_logs set processing_status = $2, error_message = $3 where id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(error_message)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<RawWebhookLog>, AppError> {
        sqlx::query_as::<_, RawWebhookLog>(
            "select id, org_id, source, headers, body, received_at, processing_status, error_message
             from raw_webhook_logs where id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::from)
    }
}

// ── Users & identities ───────────────────────────────────────────────────

impl User {
    pub async fn create(
        pool: &PgPool,
        org_id: Uuid,
        external_user_id: Option<&str>,
        email: Option<&str>,
    ) -> Result<User, AppError> {
        sqlx::query_as::<_, User>(
            "insert into users (org_id, external_user_id, email, metadata)
             values ($1, $2, $3, '{}') returning id, org_id, external_user_id, email, metadata, created_at",
        )
        .bind(org_id)
        .bind(external_user_id)
        .bind(email)
        .fetch_one(pool)
        .await
        .map_err(AppError::from)
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<User>, AppError> {
        sqlx::query_as::<_, User>(
            "select id, org_id, external_user_id, email, metadata, created_at from users where id = $1",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::from)
    }
}

impl UserIdentity {
    /// Probe for a user matching this identity hint.
    pub async fn find_user(
        pool: &PgPool,
        org_id: Uuid,
        source: Source,
        id_type: IdentityType,
        external_id: &str,
    ) -> Result<Option<Uuid>, AppError> {
        let row = sqlx::query(
            "select user_id from user_identities
             where org_id = $1 and source = $2 and id_type = $3 and external_id = $4",
        )
        .bind(org_id)
        .bind(source)
        .bind(id_type)
        .bind(external_id)
        .fetch_optional(pool)
        .await?;
        Ok(row.map(|r| r.get("user_id")))
    }

    /// Link an identity to a user. Tolerates a concurrent insert of the same
    /// tuple by treating the uniqueness violation as a no-op, per §4.2.
    pub async fn link(
        pool: &PgPool,
        org_id: Uuid,
        user_id: Uuid,
        source: Source,
        id_type: IdentityType,
        external_id: &str,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "insert into user_identities (org_id, user_id, source, id_type, external_id)
             values ($1, $2, $3, $4, $5)
             on conflict (org_id, source, id_type, external_id) do nothing",
        )
        .bind(org_id)
        .bind(user_id)
        .bind(source)
        .bind(id_type)
        .bind(external_id)
        .execute(pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(()),
            Err(e) => Err(AppError::from(e)),
        }
    }
}

// ── CanonicalEvent ───────────────────────────────────────────────────────

impl CanonicalEvent {
    /// Insert a canonical event, silently no-op'ing on replay per P1.
    /// Returns `None` when the row already existed.
    pub async fn insert_if_new(
        pool: &PgPool,
        org_id: Uuid,
        source: Source,
        user_id: Uuid,
        normalized: &NormalizedEvent,
    ) -> Result<Option<CanonicalEvent>, AppError> {
        sqlx::query_as::<_, CanonicalEvent>(
            "insert into canonical_events
                (org_id, source, external_event_id, event_type, status, user_id, product_id, amount_cents, currency, event_time, period_end)
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             on conflict (org_id, source, external_event_id) do nothing
             returning id, org_id, source, external_event_id, event_type, status, user_id, product_id, amount_cents, currency, event_time, period_end, created_at",
        )
        .bind(org_id)
        .bind(source)
        .bind(&normalized.external_event_id)
        .bind(normalized.event_type)
        .bind(normalized.status)
        .bind(user_id)
        .bind(&normalized.product_id)
        .bind(normalized.amount_cents)
        .bind(&normalized.currency)
        .bind(normalized.event_time)
        .bind(normalized.period_end)
        .fetch_optional(pool)
        .await
        .map_err(AppError::from)
    }

    /// Events for a `(user, product)` since a given time, across all sources
    /// — used by `silent_renewal_failure` to check for post-expiry activity.
    pub async fn list_since(
        pool: &PgPool,
        org_id: Uuid,
        user_id: Uuid,
        product_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CanonicalEvent>, AppError> {
        sqlx::query_as::<_, CanonicalEvent>(
            "select id, org_id, source, external_event_id, event_type, status, user_id, product_id, amount_cents, currency, event_time, period_end, created_at
             from canonical_events
             where org_id = $1 and user_id = $2 and product_id = $3 and event_time >= $4",
        )
        .bind(org_id)
        .bind(user_id)
        .bind(product_id)
        .bind(since)
        .fetch_all(pool)
        .await
        .map_err(AppError::from)
    }
}

// ── Entitlement ──────────────────────────────────────────────────────────

pub struct EntitlementUpdate {
    pub state: EntitlementState,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub external_subscription_id: Option<String>,
}

impl Entitlement {
    /// Atomic upsert keyed by `(org_id, user_id, product_id, source)`. The
    /// `where` clause on the `do update` guards monotonicity per P3: the row
    /// is left untouched if the incoming event is older than the last one
    /// applied.
    pub async fn apply_event(
        pool: &PgPool,
        org_id: Uuid,
        user_id: Uuid,
        product_id: &str,
        source: Source,
        event_time: DateTime<Utc>,
        update: &EntitlementUpdate,
    ) -> Result<Entitlement, AppError> {
        let row = sqlx::query_as::<_, Entitlement>(
            "insert into entitlements
                (org_id, user_id, product_id, source, state, current_period_start, current_period_end, trial_end, external_subscription_id, last_event_time, updated_at)
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
             on conflict (org_id, user_id, product_id, source) do update set
                state = excluded.state,
                current_period_start = excluded.current_period_start,
                current_period_end = excluded.current_period_end,
                trial_end = excluded.trial_end,
                external_subscription_id = excluded.external_subscription_id,
                last_event_time = excluded.last_event_time,
                updated_at = now()
             where entitlements.last_event_time is null or entitlements.last_event_time <= excluded.last_event_time
             returning id, org_id, user_id, product_id, source, state, current_period_start, current_period_end, trial_end, external_subscription_id, last_event_time, updated_at",
        )
        .bind(org_id)
        .bind(user_id)
        .bind(product_id)
        .bind(source)
        .bind(update.state)
        .bind(update.current_period_start)
        .bind(update.current_period_end)
        .bind(update.trial_end)
        .bind(&update.external_subscription_id)
        .bind(event_time)
        .fetch_optional(pool)
        .await?;

        match row {
            Some(entitlement) => Ok(entitlement),
            // The `where` clause suppressed the write (out-of-order event per
            // P3); the row exists unchanged, so fetch and return it as-is.
            None => Self::find(pool, org_id, user_id, product_id, source)
                .await?
                .ok_or_else(|| AppError::Internal("entitlement vanished after upsert".to_string())),
        }
    }

    pub async fn find(
        pool: &PgPool,
        org_id: Uuid,
        user_id: Uuid,
        product_id: &str,
        source: Source,
    ) -> Result<Option<Entitlement>, AppError> {
        sqlx::query_as::<_, Entitlement>(
            "select id, org_id, user_id, product_id, source, state, current_period_start, current_period_end, trial_end, external_subscription_id, last_event_time, updated_at
             from entitlements where org_id = $1 and user_id = $2 and product_id = $3 and source = $4",
        )
        .bind(org_id)
        .bind(user_id)
        .bind(product_id)
        .bind(source)
        .fetch_optional(pool)
        .await
        .map_err(AppError::from)
    }

    pub async fn list_for_user_product(
        pool: &PgPool,
        org_id: Uuid,
        user_id: Uuid,
        product_id: &str,
    ) -> Result<Vec<Entitlement>, AppError> {
        sqlx::query_as::<_, Entitlement>(
            "select id, org_id, user_id, product_id, source, state, current_period_start, current_period_end, trial_end, external_subscription_id, last_event_time, updated_at
             from entitlements where org_id = $1 and user_id = $2 and product_id = $3",
        )
        .bind(org_id)
        .bind(user_id)
        .bind(product_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::from)
    }

    pub async fn list_by_states(
        pool: &PgPool,
        org_id: Uuid,
        states: &[EntitlementState],
    ) -> Result<Vec<Entitlement>, AppError> {
        sqlx::query_as::<_, Entitlement>(
            "select id, org_id, user_id, product_id, source, state, current_period_start, current_period_end, trial_end, external_subscription_id, last_event_time, updated_at
             from entitlements where org_id = $1 and state = any($2)",
        )
        .bind(org_id)
        .bind(states)
        .fetch_all(pool)
        .await
        .map_err(AppError::from)
    }

    pub async fn list_active_by_source(
        pool: &PgPool,
        source: Source,
    ) -> Result<Vec<Entitlement>, AppError> {
        sqlx::query_as::<_, Entitlement>(
            "select id, org_id, user_id, product_id, source, state, current_period_start, current_period_end, trial_end, external_subscription_id, last_event_time, updated_at
             from entitlements where source = $1 and state in ('active', 'trial', 'grace_period', 'billing_retry')",
        )
        .bind(source)
        .fetch_all(pool)
        .await
        .map_err(AppError::from)
    }

    pub async fn list_for_org(pool: &PgPool, org_id: Uuid) -> Result<Vec<Entitlement>, AppError> {
        sqlx::query_as::<_, Entitlement>(
            "select id, org_id, user_id, product_id, source, state, current_period_start, current_period_end, trial_end, external_subscription_id, last_event_time, updated_at
             from entitlements where org_id = $1",
        )
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::from)
    }
}

// ── Issue ────────────────────────────────────────────────────────────────

impl Issue {
    pub async fn find_open(
        pool: &PgPool,
        org_id: Uuid,
        user_id: Option<Uuid>,
        issue_type: &str,
    ) -> Result<Option<Issue>, AppError> {
        sqlx::query_as::<_, Issue>(
            "select id, org_id, user_id, issue_type, severity, status, title, description, estimated_revenue_cents, confidence, detector_id, detection_tier, evidence, resolved_at, resolution, created_at
             from issues where org_id = $1 and user_id is not distinct from $2 and issue_type = $3 and status = 'open'",
        )
        .bind(org_id)
        .bind(user_id)
        .bind(issue_type)
        .fetch_optional(pool)
        .await
        .map_err(AppError::from)
    }

    /// Insert a new open issue. On a unique-constraint race against the
    /// partial dedup index, treat it as a duplicate (no-op) per §4.5.
    pub async fn create(
        pool: &PgPool,
        org_id: Uuid,
        user_id: Option<Uuid>,
        issue_type: &str,
        severity: Severity,
        title: &str,
        description: &str,
        estimated_revenue_cents: Option<i64>,
        confidence: f64,
        detector_id: &str,
        detection_tier: DetectionTier,
        evidence: serde_json::Value,
    ) -> Result<Option<Issue>, AppError> {
        let result = sqlx::query_as::<_, Issue>(
            "insert into issues
                (org_id, user_id, issue_type, severity, status, title, description, estimated_revenue_cents, confidence, detector_id, detection_tier, evidence)
             values ($1, $2, $3, $4, 'open', $5, $6, $7, $8, $9, $10, $11)
             returning id, org_id, user_id, issue_type, severity, status, title, description, estimated_revenue_cents, confidence, detector_id, detection_tier, evidence, resolved_at, resolution, created_at",
        )
        .bind(org_id)
        .bind(user_id)
        .bind(issue_type)
        .bind(severity)
        .bind(title)
        .bind(description)
        .bind(estimated_revenue_cents)
        .bind(confidence)
        .bind(detector_id)
        .bind(detection_tier)
        .bind(evidence)
        .fetch_one(pool)
        .await;

        match result {
            Ok(issue) => Ok(Some(issue)),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(None),
            Err(e) => Err(AppError::from(e)),
        }
    }

    pub async fn list_open_for_org(pool: &PgPool, org_id: Uuid) -> Result<Vec<Issue>, AppError> {
        sqlx::query_as::<_, Issue>(
            "select id, org_id, user_id, issue_type, severity, status, title, description, estimated_revenue_cents, confidence, detector_id, detection_tier, evidence, resolved_at, resolution, created_at
             from issues where org_id = $1 and status = 'open' order by created_at desc",
        )
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::from)
    }
}

// ── AccessCheck ──────────────────────────────────────────────────────────

impl AccessCheck {
    pub async fn latest_for_user_product(
        pool: &PgPool,
        org_id: Uuid,
        user_id: Uuid,
        product_id: &str,
    ) -> Result<Option<AccessCheck>, AppError> {
        sqlx::query_as::<_, AccessCheck>(
            "select id, org_id, user_id, product_id, external_user_id, has_access, reported_at
             from access_checks
             where org_id = $1 and user_id = $2 and product_id = $3
             order by reported_at desc limit 1",
        )
        .bind(org_id)
        .bind(user_id)
        .bind(product_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::from)
    }

    pub async fn org_has_any(pool: &PgPool, org_id: Uuid) -> Result<bool, AppError> {
        let row = sqlx::query("select exists(select 1 from access_checks where org_id = $1) as present")
            .bind(org_id)
            .fetch_one(pool)
            .await?;
        Ok(row.get("present"))
    }

    /// Most recent report per `(user_id, product_id)`, used by the Tier-2
    /// detectors to compare believed entitlement state against reality.
    pub async fn list_latest_per_user_product(pool: &PgPool, org_id: Uuid) -> Result<Vec<AccessCheck>, AppError> {
        sqlx::query_as::<_, AccessCheck>(
            "select distinct on (user_id, product_id)
                id, org_id, user_id, product_id, external_user_id, has_access, reported_at
             from access_checks
             where org_id = $1
             order by user_id, product_id, reported_at desc",
        )
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::from)
    }
}

// ── AlertConfig / AlertDeliveryLog ───────────────────────────────────────

impl AlertConfig {
    pub async fn list_active_for_org(pool: &PgPool, org_id: Uuid) -> Result<Vec<AlertConfig>, AppError> {
        sqlx::query_as::<_, AlertConfig>(
            "select id, org_id, channel, target, secret, is_active
             from alert_configs where org_id = $1 and is_active = true",
        )
        .bind(org_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::from)
    }
}

impl AlertDeliveryLog {
    pub async fn insert(
        pool: &PgPool,
        org_id: Uuid,
        issue_id: Uuid,
        channel: AlertChannel,
        attempt: i32,
        outcome: DeliveryOutcome,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "insert into alert_delivery_logs (org_id, issue_id, channel, attempt, outcome, error_message)
             values ($1, $2, $3, $4, $5, $6)",
        )
        .bind(org_id)
        .bind(issue_id)
        .bind(channel)
        .bind(attempt)
        .bind(outcome)
        .bind(error_message)
        .execute(pool)
        .await?;
        Ok(())
    }
}
