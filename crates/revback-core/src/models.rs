use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Billing providers RevBack normalizes webhooks from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Stripe,
    Apple,
    Google,
    Recurly,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Stripe => "stripe",
            Source::Apple => "apple",
            Source::Google => "google",
            Source::Recurly => "recurly",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stripe" => Ok(Source::Stripe),
            "apple" => Ok(Source::Apple),
            "google" => Ok(Source::Google),
            "recurly" => Ok(Source::Recurly),
            other => Err(format!("unknown source '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingConnection {
    pub id: Uuid,
    pub org_id: Uuid,
    pub source: Source,
    pub encrypted_credentials: String,
    pub is_active: bool,
    pub last_webhook_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Received,
    Processing,
    Succeeded,
    Failed,
    Dlq,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RawWebhookLog {
    pub id: Uuid,
    pub org_id: Uuid,
    pub source: Source,
    pub headers: serde_json::Value,
    pub body: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub processing_status: ProcessingStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Purchase,
    Renewal,
    Refund,
    Chargeback,
    Cancellation,
    Expiration,
    TrialConversion,
    TrialStart,
    BillingRetry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Success,
    Failed,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CanonicalEvent {
    pub id: Uuid,
    pub org_id: Uuid,
    pub source: Source,
    pub external_event_id: String,
    pub event_type: EventType,
    pub status: EventStatus,
    pub user_id: Uuid,
    pub product_id: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub event_time: DateTime<Utc>,
    /// The period end the provider reported on this event, if any (§4.3
    /// "period fields" — purchase/renewal/trial_conversion roll the period).
    pub period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub org_id: Uuid,
    pub external_user_id: Option<String>,
    pub email: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IdentityType {
    CustomerId,
    OriginalTransactionId,
    Email,
    AppUserId,
    SubscriptionId,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserIdentity {
    pub id: Uuid,
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub source: Source,
    pub id_type: IdentityType,
    pub external_id: String,
    pub created_at: DateTime<Utc>,
}

/// An identity hint emitted by a normalizer: "this user could be found by
/// this `(source, id_type, external_id)` tuple".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityHint {
    pub source: Source,
    pub id_type: IdentityType,
    pub external_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntitlementState {
    Active,
    Trial,
    GracePeriod,
    BillingRetry,
    Inactive,
    Expired,
    Revoked,
    Refunded,
}

impl EntitlementState {
    pub fn is_active_family(&self) -> bool {
        matches!(
            self,
            EntitlementState::Active
                | EntitlementState::Trial
                | EntitlementState::GracePeriod
                | EntitlementState::BillingRetry
        )
    }

    pub fn is_inactive_family(&self) -> bool {
        !self.is_active_family()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Entitlement {
    pub id: Uuid,
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub product_id: String,
    pub source: Source,
    pub state: EntitlementState,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_end: Option<DateTime<Utc>>,
    pub external_subscription_id: Option<String>,
    pub last_event_time: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Open,
    Resolved,
    Dismissed,
    Acknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DetectionTier {
    BillingOnly,
    AppVerified,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Issue {
    pub id: Uuid,
    pub org_id: Uuid,
    pub user_id: Option<Uuid>,
    pub issue_type: String,
    pub severity: Severity,
    pub status: IssueStatus,
    pub title: String,
    pub description: String,
    pub estimated_revenue_cents: Option<i64>,
    pub confidence: f64,
    pub detector_id: String,
    pub detection_tier: DetectionTier,
    pub evidence: serde_json::Value,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AccessCheck {
    pub id: Uuid,
    pub org_id: Uuid,
    pub user_id: Uuid,
    pub product_id: String,
    pub external_user_id: Option<String>,
    pub has_access: bool,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AlertChannel {
    Email,
    Webhook,
    Slack,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlertConfig {
    pub id: Uuid,
    pub org_id: Uuid,
    pub channel: AlertChannel,
    pub target: String,
    pub secret: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    Failed,
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlertDeliveryLog {
    pub id: Uuid,
    pub org_id: Uuid,
    pub issue_id: Uuid,
    pub channel: AlertChannel,
    pub attempt: i32,
    pub outcome: DeliveryOutcome,
    pub responded_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// A canonical event as produced by a normalizer, not yet persisted — it
/// carries identity hints alongside the row fields so the ingestion pipeline
/// can resolve a user before insert.
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    pub external_event_id: String,
    pub event_type: EventType,
    pub status: EventStatus,
    pub product_id: Option<String>,
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub event_time: DateTime<Utc>,
    /// Provider-reported period end (Stripe `current_period_end`, Apple
    /// `expiresDate`, Google line-item expiry, Recurly
    /// `current_period_ends_at`) — `None` when the event type has nothing to
    /// report (e.g. a chargeback).
    pub period_end: Option<DateTime<Utc>>,
    pub identity_hints: Vec<IdentityHint>,
}
