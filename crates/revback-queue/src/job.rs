use redis::AsyncCommands;
use revback_core::error::AppError;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// A named queue's operating defaults, per §4.7.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub name: &'static str,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

pub const WEBHOOK_PROCESSING: QueueConfig = QueueConfig {
    name: "webhook-processing",
    concurrency: 5,
    max_attempts: 3,
    base_backoff: Duration::from_secs(2),
    max_backoff: Duration::from_secs(8),
};

pub const SCHEDULED_SCANS: QueueConfig = QueueConfig {
    name: "scheduled-scans",
    concurrency: 2,
    max_attempts: 1,
    base_backoff: Duration::from_secs(0),
    max_backoff: Duration::from_secs(0),
};

pub const WEBHOOK_DELIVERY: QueueConfig = QueueConfig {
    name: "webhook-delivery",
    concurrency: 10,
    max_attempts: 7,
    base_backoff: Duration::from_secs(2),
    max_backoff: Duration::from_secs(128),
};

pub const AI_INVESTIGATION: QueueConfig = QueueConfig {
    name: "ai-investigation",
    concurrency: 2,
    max_attempts: 3,
    base_backoff: Duration::from_secs(2),
    max_backoff: Duration::from_secs(8),
};

pub const DATA_RETENTION: QueueConfig = QueueConfig {
    name: "data-retention",
    concurrency: 1,
    max_attempts: 1,
    base_backoff: Duration::from_secs(0),
    max_backoff: Duration::from_secs(0),
};

/// Exponential backoff, doubling from `base_backoff` up to `max_backoff`.
pub fn backoff_for_attempt(config: &QueueConfig, attempt: u32) -> Duration {
    if config.base_backoff.is_zero() {
        return Duration::from_secs(0);
    }
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    let scaled = config.base_backoff.saturating_mul(factor);
    scaled.min(config.max_backoff)
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JobEnvelope<T> {
    pub job_id: String,
    pub attempt: u32,
    pub payload: T,
}

/// Redis-backed durable job queue. Pending work lives in a list (`FIFO`
/// pop via `BRPOP`); delayed retries live in a sorted set scored by the
/// unix timestamp they become eligible, moved back onto the list by
/// `promote_due`. `jobId`-keyed membership in a set prevents double
/// enqueue of the same logical job (§4.6 step 5, §5 "jobId-keyed dedup").
#[derive(Clone)]
pub struct JobQueue {
    client: redis::Client,
}

fn pending_key(queue: &str) -> String {
    format!("queue:{queue}:pending")
}

fn delayed_key(queue: &str) -> String {
    format!("queue:{queue}:delayed")
}

fn seen_key(queue: &str) -> String {
    format!("queue:{queue}:seen")
}

fn dlq_key(queue: &str) -> String {
    format!("queue:{queue}:dlq")
}

impl JobQueue {
    pub fn new(redis_url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::Internal(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }

    /// Enqueue a job, deduped by `job_id` within this queue. Returns
    /// `false` without re-enqueueing if the id was already seen — this is
    /// how retried webhook HTTP requests avoid double-processing (the raw
    /// log insert is the idempotency key).
    pub async fn enqueue<T: Serialize>(
        &self,
        config: &QueueConfig,
        job_id: &str,
        payload: &T,
    ) -> Result<bool, AppError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let added: bool = conn.sadd(seen_key(config.name), job_id).await?;
        if !added {
            return Ok(false);
        }

        let envelope = JobEnvelope { job_id: job_id.to_string(), attempt: 1, payload };
        let body = serde_json::to_string(&envelope)?;
        let _: () = conn.lpush(pending_key(config.name), body).await?;
        Ok(true)
    }

    /// Block (up to `timeout`) for the next job on this queue. Returns
    /// `None` on timeout so callers can check a shutdown signal between
    /// polls (P6).
    pub async fn dequeue<T: DeserializeOwned>(
        &self,
        config: &QueueConfig,
        timeout: Duration,
    ) -> Result<Option<JobEnvelope<T>>, AppError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: Option<(String, String)> =
            conn.brpop(pending_key(config.name), timeout.as_secs_f64()).await?;
        match result {
            Some((_, body)) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Schedule a retry after the attempt's backoff delay, or move to the
    /// DLQ and mark `dlq` in the caller's own log once attempts exhaust.
    pub async fn retry_or_dead_letter<T: Serialize>(
        &self,
        config: &QueueConfig,
        job_id: &str,
        attempt: u32,
        payload: &T,
    ) -> Result<RetryOutcome, AppError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        if attempt >= config.max_attempts {
            let envelope = JobEnvelope { job_id: job_id.to_string(), attempt, payload };
            let body = serde_json::to_string(&envelope)?;
            let _: () = conn.lpush(dlq_key(config.name), body).await?;
            return Ok(RetryOutcome::DeadLettered);
        }

        let delay = backoff_for_attempt(config, attempt);
        let fire_at = chrono::Utc::now().timestamp() + delay.as_secs() as i64;
        let envelope = JobEnvelope { job_id: job_id.to_string(), attempt: attempt + 1, payload };
        let body = serde_json::to_string(&envelope)?;
        let _: () = conn.zadd(delayed_key(config.name), body, fire_at).await?;
        Ok(RetryOutcome::Scheduled { retry_at_unix: fire_at })
    }

    /// Move any delayed jobs whose fire time has passed back onto the
    /// pending list. Intended to be polled periodically by a queue
    /// maintenance loop alongside the worker loops.
    pub async fn promote_due(&self, config: &QueueConfig) -> Result<usize, AppError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let now = chrono::Utc::now().timestamp();
        let due: Vec<String> = conn
            .zrangebyscore(delayed_key(config.name), i64::MIN, now)
            .await?;

        for body in &due {
            let _: () = conn.lpush(pending_key(config.name), body).await?;
            let _: () = conn.zrem(delayed_key(config.name), body).await?;
        }

        Ok(due.len())
    }

    /// Drop the dedup marker for a job id once it's finished, succeeded
    /// or dead-lettered, so a future distinct delivery with the same raw
    /// log could in principle be retried manually.
    pub async fn forget(&self, config: &QueueConfig, job_id: &str) -> Result<(), AppError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.srem(seen_key(config.name), job_id).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Scheduled { retry_at_unix: i64 },
    DeadLettered,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = WEBHOOK_DELIVERY;
        assert_eq!(backoff_for_attempt(&config, 1), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(&config, 2), Duration::from_secs(4));
        assert_eq!(backoff_for_attempt(&config, 3), Duration::from_secs(8));
        assert_eq!(backoff_for_attempt(&config, 8), Duration::from_secs(128));
        assert_eq!(backoff_for_attempt(&config, 20), Duration::from_secs(128));
    }

    #[test]
    fn webhook_processing_matches_spec_defaults() {
        assert_eq!(WEBHOOK_PROCESSING.concurrency, 5);
        assert_eq!(WEBHOOK_PROCESSING.max_attempts, 3);
        assert_eq!(WEBHOOK_PROCESSING.base_backoff, Duration::from_secs(2));
    }

    #[test]
    fn webhook_delivery_matches_spec_defaults() {
        assert_eq!(WEBHOOK_DELIVERY.concurrency, 10);
        assert_eq!(WEBHOOK_DELIVERY.max_attempts, 7);
    }

    #[tokio::test]
    #[ignore]
    async fn enqueue_dedupes_by_job_id() {
        let redis_url = std::env::var("REDIS_URL").expect("REDIS_URL must be set for this test");
        let queue = JobQueue::new(&redis_url).unwrap();
        let job_id = format!("webhook-{}", uuid::Uuid::new_v4());

        let first = queue.enqueue(&WEBHOOK_PROCESSING, &job_id, &serde_json::json!({"n": 1})).await.unwrap();
        let second = queue.enqueue(&WEBHOOK_PROCESSING, &job_id, &serde_json::json!({"n": 2})).await.unwrap();

        assert!(first);
        assert!(!second);
    }
}
