use redis::AsyncCommands;
use revback_core::error::AppError;

#[derive(Debug, Clone, Copy)]
pub struct TierLimit {
    pub max_requests: u32,
    pub window_secs: u64,
}

/// The three tiers named in §5. Limits are per-key (an org id, an org
/// slug, or a client IP depending on tier) over a rolling window
/// approximated by a fixed Redis window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitTier {
    Api,
    Webhook,
    Public,
}

impl RateLimitTier {
    pub fn limit(&self) -> TierLimit {
        match self {
            RateLimitTier::Api => TierLimit { max_requests: 100, window_secs: 60 },
            RateLimitTier::Webhook => TierLimit { max_requests: 500, window_secs: 60 },
            RateLimitTier::Public => TierLimit { max_requests: 30, window_secs: 60 },
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            RateLimitTier::Api => "ratelimit:api",
            RateLimitTier::Webhook => "ratelimit:webhook",
            RateLimitTier::Public => "ratelimit:public",
        }
    }
}

pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

/// Redis-backed fixed-window counter. State lives outside the process so
/// every worker/server instance enforces the same budget per §5 — no
/// in-memory cache that would need coordination across instances.
///
/// Storage failures fail open: a limiter outage must never become an
/// outage for webhook ingestion.
#[derive(Clone)]
pub struct RateLimiter {
    client: redis::Client,
}

impl RateLimiter {
    pub fn new(redis_url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::Internal(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }

    pub async fn check(&self, tier: RateLimitTier, key: &str) -> RateLimitDecision {
        let limit = tier.limit();
        match self.try_check(tier, key, limit).await {
            Ok(decision) => decision,
            Err(err) => {
                tracing::warn!(tier = ?tier, key, error = %err, "rate limiter unavailable, failing open");
                RateLimitDecision {
                    allowed: true,
                    remaining: limit.max_requests,
                    retry_after_secs: 0,
                }
            }
        }
    }

    async fn try_check(
        &self,
        tier: RateLimitTier,
        key: &str,
        limit: TierLimit,
    ) -> Result<RateLimitDecision, AppError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let redis_key = format!("{}:{}", tier.prefix(), key);

        let count: u64 = conn.incr(&redis_key, 1).await?;
        if count == 1 {
            let _: () = conn.expire(&redis_key, limit.window_secs as i64).await?;
        }

        if count > limit.max_requests as u64 {
            let ttl: i64 = conn.ttl(&redis_key).await.unwrap_or(limit.window_secs as i64);
            return Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: ttl.max(0) as u64,
            });
        }

        Ok(RateLimitDecision {
            allowed: true,
            remaining: limit.max_requests.saturating_sub(count as u32),
            retry_after_secs: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_limits_match_spec_table() {
        assert_eq!(RateLimitTier::Api.limit().max_requests, 100);
        assert_eq!(RateLimitTier::Webhook.limit().max_requests, 500);
        assert_eq!(RateLimitTier::Public.limit().max_requests, 30);
        assert_eq!(RateLimitTier::Api.limit().window_secs, 60);
    }

    #[tokio::test]
    #[ignore]
    async fn allows_then_blocks_after_threshold() {
        let redis_url = std::env::var("REDIS_URL").expect("REDIS_URL must be set for this test");
        let limiter = RateLimiter::new(&redis_url).unwrap();
        let key = format!("test-{}", uuid::Uuid::new_v4());

        for _ in 0..30 {
            let decision = limiter.check(RateLimitTier::Public, &key).await;
            assert!(decision.allowed);
        }

        let decision = limiter.check(RateLimitTier::Public, &key).await;
        assert!(!decision.allowed);
        assert!(decision.retry_after_secs > 0);
    }
}
