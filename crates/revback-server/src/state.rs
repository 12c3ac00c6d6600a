use revback_core::config::AppConfig;
use revback_detect::DetectorRegistry;
use revback_providers::NormalizerRegistry;
use revback_queue::{CircuitBreakerRegistry, JobQueue, RateLimiter};
use sqlx::PgPool;
use std::sync::Arc;

/// Everything a route handler or worker loop needs, built once at boot and
/// handed down explicitly — mirrors the teacher's "no ambient singletons"
/// convention (`StripeWebhookState`/`PayPalState` in the reference handlers).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: PgPool,
    pub queue: Arc<JobQueue>,
    pub rate_limiter: Arc<RateLimiter>,
    pub circuit_breakers: Arc<CircuitBreakerRegistry>,
    pub normalizers: Arc<NormalizerRegistry>,
    pub detectors: Arc<DetectorRegistry>,
    pub http: reqwest::Client,
}

impl AppState {
    pub async fn build(config: AppConfig) -> Result<Self, revback_core::error::AppError> {
        let db = revback_core::repo::connect(&config.database_url).await?;
        let queue = JobQueue::new(&config.redis_url)?;
        let rate_limiter = RateLimiter::new(&config.redis_url)?;

        Ok(Self {
            config: Arc::new(config),
            db,
            queue: Arc::new(queue),
            rate_limiter: Arc::new(rate_limiter),
            circuit_breakers: Arc::new(CircuitBreakerRegistry::new()),
            normalizers: Arc::new(NormalizerRegistry::new()),
            detectors: Arc::new(DetectorRegistry::new()),
            http: reqwest::Client::new(),
        })
    }
}
