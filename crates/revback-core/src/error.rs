use thiserror::Error;

/// Process-wide error type. Every component returns this (or a narrower local
/// error that converts into it at the crate boundary) so the HTTP layer and
/// the queue substrate can make one consistent policy decision per §7.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("webhook signature verification failed")]
    SignatureVerification,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("circuit open for target '{target}'")]
    CircuitOpen { target: String },

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether a queue consumer should retry the job that produced this
    /// error, or move it straight to the dead-letter queue.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::TransientIo(_) | AppError::CircuitOpen { .. } | AppError::RateLimited { .. }
        )
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => AppError::NotFound("row not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(db_err.message().to_string())
            }
            other => AppError::TransientIo(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::TransientIo(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("serialization error: {err}"))
    }
}
