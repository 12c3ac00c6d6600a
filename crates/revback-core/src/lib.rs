pub mod config;
pub mod crypto;
pub mod error;
pub mod models;
pub mod repo;

pub use config::AppConfig;
pub use error::AppError;

/// Initialize the global tracing subscriber from `RUST_LOG` (falling back to
/// `config.log_level`). Call once at process start, before any other module
/// logs.
pub fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
