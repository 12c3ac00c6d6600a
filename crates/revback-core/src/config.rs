use crate::error::AppError;
use std::collections::HashMap;

/// Per-provider credentials read from the environment. Any of these may be
/// absent if the org onboards that provider through the (external) onboarding
/// flow instead; absence here is not fatal.
#[derive(Debug, Clone, Default)]
pub struct ProviderCredentials {
    pub webhook_secret: Option<String>,
    pub api_key: Option<String>,
}

/// Process-wide configuration, loaded once at boot and handed down
/// explicitly to every worker and route — no ambient singletons.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub api_key_salt: String,
    pub credential_encryption_key: [u8; 32],
    pub credential_encryption_key_previous: Option<[u8; 32]>,
    pub enable_scheduled_scans: bool,
    pub log_level: String,
    pub providers: HashMap<String, ProviderCredentials>,
}

const KNOWN_PROVIDERS: &[&str] = &["stripe", "apple", "google", "recurly"];

impl AppConfig {
    /// Load and validate configuration from the process environment. A
    /// missing or malformed required variable is a fatal config error: the
    /// caller is expected to log it and exit non-zero (§6 exit codes) before
    /// binding any socket or connection.
    pub fn from_env() -> Result<Self, AppError> {
        let database_url = require_env("DATABASE_URL")?;
        let redis_url = require_env("REDIS_URL")?;

        let jwt_secret = require_min_len("JWT_SECRET", 16)?;
        let api_key_salt = require_min_len("API_KEY_SALT", 16)?;

        let credential_encryption_key = require_hex32("CREDENTIAL_ENCRYPTION_KEY")?;
        let credential_encryption_key_previous =
            match std::env::var("CREDENTIAL_ENCRYPTION_KEY_PREVIOUS") {
                Ok(raw) if !raw.is_empty() => Some(parse_hex32("CREDENTIAL_ENCRYPTION_KEY_PREVIOUS", &raw)?),
                _ => None,
            };

        let enable_scheduled_scans = std::env::var("ENABLE_SCHEDULED_SCANS")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let mut providers = HashMap::new();
        for name in KNOWN_PROVIDERS {
            let webhook_secret = std::env::var(format!("{}_WEBHOOK_SECRET", name.to_uppercase()))
                .ok()
                .filter(|s| !s.is_empty());
            let api_key = std::env::var(format!("{}_API_KEY", name.to_uppercase()))
                .ok()
                .filter(|s| !s.is_empty());
            providers.insert(
                name.to_string(),
                ProviderCredentials {
                    webhook_secret,
                    api_key,
                },
            );
        }

        Ok(Self {
            database_url,
            redis_url,
            jwt_secret,
            api_key_salt,
            credential_encryption_key,
            credential_encryption_key_previous,
            enable_scheduled_scans,
            log_level,
            providers,
        })
    }
}

fn require_env(name: &str) -> Result<String, AppError> {
    std::env::var(name)
        .map_err(|_| AppError::Internal(format!("missing required env var {name}")))
}

fn require_min_len(name: &str, min_len: usize) -> Result<String, AppError> {
    let value = require_env(name)?;
    if value.len() < min_len {
        return Err(AppError::Internal(format!(
            "env var {name} must be at least {min_len} characters"
        )));
    }
    Ok(value)
}

fn require_hex32(name: &str) -> Result<[u8; 32], AppError> {
    let raw = require_env(name)?;
    parse_hex32(name, &raw)
}

fn parse_hex32(name: &str, raw: &str) -> Result<[u8; 32], AppError> {
    let bytes = hex::decode(raw)
        .map_err(|e| AppError::Internal(format!("env var {name} is not valid hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| AppError::Internal(format!("env var {name} must decode to 32 bytes")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn set_valid_env() {
        std::env::set_var("DATABASE_URL", "postgres://localhost/revback");
        std::env::set_var("REDIS_URL", "redis://localhost");
        std::env::set_var("JWT_SECRET", "0123456789abcdef");
        std::env::set_var("API_KEY_SALT", "fedcba9876543210");
        std::env::set_var(
            "CREDENTIAL_ENCRYPTION_KEY",
            "00".repeat(32),
        );
        std::env::remove_var("CREDENTIAL_ENCRYPTION_KEY_PREVIOUS");
    }

    #[test]
    fn loads_valid_config() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_valid_env();
        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.database_url, "postgres://localhost/revback");
        assert!(config.enable_scheduled_scans);
        assert_eq!(config.credential_encryption_key_previous, None);
    }

    #[test]
    fn rejects_short_secret() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_valid_env();
        std::env::set_var("JWT_SECRET", "short");
        let result = AppConfig::from_env();
        assert!(result.is_err());
        std::env::set_var("JWT_SECRET", "0123456789abcdef");
    }

    #[test]
    fn rejects_bad_hex_key() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_valid_env();
        std::env::set_var("CREDENTIAL_ENCRYPTION_KEY", "not-hex");
        let result = AppConfig::from_env();
        assert!(result.is_err());
        std::env::set_var("CREDENTIAL_ENCRYPTION_KEY", "00".repeat(32));
    }
}
