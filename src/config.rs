//! Configuration from environment variables.
//!
//! Every setting has a default so the broker starts with nothing but
//! `DATABASE_URL` and `JWT_SECRET_KEY` set. The env resolver is injected
//! for tests; the real constructor reads the process environment.

use anyhow::{bail, Result};

/// Default access token lifetime, seconds.
pub const DEFAULT_TOKEN_EXPIRE_SECONDS: u64 = 1800;
/// Default ceiling on any issued credential lifetime, seconds.
pub const DEFAULT_GLOBAL_MAX_LIFETIME_SECONDS: u64 = 86_400;
/// Default rate limit per window.
pub const DEFAULT_RATE_LIMIT: u32 = 100;
/// Default rate limit window, seconds.
pub const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 60;

/// Runtime configuration for the broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// SQLite database URL.
    pub database_url: String,
    /// Optional shared counter backend URL. When absent the rate limiter
    /// runs on its in-process store only.
    pub redis_url: Option<String>,
    /// Bootstrap signing key for bearer credentials.
    pub jwt_secret_key: String,
    /// Default credential lifetime when the caller does not request one.
    pub access_token_expire_seconds: u64,
    /// Hard ceiling on any issued credential lifetime.
    pub global_max_credential_lifetime_seconds: u64,
    /// Requests allowed per identity per window.
    pub rate_limit: u32,
    /// Rate limit window, seconds.
    pub rate_limit_window_seconds: u64,
    /// Socket address the HTTP server binds to.
    pub bind_addr: String,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl BrokerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_resolver(|key| std::env::var(key).ok())
    }

    /// Load configuration through an injected env resolver (for tests).
    pub fn from_resolver(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret_key = match env("JWT_SECRET_KEY") {
            Some(key) if !key.trim().is_empty() => key,
            _ => bail!("JWT_SECRET_KEY must be set"),
        };

        Ok(Self {
            database_url: env("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://toolbroker.db".to_owned()),
            redis_url: env("REDIS_URL").filter(|v| !v.trim().is_empty()),
            jwt_secret_key,
            access_token_expire_seconds: parse_or(
                env("ACCESS_TOKEN_EXPIRE_SECONDS"),
                "ACCESS_TOKEN_EXPIRE_SECONDS",
                DEFAULT_TOKEN_EXPIRE_SECONDS,
            ),
            global_max_credential_lifetime_seconds: parse_or(
                env("GLOBAL_MAX_CREDENTIAL_LIFETIME_SECONDS"),
                "GLOBAL_MAX_CREDENTIAL_LIFETIME_SECONDS",
                DEFAULT_GLOBAL_MAX_LIFETIME_SECONDS,
            ),
            rate_limit: parse_or(env("RATE_LIMIT"), "RATE_LIMIT", DEFAULT_RATE_LIMIT),
            rate_limit_window_seconds: parse_or(
                env("RATE_LIMIT_WINDOW_SECONDS"),
                "RATE_LIMIT_WINDOW_SECONDS",
                DEFAULT_RATE_LIMIT_WINDOW_SECONDS,
            ),
            bind_addr: env("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_owned()),
            log_level: env("LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
        })
    }
}

/// Parse an optional env value, warning and falling back on garbage.
fn parse_or<T: std::str::FromStr + Copy>(value: Option<String>, key: &str, default: T) -> T {
    match value {
        Some(raw) => match raw.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(var = key, value = %raw, "ignoring invalid env value");
                default
            }
        },
        None => default,
    }
}
