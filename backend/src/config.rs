use std::time::Duration;

use anyhow::Context;

use crate::orgs::AuthoritySettings;
use crate::retry::RetryPolicy;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub listen_addr: String,
    pub cors_origins: Vec<String>,
    pub invitation_ttl_days: i64,
    pub store_retry_attempts: u32,
    pub store_retry_backoff_ms: u64,
}

/// Ten years; anything longer is a misconfiguration.
pub const MAX_INVITATION_TTL_DAYS: i64 = 3650;

fn var_or<T>(name: &str, default: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(name)
        .unwrap_or_else(|_| default.into())
        .parse()
        .with_context(|| format!("{} must be a number", name))
}

fn check_invitation_ttl_days(days: i64) -> anyhow::Result<()> {
    if !(1..=MAX_INVITATION_TTL_DAYS).contains(&days) {
        anyhow::bail!("INVITATION_TTL_DAYS must be between 1 and {}", MAX_INVITATION_TTL_DAYS);
    }
    Ok(())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        if jwt_secret.len() < 32 {
            anyhow::bail!("JWT_SECRET must be at least 32 characters for security");
        }
        if jwt_secret.contains("change_me") {
            anyhow::bail!("JWT_SECRET contains a placeholder value, set a real secret before running");
        }

        let invitation_ttl_days: i64 = var_or("INVITATION_TTL_DAYS", "7")?;
        check_invitation_ttl_days(invitation_ttl_days)?;
        let store_retry_attempts: u32 = var_or("STORE_RETRY_ATTEMPTS", "3")?;
        if store_retry_attempts < 1 {
            anyhow::bail!("STORE_RETRY_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            jwt_secret,
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:5173".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            invitation_ttl_days,
            store_retry_attempts,
            store_retry_backoff_ms: var_or("STORE_RETRY_BACKOFF_MS", "50")?,
        })
    }

    pub fn authority_settings(&self) -> AuthoritySettings {
        AuthoritySettings {
            invitation_ttl: time::Duration::days(self.invitation_ttl_days),
            retry: RetryPolicy {
                max_attempts: self.store_retry_attempts,
                base_delay: Duration::from_millis(self.store_retry_backoff_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_config() {
        let cfg = Config {
            database_url: "postgres://localhost/orgs".into(),
            jwt_secret: "x".repeat(32),
            listen_addr: "127.0.0.1:0".into(),
            cors_origins: vec![],
            invitation_ttl_days: 3,
            store_retry_attempts: 5,
            store_retry_backoff_ms: 10,
        };
        let settings = cfg.authority_settings();
        assert_eq!(settings.invitation_ttl, time::Duration::days(3));
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.base_delay, Duration::from_millis(10));
    }

    #[test]
    fn invitation_ttl_is_bounded() {
        assert!(check_invitation_ttl_days(1).is_ok());
        assert!(check_invitation_ttl_days(MAX_INVITATION_TTL_DAYS).is_ok());
        assert!(check_invitation_ttl_days(0).is_err());
        assert!(check_invitation_ttl_days(MAX_INVITATION_TTL_DAYS + 1).is_err());
        assert!(check_invitation_ttl_days(10_000_000).is_err());
    }
}
