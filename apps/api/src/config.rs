use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub remote_api_url: String,
    pub remote_email: Option<String>,
    pub remote_password: Option<String>,
    pub remote_token: Option<String>,
    pub remote_refresh_token: Option<String>,
    /// Session mirror backend; the in-memory store is used when unset.
    pub redis_url: Option<String>,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub snapshot_ttl: Duration,
    pub http_timeout: Duration,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let remote_api_url = optional("REMOTE_API_URL")
            .context("Required environment variable 'REMOTE_API_URL' is not set")?;

        Ok(Config {
            remote_api_url: remote_api_url.trim_end_matches('/').to_string(),
            remote_email: optional("REMOTE_API_EMAIL"),
            remote_password: optional("REMOTE_API_PASSWORD"),
            remote_token: optional("REMOTE_API_TOKEN"),
            remote_refresh_token: optional("REMOTE_API_REFRESH_TOKEN"),
            redis_url: optional("REDIS_URL"),
            poll_interval: Duration::from_millis(positive(&optional, "POLL_INTERVAL_MS", 2_000)?),
            poll_timeout: Duration::from_millis(positive(&optional, "POLL_TIMEOUT_MS", 300_000)?),
            snapshot_ttl: Duration::from_secs(positive(&optional, "SNAPSHOT_TTL_SECS", 60)?),
            http_timeout: Duration::from_secs(positive(&optional, "HTTP_TIMEOUT_SECS", 30)?),
            port: optional("PORT")
                .unwrap_or_else(|| "8080".to_string())
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: optional("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn positive(optional: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<u64> {
    let value = match optional(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{key} must be a non-negative integer"))?,
        None => default,
    };
    if value == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("REMOTE_API_URL", "https://hr.example.com/")]).unwrap();
        assert_eq!(config.remote_api_url, "https://hr.example.com");
        assert_eq!(config.poll_interval, Duration::from_millis(2_000));
        assert_eq!(config.poll_timeout, Duration::from_millis(300_000));
        assert_eq!(config.snapshot_ttl, Duration::from_secs(60));
        assert_eq!(config.port, 8080);
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_remote_url_is_required() {
        let err = load(&[]).unwrap_err();
        assert!(err.to_string().contains("REMOTE_API_URL"));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let err = load(&[("REMOTE_API_URL", "http://x"), ("POLL_INTERVAL_MS", "0")]).unwrap_err();
        assert!(err.to_string().contains("POLL_INTERVAL_MS"));
    }

    #[test]
    fn test_malformed_timeout_is_rejected() {
        let err = load(&[("REMOTE_API_URL", "http://x"), ("POLL_TIMEOUT_MS", "5m")]).unwrap_err();
        assert!(err.to_string().contains("POLL_TIMEOUT_MS"));
    }

    #[test]
    fn test_blank_values_count_as_unset() {
        let config = load(&[("REMOTE_API_URL", "http://x"), ("REDIS_URL", "  ")]).unwrap();
        assert!(config.redis_url.is_none());
    }
}
