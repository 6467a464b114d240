use std::{str::FromStr, time::Duration};

use anyhow::{bail, Context};

use crate::connection::{Backoff, RetryPolicy};

#[derive(Clone, Debug)]
pub struct Config {
    pub ws_url: String,
    pub api_base_url: String,
    pub auth_token: Option<String>,
    pub retry: RetryPolicy,
    pub dedup_window: Duration,
    pub dedup_retention: Duration,
    pub dedup_sweep_interval: Duration,
    pub event_buffer: usize,
    pub refresh_concurrency: usize,
    pub gates: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:3000/api/v1/ws".into(),
            api_base_url: "http://localhost:3000/api/v1".into(),
            auth_token: None,
            retry: RetryPolicy::default(),
            dedup_window: Duration::from_millis(5_000),
            dedup_retention: Duration::from_millis(300_000),
            dedup_sweep_interval: Duration::from_millis(60_000),
            event_buffer: 64,
            refresh_concurrency: 4,
            gates: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let ws_url = std::env::var("PARKING_WS_URL").unwrap_or(defaults.ws_url);
        let api_base_url = std::env::var("PARKING_API_URL").unwrap_or(defaults.api_base_url);
        let auth_token = std::env::var("PARKING_AUTH_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        let max_attempts = parse_var("RECONNECT_MAX_ATTEMPTS", "5")?;
        let delay = Duration::from_millis(parse_var("RECONNECT_DELAY_MS", "3000")?);
        let backoff = match std::env::var("RECONNECT_BACKOFF")
            .unwrap_or_else(|_| "fixed".into())
            .as_str()
        {
            "fixed" => Backoff::Fixed,
            "exponential" => Backoff::Exponential {
                max_delay: Duration::from_millis(parse_var("RECONNECT_MAX_DELAY_MS", "30000")?),
            },
            other => bail!("RECONNECT_BACKOFF must be fixed or exponential, got {other}"),
        };
        if max_attempts == 0 {
            bail!("RECONNECT_MAX_ATTEMPTS must be at least 1");
        }

        let dedup_window = Duration::from_millis(parse_var("DEDUP_WINDOW_MS", "5000")?);
        let dedup_retention = Duration::from_millis(parse_var("DEDUP_RETENTION_MS", "300000")?);
        let dedup_sweep_interval =
            Duration::from_millis(parse_var("DEDUP_SWEEP_INTERVAL_MS", "60000")?);
        let event_buffer = parse_var("EVENT_BUFFER", "64")?;
        let refresh_concurrency = parse_var("REFRESH_CONCURRENCY", "4")?;

        let gates = std::env::var("PARKING_GATES")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|g| !g.is_empty())
            .map(String::from)
            .collect();

        Ok(Self {
            ws_url,
            api_base_url,
            auth_token,
            retry: RetryPolicy {
                max_attempts,
                delay,
                backoff,
            },
            dedup_window,
            dedup_retention,
            dedup_sweep_interval,
            event_buffer,
            refresh_concurrency,
            gates,
        })
    }
}

fn parse_var<T>(name: &str, default: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(name)
        .unwrap_or_else(|_| default.into())
        .parse()
        .with_context(|| format!("{name} must be a number"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_policy() {
        let config = Config::default();
        assert_eq!(config.ws_url, "ws://localhost:3000/api/v1/ws");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.delay, Duration::from_millis(3_000));
        assert_eq!(config.retry.backoff, Backoff::Fixed);
        assert_eq!(config.dedup_window, Duration::from_millis(5_000));
        assert_eq!(config.dedup_retention, Duration::from_millis(300_000));
        assert_eq!(config.dedup_sweep_interval, Duration::from_millis(60_000));
    }

    #[test]
    fn parse_var_falls_back_to_default() {
        let value: u64 = parse_var("PARKING_SYNC_TEST_UNSET_VAR", "42").unwrap();
        assert_eq!(value, 42);
    }
}
