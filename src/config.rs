//! Process-wide configuration, loaded once at startup from the environment.
//!
//! Every knob here is optional and has a default, following the thresholds
//! baked into the original Python rate limiter and retry handler. We read
//! `.env` via `dotenvy` first (see `main.rs`), then fall back to these
//! defaults.

use std::{env, time::Duration};

use crate::prelude::*;

/// Top-level process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Assumed worst-case completion tokens for a single rule call, used by
    /// the rate limiter's token estimator.
    pub max_output_tokens_estimate: u32,

    /// Characters-per-token used to estimate input token counts.
    pub chars_per_token: u32,

    /// Fraction of the token budget below which the limiter pauses.
    pub safety_margin: f64,

    /// Floor of the dynamic concurrency range.
    pub min_concurrency: usize,

    /// Ceiling of the dynamic concurrency range.
    pub max_concurrency: usize,

    /// Concurrency used before any rate-limit headers have been observed.
    pub default_concurrency: usize,

    /// Max retry attempts for a single LLM call.
    pub max_retries: u32,

    /// Base exponential-backoff delay.
    pub base_retry_delay: Duration,

    /// Cap on exponential-backoff delay.
    pub max_retry_delay: Duration,

    /// Upper bound of the additive retry jitter.
    pub jitter_range: Duration,

    /// Hard per-call timeout for a single LLM request.
    pub api_timeout: Duration,

    /// Total per-job deadline.
    pub request_timeout: Duration,

    /// Max total connections in the shared HTTP connection pool.
    pub max_connections: usize,

    /// Max idle keep-alive connections in the shared HTTP connection pool.
    pub max_keepalive_connections: usize,

    /// Default TTL for cached prompt entries. Zero disables caching.
    pub prompt_cache_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_output_tokens_estimate: 6_590,
            chars_per_token: 4,
            safety_margin: 0.10,
            min_concurrency: 10,
            max_concurrency: 200,
            default_concurrency: 50,
            max_retries: 3,
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(16),
            jitter_range: Duration::from_secs(1),
            api_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(600),
            max_connections: 200,
            max_keepalive_connections: 50,
            prompt_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Build a [`Config`] from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_output_tokens_estimate: env_u32(
                "MAX_OUTPUT_TOKENS",
                default.max_output_tokens_estimate,
            ),
            chars_per_token: env_u32("CHARS_PER_TOKEN", default.chars_per_token),
            safety_margin: env_f64("SAFETY_MARGIN", default.safety_margin),
            min_concurrency: env_usize("MIN_CONCURRENCY", default.min_concurrency),
            max_concurrency: env_usize("MAX_CONCURRENCY", default.max_concurrency),
            default_concurrency: env_usize(
                "DEFAULT_CONCURRENCY",
                default.default_concurrency,
            ),
            max_retries: env_u32("MAX_RETRIES", default.max_retries),
            base_retry_delay: env_secs_f64("BASE_RETRY_DELAY", default.base_retry_delay),
            max_retry_delay: env_secs_f64("MAX_RETRY_DELAY", default.max_retry_delay),
            jitter_range: env_secs_f64("JITTER_RANGE", default.jitter_range),
            api_timeout: env_secs_f64("API_TIMEOUT", default.api_timeout),
            request_timeout: env_secs_f64("REQUEST_TIMEOUT", default.request_timeout),
            max_connections: env_usize("MAX_CONNECTIONS", default.max_connections),
            max_keepalive_connections: env_usize(
                "MAX_KEEPALIVE_CONNECTIONS",
                default.max_keepalive_connections,
            ),
            prompt_cache_ttl: env_secs_f64(
                "PROMPT_CACHE_TTL_SECONDS",
                default.prompt_cache_ttl,
            ),
        }
    }

    /// Confirm required startup secrets are present. Returns a
    /// `StartupConfigError`-shaped error on failure (see `error.rs`).
    pub fn check_required_secrets(&self) -> Result<()> {
        if env::var("OPENAI_API_KEY").is_err() && env::var("LLM_API_KEY").is_err() {
            return Err(anyhow!(
                "missing required secret: set OPENAI_API_KEY or LLM_API_KEY"
            ));
        }
        Ok(())
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_secs_f64(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.min_concurrency, 10);
        assert_eq!(config.max_concurrency, 200);
        assert_eq!(config.default_concurrency, 50);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_retry_delay, Duration::from_secs(1));
        assert_eq!(config.max_retry_delay, Duration::from_secs(16));
    }
}
