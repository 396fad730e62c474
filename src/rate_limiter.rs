//! Component C: adaptive rate limiting driven by the LLM API's own
//! `x-ratelimit-*` response headers.
//!
//! A direct Rust port of `original_source/app/core/rate_limiter.py`'s
//! `DynamicRateLimiter`, restructured around a `tokio::sync::Mutex` instead
//! of Python's `asyncio.Lock`. Concurrency is surfaced as a safe-to-use
//! semaphore permit count rather than the raw ratio, and consumed by the
//! dispatch scheduler (`scheduler.rs`).

use std::time::{Duration, Instant};

use reqwest::header::HeaderMap;
use tokio::sync::Mutex;

use crate::{config::Config, prelude::*};

/// Thresholds and concurrency bounds, taken from `Config` at construction
/// time so unit tests can exercise narrower ranges cheaply.
#[derive(Debug, Clone, Copy)]
struct Thresholds {
    min_concurrency: usize,
    max_concurrency: usize,
    default_concurrency: usize,
    chars_per_token: u32,
    max_output_tokens_estimate: u32,
    safety_margin: f64,
}

/// Mutable rate-limit state, guarded by a single lock (mirrors the
/// original's single `asyncio.Lock` covering all fields).
#[derive(Debug, Default)]
struct State {
    token_limit: Option<u64>,
    remaining_tokens: Option<u64>,
    token_reset_at: Option<Instant>,
    request_limit: Option<u64>,
    remaining_requests: Option<u64>,
    request_reset_at: Option<Instant>,
    total_tokens_used: u64,
    total_requests_made: u64,
    paused: bool,
}

/// Adaptive rate limiter shared across every in-flight rule call.
pub struct RateLimiter {
    thresholds: Thresholds,
    state: Mutex<State>,
}

/// A snapshot of the limiter's internal counters, for observability
/// endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub token_limit: Option<u64>,
    pub remaining_tokens: Option<u64>,
    pub request_limit: Option<u64>,
    pub remaining_requests: Option<u64>,
    pub total_tokens_used: u64,
    pub total_requests_made: u64,
    pub safe_concurrency: usize,
    pub paused: bool,
}

impl RateLimiter {
    pub fn new(config: &Config) -> Self {
        Self {
            thresholds: Thresholds {
                min_concurrency: config.min_concurrency,
                max_concurrency: config.max_concurrency,
                default_concurrency: config.default_concurrency,
                chars_per_token: config.chars_per_token,
                max_output_tokens_estimate: config.max_output_tokens_estimate,
                safety_margin: config.safety_margin,
            },
            state: Mutex::new(State::default()),
        }
    }

    /// Estimate the number of tokens a call will consume: the rendered
    /// prompt's length in characters divided by `chars_per_token`, plus
    /// the worst-case completion length.
    pub fn estimate_tokens(&self, rendered_prompt: &str) -> u64 {
        let input_tokens = rendered_prompt.len() as u64 / self.thresholds.chars_per_token as u64;
        input_tokens + self.thresholds.max_output_tokens_estimate as u64
    }

    /// Block until there's enough budget left to spend `estimated_tokens`,
    /// following the original's "wait once, then optimistically reset"
    /// strategy: if we're under budget we sleep until the known reset
    /// time (plus one second of slack), then assume the budget has been
    /// fully replenished rather than waiting for a fresh header to
    /// confirm it.
    ///
    /// The pause threshold scales with the observed `token_limit`
    /// (`token_limit * safety_margin`), not a fixed constant — a tenant
    /// with a million-token budget needs a much larger cushion than one
    /// with a hundred.
    pub async fn wait_if_needed(&self, estimated_tokens: u64) {
        let wait_for = {
            let mut state = self.state.lock().await;
            let remaining = match state.remaining_tokens {
                Some(remaining) => remaining,
                None => return,
            };
            let min_threshold = match state.token_limit {
                Some(limit) => (limit as f64 * self.thresholds.safety_margin) as u64,
                None => 0,
            };
            if remaining >= min_threshold && remaining >= estimated_tokens {
                return;
            }
            state.paused = true;
            state.token_reset_at
        };

        let now = Instant::now();
        let sleep_for = match wait_for {
            Some(reset_at) if reset_at > now => reset_at - now + Duration::from_secs(1),
            _ => Duration::from_secs(60),
        };
        warn!(?sleep_for, "rate limit budget exhausted, pausing");
        tokio::time::sleep(sleep_for).await;

        let mut state = self.state.lock().await;
        if let Some(limit) = state.token_limit {
            state.remaining_tokens = Some(limit);
        }
        state.paused = false;
    }

    /// Update our view of the remaining budget from one LLM response:
    /// its rate-limit headers (if present) and the `total_tokens` it
    /// reported using. Called once per actual HTTP attempt — including
    /// ones a retry later discards — so `total_requests_made` and
    /// `total_tokens_used` reflect every call made, not just the one that
    /// finally succeeded. Missing headers are silently ignored rather
    /// than treated as an error, matching the original; `total_tokens` is
    /// `0` for a failed attempt, since no usage body was parsed.
    pub async fn update_from_headers(&self, headers: &HeaderMap, total_tokens: u32) {
        let mut state = self.state.lock().await;

        if let Some(token_limit) = header_u64(headers, "x-ratelimit-limit-tokens") {
            state.token_limit = Some(token_limit);
        }
        if let Some(remaining) = header_u64(headers, "x-ratelimit-remaining-tokens") {
            state.remaining_tokens = Some(remaining);
        }
        if let Some(request_limit) = header_u64(headers, "x-ratelimit-limit-requests") {
            state.request_limit = Some(request_limit);
        }
        if let Some(remaining) = header_u64(headers, "x-ratelimit-remaining-requests") {
            state.remaining_requests = Some(remaining);
        }
        if let Some(reset) = header_str(headers, "x-ratelimit-reset-tokens") {
            state.token_reset_at = Some(Instant::now() + parse_reset_time(reset));
        }
        if let Some(reset) = header_str(headers, "x-ratelimit-reset-requests") {
            state.request_reset_at = Some(Instant::now() + parse_reset_time(reset));
        }

        state.total_tokens_used += total_tokens as u64;
        state.total_requests_made += 1;
    }

    /// The concurrency level it's currently safe to run at, based on the
    /// fraction of token budget remaining, with an additional clamp when
    /// request budget (not just token budget) is running low.
    pub async fn get_safe_concurrency(&self) -> usize {
        let state = self.state.lock().await;
        self.safe_concurrency_for(&state)
    }

    fn safe_concurrency_for(&self, state: &State) -> usize {
        let t = &self.thresholds;
        let (Some(limit), Some(remaining)) = (state.token_limit, state.remaining_tokens) else {
            return t.default_concurrency;
        };
        if limit == 0 {
            return t.default_concurrency;
        }
        let ratio = remaining as f64 / limit as f64;

        let mut concurrency = if ratio > 0.50 {
            t.max_concurrency
        } else if ratio > 0.20 {
            let span = ratio_span(ratio, 0.20, 0.50);
            t.min_concurrency + (span * (t.max_concurrency - t.min_concurrency) as f64) as usize
        } else if ratio > 0.10 {
            t.min_concurrency
        } else {
            (t.min_concurrency / 2).max(1)
        };

        if let (Some(req_limit), Some(req_remaining)) =
            (state.request_limit, state.remaining_requests)
        {
            if req_limit > 0 && (req_remaining as f64 / req_limit as f64) < 0.10 {
                concurrency = concurrency.min(5);
            }
        }

        concurrency
    }

    /// A point-in-time snapshot for observability endpoints.
    pub async fn stats(&self) -> RateLimiterStats {
        let state = self.state.lock().await;
        RateLimiterStats {
            token_limit: state.token_limit,
            remaining_tokens: state.remaining_tokens,
            request_limit: state.request_limit,
            remaining_requests: state.remaining_requests,
            total_tokens_used: state.total_tokens_used,
            total_requests_made: state.total_requests_made,
            safe_concurrency: self.safe_concurrency_for(&state),
            paused: state.paused,
        }
    }
}

/// Interpolate `ratio`'s position between `lo` and `hi` into `[0.0, 1.0]`.
fn ratio_span(ratio: f64, lo: f64, hi: f64) -> f64 {
    (ratio - lo) / (hi - lo)
}

/// Parse a reset-time string like `"1h2m3s"` or `"750ms"` into a
/// [`Duration`], additively summing every unit suffix found. Returns 60
/// seconds for unparsable or all-zero input, matching the original's
/// fallback.
fn parse_reset_time(value: &str) -> Duration {
    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut saw_any_unit = false;

    for ch in value.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
            continue;
        }
        if let Ok(amount) = number.parse::<f64>() {
            let unit = match ch {
                'h' => Some(Duration::from_secs_f64(amount * 3600.0)),
                'm' => Some(Duration::from_secs_f64(amount * 60.0)),
                's' => Some(Duration::from_secs_f64(amount)),
                _ => None,
            };
            if let Some(unit) = unit {
                total += unit;
                saw_any_unit = true;
            }
        }
        number.clear();
    }

    if !saw_any_unit || total.is_zero() {
        Duration::from_secs(60)
    } else {
        total
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}
