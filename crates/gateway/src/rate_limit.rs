//! Per-session token bucket limiter.
//!
//! Buckets refill continuously: after `t` of inactivity a bucket has gained
//! `t / window * tokens_per_window` tokens, capped at `tokens_per_window`.
//! A background sweep drops buckets idle for ten windows.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use {
    dashmap::DashMap,
    serde::Serialize,
    tokio::time::Instant,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use switchboard_config::RateLimitSection;

/// Buckets idle for this many windows are swept.
pub const IDLE_WINDOWS_BEFORE_EVICTION: u32 = 10;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RateLimitError {
    #[error(
        "Rate limit exceeded for {key}: {available:.2} tokens available, {required} required"
    )]
    Exceeded {
        key: String,
        available: f64,
        required: f64,
    },

    #[error("Invalid cost {cost}: must be finite and non-negative")]
    InvalidCost { cost: f64 },

    #[error("Invalid rate limit config: {0}")]
    InvalidConfig(String),
}

/// Limiter settings, fixed for the lifetime of a limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitConfig {
    /// Bucket capacity and tokens regained per window.
    pub tokens_per_window: f64,
    #[serde(rename = "window_ms", serialize_with = "as_millis")]
    pub window: Duration,
    pub cost_per_request: f64,
    #[serde(rename = "cleanup_interval_ms", serialize_with = "as_millis")]
    pub cleanup_interval: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl RateLimitConfig {
    pub fn new(tokens_per_window: f64, window: Duration) -> Self {
        Self {
            tokens_per_window,
            window,
            cost_per_request: 1.0,
            cleanup_interval: Duration::from_secs(60),
        }
    }

    /// Settings a bucket can be refilled and swept with.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        let invalid = |msg: &str| Err(RateLimitError::InvalidConfig(msg.to_string()));
        if !self.tokens_per_window.is_finite() || self.tokens_per_window <= 0.0 {
            return invalid("tokens_per_window must be finite and positive");
        }
        if self.window.is_zero() {
            return invalid("window must be non-zero");
        }
        if !is_valid_cost(self.cost_per_request) {
            return invalid("cost_per_request must be finite and non-negative");
        }
        if self.cleanup_interval.is_zero() {
            return invalid("cleanup_interval must be non-zero");
        }
        Ok(())
    }
}

fn is_valid_cost(cost: f64) -> bool {
    cost.is_finite() && cost >= 0.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::from(&RateLimitSection::default())
    }
}

impl From<&RateLimitSection> for RateLimitConfig {
    fn from(section: &RateLimitSection) -> Self {
        Self {
            tokens_per_window: section.tokens_per_window,
            window: Duration::from_millis(section.window_ms),
            cost_per_request: section.cost_per_request,
            cleanup_interval: Duration::from_millis(section.cleanup_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Snapshot returned by [`SessionRateLimiter::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub session_count: usize,
    pub average_tokens_per_session: f64,
    pub config: RateLimitConfig,
}

type Buckets = DashMap<String, TokenBucket>;

/// Token bucket limiter keyed by session (or any caller-chosen key).
///
/// Must be created inside a tokio runtime for the cleanup sweep to run; call
/// [`Self::destroy`] (or drop the limiter) to stop it. Costs must be finite
/// and non-negative, so a bucket never holds more than `tokens_per_window`.
pub struct SessionRateLimiter {
    config: RateLimitConfig,
    buckets: Arc<Buckets>,
    cleanup: CancellationToken,
}

impl std::fmt::Debug for SessionRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRateLimiter")
            .field("config", &self.config)
            .field("sessions", &self.buckets.len())
            .finish()
    }
}

impl SessionRateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        config.validate()?;
        let buckets = Arc::new(Buckets::new());
        let cleanup = CancellationToken::new();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup_loop(
                    Arc::downgrade(&buckets),
                    config.window,
                    config.cleanup_interval,
                    cleanup.clone(),
                ));
            },
            Err(_) => warn!("no tokio runtime; rate limiter cleanup sweep disabled"),
        }

        Ok(Self {
            config,
            buckets,
            cleanup,
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Refill `key`'s bucket (creating it full on first touch) and run `f`
    /// on it while holding the entry lock.
    fn with_bucket<R>(&self, key: &str, f: impl FnOnce(&mut TokenBucket) -> R) -> R {
        let now = Instant::now();
        let capacity = self.config.tokens_per_window;
        let mut entry = self.buckets.entry(key.to_string()).or_insert(TokenBucket {
            tokens: capacity,
            last_refill: now,
        });
        let bucket = entry.value_mut();

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let gained = elapsed.as_secs_f64() / self.config.window.as_secs_f64() * capacity;
        bucket.tokens = (bucket.tokens + gained).min(capacity);
        bucket.last_refill = now;

        f(bucket)
    }

    /// Whether `cost` tokens (default: `cost_per_request`) are available.
    /// An invalid cost is never allowed.
    pub fn is_allowed(&self, key: &str, cost: Option<f64>) -> bool {
        let cost = cost.unwrap_or(self.config.cost_per_request);
        if !is_valid_cost(cost) {
            return false;
        }
        self.with_bucket(key, |bucket| bucket.tokens >= cost)
    }

    /// Take `cost` tokens and return what is left.
    pub fn consume(&self, key: &str, cost: Option<f64>) -> Result<f64, RateLimitError> {
        let cost = cost.unwrap_or(self.config.cost_per_request);
        if !is_valid_cost(cost) {
            return Err(RateLimitError::InvalidCost { cost });
        }
        self.with_bucket(key, |bucket| {
            if bucket.tokens < cost {
                debug!(key, available = bucket.tokens, required = cost, "rate limited");
                return Err(RateLimitError::Exceeded {
                    key: key.to_string(),
                    available: bucket.tokens,
                    required: cost,
                });
            }
            bucket.tokens -= cost;
            Ok(bucket.tokens)
        })
    }

    /// Whole tokens currently available to `key`.
    pub fn get_remaining(&self, key: &str) -> u64 {
        self.with_bucket(key, |bucket| bucket.tokens.floor().max(0.0) as u64)
    }

    /// Time until one window has passed since `key`'s last refill; zero for
    /// unknown keys.
    pub fn get_reset_time(&self, key: &str) -> Duration {
        let Some(bucket) = self.buckets.get(key) else {
            return Duration::ZERO;
        };
        (bucket.last_refill + self.config.window).saturating_duration_since(Instant::now())
    }

    pub fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }

    pub fn get_stats(&self) -> RateLimiterStats {
        let session_count = self.buckets.len();
        let total: f64 = self.buckets.iter().map(|b| b.tokens).sum();
        RateLimiterStats {
            session_count,
            average_tokens_per_session: if session_count == 0 {
                0.0
            } else {
                total / session_count as f64
            },
            config: self.config.clone(),
        }
    }

    /// Drop buckets idle for longer than ten windows. Returns how many went.
    pub fn sweep(&self) -> usize {
        sweep_idle(&self.buckets, self.config.window)
    }

    /// Stop the cleanup sweep. Buckets are kept.
    pub fn destroy(&self) {
        self.cleanup.cancel();
    }
}

impl Drop for SessionRateLimiter {
    fn drop(&mut self) {
        self.cleanup.cancel();
    }
}

fn sweep_idle(buckets: &Buckets, window: Duration) -> usize {
    let max_idle = window.saturating_mul(IDLE_WINDOWS_BEFORE_EVICTION);
    let now = Instant::now();
    let before = buckets.len();
    buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) <= max_idle);
    before.saturating_sub(buckets.len())
}

/// Holds only a weak reference so the sweep never keeps the buckets alive.
async fn cleanup_loop(
    buckets: Weak<Buckets>,
    window: Duration,
    every: Duration,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = interval.tick() => {},
        }
        let Some(buckets) = buckets.upgrade() else {
            break;
        };
        let evicted = sweep_idle(&buckets, window);
        if evicted > 0 {
            debug!(evicted, remaining = buckets.len(), "swept idle rate limit buckets");
        }
    }
    debug!("rate limiter cleanup stopped");
}
