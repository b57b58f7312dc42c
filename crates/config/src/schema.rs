//! Config schema: server bind, upstream target, fetch defaults, rate limits.

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub fetch: FetchConfig,
    pub rate_limit: RateLimitSection,
}

/// Where the stats/send surface listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 18790,
        }
    }
}

/// Backend the request gateway talks to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL relative request paths are joined onto. `None` disables
    /// forwarding from the server surface.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Path probed by the health check.
    pub health_path: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            health_path: "/api/health".into(),
        }
    }
}

/// Defaults applied to every fetch unless a call overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-attempt deadline.
    pub timeout_ms: u64,
    /// Additional attempts beyond the first.
    pub retries: u32,
    /// Deadline used by the health probe.
    pub health_timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retries: 1,
            health_timeout_ms: 3_000,
        }
    }
}

/// Token bucket settings for the session send endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub tokens_per_window: f64,
    pub window_ms: u64,
    pub cost_per_request: f64,
    pub cleanup_interval_ms: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            tokens_per_window: 20.0,
            window_ms: 60_000,
            cost_per_request: 1.0,
            cleanup_interval_ms: 60_000,
        }
    }
}

impl SwitchboardConfig {
    /// Reject settings the runtime cannot operate with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let rl = &self.rate_limit;
        if !rl.tokens_per_window.is_finite() || rl.tokens_per_window <= 0.0 {
            anyhow::bail!("rate_limit.tokens_per_window must be finite and positive");
        }
        if rl.window_ms == 0 {
            anyhow::bail!("rate_limit.window_ms must be positive");
        }
        if !rl.cost_per_request.is_finite() || rl.cost_per_request < 0.0 {
            anyhow::bail!("rate_limit.cost_per_request must be finite and non-negative");
        }
        if rl.cleanup_interval_ms == 0 {
            anyhow::bail!("rate_limit.cleanup_interval_ms must be positive");
        }
        if self.fetch.timeout_ms == 0 {
            anyhow::bail!("fetch.timeout_ms must be positive");
        }
        if let Some(url) = &self.upstream.base_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            anyhow::bail!("upstream.base_url must be an http(s) URL, got {url}");
        }
        Ok(())
    }
}
