use std::sync::Arc;

use {
    switchboard_config::SwitchboardConfig,
    switchboard_fetch::RequestGateway,
    tokio::time::Instant,
};

use crate::{
    rate_limit::{RateLimitConfig, SessionRateLimiter},
    request_log::RequestLogger,
};

/// Shared server state, wrapped in Arc for use across handlers.
pub struct GatewayState {
    /// Server version string.
    pub version: String,
    pub started_at: Instant,
    /// Token buckets for the session send endpoint.
    pub limiter: SessionRateLimiter,
    /// Per-endpoint telemetry fed by the logging middleware.
    pub requests: RequestLogger,
    /// Client for the backend; `None` when no upstream is configured.
    pub upstream: Option<RequestGateway>,
    /// Per-attempt deadline for forwarded sends.
    pub send_timeout_ms: u64,
}

impl GatewayState {
    pub fn new(
        limiter: SessionRateLimiter,
        upstream: Option<RequestGateway>,
        send_timeout_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Instant::now(),
            limiter,
            requests: RequestLogger::new(),
            upstream,
            send_timeout_ms,
        })
    }

    /// Build state from config. Must run inside a tokio runtime so the
    /// limiter's sweep starts.
    pub fn from_config(config: &SwitchboardConfig) -> anyhow::Result<Arc<Self>> {
        let limiter = SessionRateLimiter::new(RateLimitConfig::from(&config.rate_limit))?;
        let upstream = config.upstream.base_url.as_ref().map(|base| {
            RequestGateway::new()
                .with_base_url(base.clone())
                .with_health_check(
                    config.upstream.health_path.clone(),
                    config.fetch.health_timeout_ms,
                )
        });
        Ok(Self::new(limiter, upstream, config.fetch.timeout_ms))
    }

    /// Stop background work: the limiter sweep and any upstream attempts.
    pub fn shutdown(&self) {
        self.limiter.destroy();
        if let Some(upstream) = &self.upstream {
            upstream.shutdown();
        }
    }
}
