//! Server side of the request-resilience layer.
//!
//! - [`rate_limit`]: per-session token buckets with a background idle sweep.
//! - [`request_log`]: per-endpoint count/error/latency accumulation.
//! - [`server`]: axum surface exposing health and stats, and a rate-limited
//!   send route that forwards to the upstream through a
//!   [`switchboard_fetch::RequestGateway`].

pub mod rate_limit;
pub mod request_log;
pub mod server;
pub mod state;

pub use {
    rate_limit::{RateLimitConfig, RateLimitError, RateLimiterStats, SessionRateLimiter},
    request_log::{EndpointStats, RequestLogger, RequestRecord},
    server::{build_gateway_app, start_gateway},
    state::GatewayState,
};
