//! Request-resilience layer for calls from the dashboard to its backend.
//!
//! Every call goes through a [`RequestGateway`], which layers, outermost
//! first:
//! 1. a read-through JSON response cache (`cache_ttl_ms`),
//! 2. in-flight deduplication of identical GETs,
//! 3. an attempt loop with a fresh per-attempt deadline and exponential
//!    backoff between retries of transient failures.
//!
//! Both the cache and the dedup registry are keyed by [`cache_key`].

pub mod cache;
pub mod error;
pub mod gateway;
mod inflight;
pub mod key;
pub mod options;
pub mod retry;

pub use {
    cache::CacheStats,
    error::FetchError,
    gateway::RequestGateway,
    key::cache_key,
    options::{FetchOptions, FetchResponse, MultipartField, MultipartValue, RequestBody},
};

pub use reqwest::Method;
