use std::{sync::Arc, time::Duration};

use {
    futures::FutureExt,
    reqwest::Method,
    serde::{Serialize, de::DeserializeOwned},
    serde_json::Value,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    cache::{CacheStats, ResponseCache},
    error::FetchError,
    inflight::InFlightRegistry,
    key::cache_key,
    options::{FetchOptions, FetchResponse, RequestBody},
    retry::AttemptPlan,
};

/// Default path probed by [`RequestGateway::is_service_healthy`].
pub const DEFAULT_HEALTH_PATH: &str = "/api/health";
/// Default per-attempt deadline for the health probe.
pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 3_000;

/// Client-side entry point for calls to the backend.
///
/// Cheap to clone; clones share the in-flight registry, the response cache and
/// the shutdown token.
#[derive(Clone)]
pub struct RequestGateway {
    client: reqwest::Client,
    base_url: Option<String>,
    health_path: String,
    health_timeout_ms: u64,
    inflight: Arc<InFlightRegistry>,
    cache: Arc<ResponseCache>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for RequestGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGateway")
            .field("base_url", &self.base_url)
            .field("health_path", &self.health_path)
            .field("in_flight", &self.inflight.len())
            .finish()
    }
}

impl Default for RequestGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestGateway {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: None,
            health_path: DEFAULT_HEALTH_PATH.into(),
            health_timeout_ms: DEFAULT_HEALTH_TIMEOUT_MS,
            inflight: Arc::new(InFlightRegistry::default()),
            cache: Arc::new(ResponseCache::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Resolve relative request paths against `url`.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_health_check(mut self, path: impl Into<String>, timeout_ms: u64) -> Self {
        self.health_path = path.into();
        self.health_timeout_ms = timeout_ms;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        match &self.base_url {
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                url.trim_start_matches('/')
            ),
            None => url.to_string(),
        }
    }

    fn plan(&self, url: &str, options: &FetchOptions) -> AttemptPlan {
        AttemptPlan {
            client: self.client.clone(),
            url: url.to_string(),
            target: self.resolve(url),
            method: options.method.clone(),
            headers: options.headers.clone(),
            body: options.body.clone(),
            timeout: Duration::from_millis(options.timeout_ms),
            retries: options.retries,
            shutdown: self.shutdown.clone(),
        }
    }

    /// Issue a request with a per-attempt deadline and retries for transient
    /// failures. Identical concurrent GETs share one underlying call unless
    /// `skip_dedup` is set.
    pub async fn fetch_with_timeout(
        &self,
        url: &str,
        options: &FetchOptions,
    ) -> Result<FetchResponse, FetchError> {
        if options.method == Method::GET && !options.skip_dedup {
            let key = cache_key(&options.method, url, options.body.as_ref());
            let (shared, joined) = self
                .inflight
                .join_or_start(key, || self.plan(url, options).run().boxed());
            if joined {
                debug!(url = %url, "joined in-flight request");
            }
            return shared.await;
        }
        self.plan(url, options).run().await
    }

    /// Fetch and decode JSON, with an optional read-through cache
    /// (`cache_ttl_ms`).
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        options: &FetchOptions,
    ) -> Result<T, FetchError> {
        let ttl = options
            .cache_ttl_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        let key = cache_key(&options.method, url, options.body.as_ref());

        if ttl.is_some()
            && !options.skip_cache
            && let Some(value) = self.cache.get(&key)
        {
            debug!(url = %url, "response cache hit");
            return decode(url, value);
        }

        let response = self.fetch_with_timeout(url, options).await?;
        let text = response.text();
        if text.is_empty() {
            return Err(FetchError::EmptyBody {
                url: url.to_string(),
            });
        }
        let value: Value = serde_json::from_str(&text).map_err(|e| FetchError::JsonParse {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        if let Some(ttl) = ttl {
            self.cache.insert(key, value.clone(), ttl);
        }
        decode(url, value)
    }

    /// POST `body` as JSON and decode the JSON reply.
    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        options: &FetchOptions,
    ) -> Result<T, FetchError> {
        let payload =
            serde_json::to_string(body).map_err(|e| FetchError::Request(e.to_string()))?;
        let mut options = options.clone();
        options.method = Method::POST;
        options.set_header("Content-Type", "application/json");
        options.body = Some(RequestBody::Text(payload));
        self.fetch_json(url, &options).await
    }

    /// True only when the health endpoint answers 2xx with
    /// `{"status": "healthy"}`. Never fails.
    pub async fn is_service_healthy(&self) -> bool {
        let options = FetchOptions {
            timeout_ms: self.health_timeout_ms,
            retries: 1,
            ..Default::default()
        };
        let response = match self.fetch_with_timeout(&self.health_path, &options).await {
            Ok(response) => response,
            Err(e) => {
                warn!(path = %self.health_path, error = %e, "health check failed");
                return false;
            },
        };
        match response.json::<Value>(&self.health_path) {
            Ok(body) => body.get("status").and_then(Value::as_str) == Some("healthy"),
            Err(e) => {
                warn!(path = %self.health_path, error = %e, "health check returned invalid body");
                false
            },
        }
    }

    /// Like [`Self::fetch_json`] but returns `fallback` on any failure.
    pub async fn fetch_with_fallback<T: DeserializeOwned>(
        &self,
        url: &str,
        fallback: T,
        options: &FetchOptions,
    ) -> T {
        match self.fetch_json(url, options).await {
            Ok(value) => value,
            Err(e) => {
                warn!(url = %url, error = %e, "fetch failed, using fallback");
                fallback
            },
        }
    }

    /// Forget in-flight entries (all, or keys containing `url`).
    pub fn clear_fetch_cache(&self, url: Option<&str>) {
        self.inflight.clear(url);
    }

    /// Number of requests currently in flight through the dedup registry.
    pub fn fetch_cache_size(&self) -> usize {
        self.inflight.len()
    }

    /// Drop cached responses (all, or keys containing `url`).
    pub fn clear_response_cache(&self, url: Option<&str>) {
        let removed = self.cache.clear(url);
        debug!(filter = ?url, removed, "cleared response cache");
    }

    pub fn response_cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Abort every running attempt and stop pending retries.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn decode<T: DeserializeOwned>(url: &str, value: Value) -> Result<T, FetchError> {
    serde_json::from_value(value).map_err(|e| FetchError::JsonParse {
        url: url.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_paths() {
        let gw = RequestGateway::new().with_base_url("http://backend:3000/");
        assert_eq!(gw.resolve("/api/agents"), "http://backend:3000/api/agents");
        assert_eq!(gw.resolve("api/agents"), "http://backend:3000/api/agents");
        assert_eq!(gw.resolve("https://other/x"), "https://other/x");
        assert_eq!(RequestGateway::new().resolve("/x"), "/x");
    }

    #[tokio::test]
    async fn relative_url_without_base_is_terminal() {
        let gw = RequestGateway::new();
        let opts = FetchOptions {
            retries: 3,
            ..Default::default()
        };
        let err = gw.fetch_with_timeout("/api/agents", &opts).await.unwrap_err();
        assert!(matches!(err, FetchError::Request(_)), "got {err:?}");
        assert_eq!(gw.fetch_cache_size(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_retries() {
        let gw = RequestGateway::new().with_base_url("http://127.0.0.1:9");
        gw.shutdown();
        let opts = FetchOptions {
            retries: 5,
            skip_dedup: true,
            ..Default::default()
        };
        let err = gw.fetch_with_timeout("/x", &opts).await.unwrap_err();
        match err {
            FetchError::Exhausted { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
