use {
    anyhow::{Context, Result, bail},
    clap::Args,
    serde_json::Value,
    switchboard_config::SwitchboardConfig,
    switchboard_fetch::{FetchOptions, RequestGateway},
};

/// Attempt settings shared by `get` and `post`.
#[derive(Args)]
pub struct RequestArgs {
    /// Per-attempt deadline. Defaults to `fetch.timeout_ms`.
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// Extra attempts after a transient failure. Defaults to `fetch.retries`.
    #[arg(long)]
    pub retries: Option<u32>,
}

impl RequestArgs {
    fn options(&self, config: &SwitchboardConfig) -> FetchOptions {
        FetchOptions {
            timeout_ms: self.timeout_ms.unwrap_or(config.fetch.timeout_ms),
            retries: self.retries.unwrap_or(config.fetch.retries),
            ..Default::default()
        }
    }
}

fn gateway(config: &SwitchboardConfig) -> RequestGateway {
    let gateway = RequestGateway::new().with_health_check(
        config.upstream.health_path.clone(),
        config.fetch.health_timeout_ms,
    );
    match &config.upstream.base_url {
        Some(base) => gateway.with_base_url(base.clone()),
        None => gateway,
    }
}

/// Probe the upstream health endpoint and print the verdict.
pub async fn health(config: &SwitchboardConfig) -> Result<bool> {
    let Some(base) = config.upstream.base_url.as_deref() else {
        bail!("no upstream configured; pass --base-url or set upstream.base_url");
    };
    let healthy = gateway(config).is_service_healthy().await;
    if healthy {
        println!("{base}: healthy");
    } else {
        println!("{base}: unhealthy");
    }
    Ok(healthy)
}

pub async fn get(
    config: &SwitchboardConfig,
    urls: &[String],
    request: &RequestArgs,
    cache_ttl_ms: Option<u64>,
) -> Result<()> {
    let options = FetchOptions {
        cache_ttl_ms,
        ..request.options(config)
    };
    for value in fetch_all(&gateway(config), urls, &options).await? {
        print_json(&value)?;
    }
    Ok(())
}

/// Fetch `urls` in order through one gateway, so repeats can be served from
/// its response cache.
async fn fetch_all(
    gateway: &RequestGateway,
    urls: &[String],
    options: &FetchOptions,
) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(urls.len());
    for url in urls {
        let value = gateway
            .fetch_json(url, options)
            .await
            .with_context(|| format!("GET {url}"))?;
        values.push(value);
    }
    Ok(values)
}

pub async fn post(
    config: &SwitchboardConfig,
    url: &str,
    request: &RequestArgs,
    body: &str,
) -> Result<()> {
    let body: Value = serde_json::from_str(body).context("--body is not valid JSON")?;
    let value: Value = gateway(config)
        .post_json(url, &body, &request.options(config))
        .await
        .with_context(|| format!("POST {url}"))?;
    print_json(&value)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        axum::{Json, Router, extract::State, routing},
        serde_json::json,
        std::sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    async fn counting_backend() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/api/items",
                routing::get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    Json(json!({ "call": hits.fetch_add(1, Ordering::SeqCst) + 1 }))
                }),
            )
            .with_state(Arc::clone(&hits));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    #[tokio::test]
    async fn repeated_urls_hit_the_cache_when_ttl_set() {
        let (base, hits) = counting_backend().await;
        let gateway = RequestGateway::new().with_base_url(base);
        let urls = vec!["/api/items".to_string(), "/api/items".to_string()];

        let cached = FetchOptions {
            cache_ttl_ms: Some(60_000),
            ..Default::default()
        };
        let values = fetch_all(&gateway, &urls, &cached).await.unwrap();
        assert_eq!(values, [json!({ "call": 1 }), json!({ "call": 1 })]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        gateway.clear_response_cache(None);
        let values = fetch_all(&gateway, &urls, &FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(values, [json!({ "call": 2 }), json!({ "call": 3 })]);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
