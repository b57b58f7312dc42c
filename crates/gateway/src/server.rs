use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    axum::{
        Router,
        extract::{MatchedPath, Path, Request, State},
        http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header::RETRY_AFTER},
        middleware::{self, Next},
        response::{IntoResponse, Json, Response},
        routing::{get, post},
    },
    serde_json::{Value, json},
    switchboard_config::SwitchboardConfig,
    switchboard_fetch::FetchOptions,
    tokio::time::Instant,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{debug, info, warn},
};

use crate::{
    rate_limit::{RateLimitConfig, RateLimitError, SessionRateLimiter},
    request_log::RequestRecord,
    state::GatewayState,
};

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Error text a handler attaches to its response for the request log.
#[derive(Debug, Clone)]
struct LoggedError(String);

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            RETRY_AFTER,
            X_RATELIMIT_LIMIT,
            X_RATELIMIT_REMAINING,
            X_RATELIMIT_RESET,
        ]);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/sessions/{id}/send", post(send_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            log_requests,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Serve until Ctrl-C, then stop background work.
pub async fn start_gateway(config: &SwitchboardConfig) -> anyhow::Result<()> {
    let state = GatewayState::from_config(config)?;
    let app = build_gateway_app(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let rl = state.limiter.config();
    let lines = [
        format!("switchboard v{}", state.version),
        format!("listening on {addr}"),
        format!(
            "upstream: {}",
            config.upstream.base_url.as_deref().unwrap_or("none")
        ),
        format!(
            "sends: {} per {}ms per session",
            rl.tokens_per_window,
            rl.window.as_millis()
        ),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    if let Some(upstream) = state.upstream.clone() {
        tokio::spawn(async move {
            if upstream.is_service_healthy().await {
                info!("upstream is healthy");
            } else {
                warn!("upstream did not report healthy at startup");
            }
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
        })
        .await?;

    state.shutdown();
    Ok(())
}

// ── Middleware ───────────────────────────────────────────────────────────────

async fn log_requests(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or("unmatched", MatchedPath::as_str)
        .to_string();
    let endpoint = format!("{} {route}", request.method());
    let started = Instant::now();

    let response = next.run(request).await;

    let mut record = RequestRecord::new(
        endpoint,
        response.status().as_u16(),
        started.elapsed().as_millis() as u64,
    );
    if let Some(LoggedError(error)) = response.extensions().get::<LoggedError>() {
        record = record.with_error(error.clone());
    }
    state.requests.log(record);
    response
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": state.version,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

async fn stats_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let upstream = state.upstream.as_ref().map(|gw| {
        json!({
            "base_url": gw.base_url(),
            "in_flight": gw.fetch_cache_size(),
            "response_cache": gw.response_cache_stats(),
        })
    });
    Json(json!({
        "requests": state.requests.get_all_stats(),
        "rate_limit": state.limiter.get_stats(),
        "upstream": upstream,
    }))
}

async fn send_handler(
    State(state): State<Arc<GatewayState>>,
    Path(session_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let limiter = &state.limiter;
    if let Err(err) = limiter.consume(&session_id, None) {
        return rate_limited(limiter, &session_id, &err);
    }
    let headers = rate_limit_headers(limiter, &session_id);

    let Some(upstream) = &state.upstream else {
        return with_logged_error(
            (
                StatusCode::SERVICE_UNAVAILABLE,
                headers,
                Json(json!({ "error": "no upstream configured" })),
            ),
            "no upstream configured",
        );
    };

    let path = format!(
        "/api/sessions/{}/send",
        urlencoding::encode(&session_id)
    );
    let options = FetchOptions {
        timeout_ms: state.send_timeout_ms,
        retries: 0,
        ..Default::default()
    };
    match upstream.post_json::<Value, _>(&path, &body, &options).await {
        Ok(reply) => (StatusCode::OK, headers, Json(reply)).into_response(),
        Err(e) => {
            warn!(session = %session_id, error = %e, "forwarding send failed");
            let message = e.to_string();
            with_logged_error(
                (
                    StatusCode::BAD_GATEWAY,
                    headers,
                    Json(json!({ "error": message.clone(), "upstream_status": e.status() })),
                ),
                message,
            )
        },
    }
}

// ── Rate limit responses ─────────────────────────────────────────────────────

fn whole_seconds_ceil(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 { secs + 1 } else { secs }
}

fn header_value(n: impl ToString) -> HeaderValue {
    HeaderValue::from_str(&n.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn rate_limit_headers(limiter: &SessionRateLimiter, key: &str) -> HeaderMap {
    let config = limiter.config();
    let mut headers = HeaderMap::new();
    headers.insert(X_RATELIMIT_LIMIT, header_value(config.tokens_per_window));
    headers.insert(
        X_RATELIMIT_REMAINING,
        header_value(limiter.get_remaining(key)),
    );
    headers.insert(
        X_RATELIMIT_RESET,
        header_value(whole_seconds_ceil(limiter.get_reset_time(key))),
    );
    headers
}

/// Whole seconds until `required` tokens are back, at least one. Falls back
/// to a full window when the wait is not representable.
fn retry_after_secs(config: &RateLimitConfig, available: f64, required: f64) -> u64 {
    let deficit = (required - available).max(0.0);
    let secs = config.window.as_secs_f64() * deficit / config.tokens_per_window;
    let wait = Duration::try_from_secs_f64(secs).unwrap_or(config.window);
    whole_seconds_ceil(wait).max(1)
}

/// 429 with `Retry-After` set to when enough tokens will have refilled.
fn rate_limited(limiter: &SessionRateLimiter, key: &str, err: &RateLimitError) -> Response {
    let RateLimitError::Exceeded {
        available,
        required,
        ..
    } = err
    else {
        warn!(session = %key, error = %err, "rate limiter rejected request");
        return with_logged_error(
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            ),
            err.to_string(),
        );
    };
    let retry_after = retry_after_secs(limiter.config(), *available, *required);

    debug!(session = %key, retry_after, "send rate limited");
    #[cfg(feature = "metrics")]
    metrics::counter!("switchboard_rate_limited_total").increment(1);

    let mut headers = rate_limit_headers(limiter, key);
    headers.insert(RETRY_AFTER, header_value(retry_after));
    with_logged_error(
        (
            StatusCode::TOO_MANY_REQUESTS,
            headers,
            Json(json!({
                "error": err.to_string(),
                "retry_after_secs": retry_after,
            })),
        ),
        err.to_string(),
    )
}

fn with_logged_error(response: impl IntoResponse, error: impl Into<String>) -> Response {
    let mut response = response.into_response();
    response
        .extensions_mut()
        .insert(LoggedError(error.into()));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_seconds() {
        assert_eq!(whole_seconds_ceil(Duration::ZERO), 0);
        assert_eq!(whole_seconds_ceil(Duration::from_millis(1)), 1);
        assert_eq!(whole_seconds_ceil(Duration::from_millis(3_000)), 3);
        assert_eq!(whole_seconds_ceil(Duration::from_millis(3_001)), 4);
    }

    #[test]
    fn retry_after_tracks_deficit() {
        let config = RateLimitConfig::new(5.0, Duration::from_secs(60));
        assert_eq!(retry_after_secs(&config, 0.0, 1.0), 12);
        assert_eq!(retry_after_secs(&config, 0.9, 1.0), 2);
        assert_eq!(retry_after_secs(&config, 1.0, 1.0), 1);
    }

    #[test]
    fn retry_after_survives_unrepresentable_waits() {
        let config = RateLimitConfig::new(5.0, Duration::from_secs(60));
        assert_eq!(retry_after_secs(&config, 0.0, f64::INFINITY), 60);
        assert_eq!(retry_after_secs(&config, f64::NAN, 1.0), 1);

        let empty = RateLimitConfig::new(0.0, Duration::from_secs(60));
        assert_eq!(retry_after_secs(&empty, 0.0, 1.0), 60);
        assert_eq!(retry_after_secs(&empty, 0.0, 0.0), 60);
    }

    #[test]
    fn header_values_render_numbers() {
        assert_eq!(header_value(20.0_f64), "20");
        assert_eq!(header_value(7_u64), "7");
    }
}
