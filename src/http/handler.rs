//! Main axum router and HTTP request handlers for the caching proxy.
//!
//! Routes:
//! - `GET /health`  - health check (served locally, never proxied)
//! - `GET /metrics` - Prometheus metrics
//! - everything else - the caching pipeline for GETs, raw pass-through
//!   forwarding for all other methods and skip-listed paths

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tracing::{error, instrument, warn};

use crate::health;
use crate::metrics::CacheStatusLabels;
use crate::proxy::cache_control::parse_cache_control;
use crate::proxy::pipeline::{self, CacheStatus, CACHE_STATUS_HEADER};
use crate::AppState;

/// Upper bound on a buffered pass-through request body.
const FORWARD_BODY_LIMIT: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .fallback(handle_proxy)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Operational endpoints
// ---------------------------------------------------------------------------

/// `GET /health`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(health::check(&state.store).await))
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry) {
        Ok(()) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Proxy entry point
// ---------------------------------------------------------------------------

/// Fallback handler: every request that is not an operational endpoint.
#[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
async fn handle_proxy(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let started = Instant::now();

    let response = if req.method() != Method::GET {
        forward_request(&state, req, CacheStatus::Bypass).await
    } else if is_skip_path(&state, req.uri().path()) {
        forward_request(&state, req, CacheStatus::Bypass).await
    } else {
        let directives = parse_cache_control(req.headers());
        if directives.no_store {
            // `no-store`: no cache read, no cache write; to the client this
            // is an ordinary miss.
            forward_request(&state, req, CacheStatus::Miss).await
        } else {
            let path = req.uri().path().to_string();
            let query = req.uri().query().map(str::to_string);
            pipeline::handle_get(&state, &path, query.as_deref(), directives).await
        }
    };

    record_request_metrics(&state, &response, started);
    response
}

fn is_skip_path(state: &AppState, path: &str) -> bool {
    state.config.cache_skip_paths.iter().any(|skip| skip == path)
}

fn record_request_metrics(state: &AppState, response: &Response, started: Instant) {
    let cache_status = response
        .headers()
        .get(CACHE_STATUS_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("NONE")
        .to_string();
    state
        .metrics
        .metrics
        .requests
        .get_or_create(&CacheStatusLabels { cache_status })
        .inc();
    state
        .metrics
        .metrics
        .request_latency_seconds
        .observe(started.elapsed().as_secs_f64());
}

// ---------------------------------------------------------------------------
// Raw pass-through
// ---------------------------------------------------------------------------

/// Forward a request to the origin untouched and stream the response back,
/// tagging it with the given cache status.
async fn forward_request(state: &AppState, req: Request, status: CacheStatus) -> Response {
    let method = req.method().clone();
    let path_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let url = format!(
        "{}/{}",
        state.config.origin_url.trim_end_matches('/'),
        path_query.trim_start_matches('/')
    );

    let mut headers = req.headers().clone();
    // The origin sees its own host; hop-by-hop headers stay out.
    headers.remove(header::HOST);
    headers.remove(header::CONNECTION);

    let body = match axum::body::to_bytes(req.into_body(), FORWARD_BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "failed to buffer request body for forwarding");
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let upstream = state
        .http_client
        .request(method, url.clone())
        .headers(headers)
        .body(body)
        .send()
        .await;

    match upstream {
        Ok(upstream) => {
            let mut builder = Response::builder().status(upstream.status());
            if let Some(response_headers) = builder.headers_mut() {
                for (name, value) in upstream.headers() {
                    if name != header::TRANSFER_ENCODING && name != header::CONNECTION {
                        response_headers.insert(name.clone(), value.clone());
                    }
                }
                response_headers.insert(
                    HeaderName::from_static(CACHE_STATUS_HEADER),
                    HeaderValue::from_static(status.as_str()),
                );
            }
            match builder.body(Body::from_stream(upstream.bytes_stream())) {
                Ok(response) => response,
                Err(e) => {
                    error!(error = %e, "failed to assemble forwarded response");
                    StatusCode::BAD_GATEWAY.into_response()
                }
            }
        }
        Err(e) => {
            warn!(%url, error = %e, "pass-through forward failed");
            (
                StatusCode::BAD_GATEWAY,
                [(
                    HeaderName::from_static(CACHE_STATUS_HEADER),
                    HeaderValue::from_static(status.as_str()),
                )],
                "origin unreachable",
            )
                .into_response()
        }
    }
}
