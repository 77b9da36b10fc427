//! Shared harness for the integration suite: a scripted mock origin and a
//! fully wired proxy on an ephemeral port, backed by the in-memory far tier.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use relaycache::cache::far::{FarTier, FarTierStatus, MemoryFarTier};
use relaycache::cache::near::NearCache;
use relaycache::cache::store::TwoTierStore;
use relaycache::cache::ttl::TtlPolicy;
use relaycache::config::Config;
use relaycache::http::handler::create_router;
use relaycache::metrics::MetricsRegistry;
use relaycache::proxy::origin::{HttpOrigin, Origin};
use relaycache::proxy::refresh::{self, RefreshContext, RefreshScheduler};
use relaycache::AppState;

// ---------------------------------------------------------------------------
// Mock origin
// ---------------------------------------------------------------------------

/// A real HTTP origin on an ephemeral port that counts every fetch.
///
/// Path behaviours:
/// - `/static/*`  -> `image/png` bytes
/// - `/missing*`  -> 404 with a JSON body
/// - `/broken*`   -> declares JSON but the body does not parse
/// - anything else -> JSON `{path, serial}` where `serial` is the running
///   fetch count, so refreshed bodies are distinguishable
pub struct MockOrigin {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
struct MockState {
    hits: Arc<AtomicUsize>,
    delay: Duration,
}

impl MockOrigin {
    pub async fn start() -> Self {
        Self::start_with_delay(Duration::ZERO).await
    }

    /// Start an origin that sleeps `delay` before answering, for
    /// coalescing tests.
    pub async fn start_with_delay(delay: Duration) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new().fallback(mock_handler).with_state(MockState {
            hits: Arc::clone(&hits),
            delay,
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, hits, handle }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Number of requests the origin has served.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    /// Poll until the origin has served `expected` requests or the timeout
    /// elapses.
    pub async fn wait_for_hits(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.hits() >= expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.hits() >= expected
    }
}

impl Drop for MockOrigin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn mock_handler(State(state): State<MockState>, req: Request) -> Response {
    let serial = state.hits.fetch_add(1, Ordering::SeqCst) + 1;
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }

    let path = req.uri().path().to_string();
    if path.starts_with("/static/") {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/png")],
            &b"\x89PNG\r\n\x1a\n"[..],
        )
            .into_response();
    }
    if path.starts_with("/missing") {
        return (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "application/json")],
            json!({"error": "not found", "path": path}).to_string(),
        )
            .into_response();
    }
    if path.starts_with("/broken") {
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            "{\"unterminated\"",
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        json!({"path": path, "serial": serial}).to_string(),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Failing far tier
// ---------------------------------------------------------------------------

/// Far tier whose every call fails, modelling an unreachable Redis.
pub struct DownFarTier;

#[async_trait]
impl FarTier for DownFarTier {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        anyhow::bail!("far tier unreachable")
    }
    async fn set_ex(&self, _key: &str, _value: &str, _ttl_secs: u64) -> Result<()> {
        anyhow::bail!("far tier unreachable")
    }
    async fn set_nx_ex(&self, _key: &str, _value: &str, _ttl_secs: u64) -> Result<bool> {
        anyhow::bail!("far tier unreachable")
    }
    async fn del_if_eq(&self, _key: &str, _value: &str) -> Result<bool> {
        anyhow::bail!("far tier unreachable")
    }
    async fn status(&self) -> FarTierStatus {
        FarTierStatus::Down
    }
}

// ---------------------------------------------------------------------------
// Proxy under test
// ---------------------------------------------------------------------------

pub struct TestProxy {
    pub base_url: String,
    pub origin: MockOrigin,
    pub client: reqwest::Client,
    server: JoinHandle<()>,
}

impl TestProxy {
    /// Start a proxy in front of `origin` with an in-memory far tier.
    pub async fn start(origin: MockOrigin, configure: impl FnOnce(&mut Config)) -> Self {
        Self::start_with_far(origin, Arc::new(MemoryFarTier::new()), configure).await
    }

    pub async fn start_with_far(
        origin: MockOrigin,
        far: Arc<dyn FarTier>,
        configure: impl FnOnce(&mut Config),
    ) -> Self {
        let mut config = relaycache::config::load_config(None).unwrap();
        config.origin_url = origin.base_url();
        configure(&mut config);
        let config = Arc::new(config);

        let metrics = MetricsRegistry::new();
        let ttl_policy = Arc::new(TtlPolicy::from_config(&config).unwrap());
        let near = NearCache::new(
            config.l1_cache_maxsize,
            Duration::from_secs(config.refresh_mark_ttl_seconds),
        );
        let store = Arc::new(TwoTierStore::new(
            near,
            far,
            config.stale_ttl_offset,
            metrics.clone(),
        ));

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.origin_timeout_seconds))
            .build()
            .unwrap();
        let origin_client: Arc<dyn Origin> =
            Arc::new(HttpOrigin::new(http_client.clone(), &config.origin_url));

        let (scheduler, refresh_rx) =
            RefreshScheduler::new(config.refresh_queue_size, metrics.clone());
        tokio::spawn(refresh::run_worker(
            refresh_rx,
            RefreshContext {
                store: Arc::clone(&store),
                origin: Arc::clone(&origin_client),
                ttl_policy: Arc::clone(&ttl_policy),
                lock_lease_seconds: config.lock_lease_seconds,
                metrics: metrics.clone(),
            },
        ));

        let state = Arc::new(AppState {
            config,
            store,
            origin: origin_client,
            ttl_policy,
            scheduler,
            metrics,
            http_client: http_client.clone(),
        });

        let app = create_router(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            origin,
            client: http_client,
            server,
        }
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .unwrap()
    }

    pub async fn get_with_cache_control(&self, path: &str, value: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .header(header::CACHE_CONTROL, value)
            .send()
            .await
            .unwrap()
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Read the `X-Cache` header from a proxy response.
pub fn cache_status(response: &reqwest::Response) -> String {
    response
        .headers()
        .get("x-cache")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<missing>")
        .to_string()
}
