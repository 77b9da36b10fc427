//! relaycache — a caching HTTP reverse proxy.
//!
//! For GET requests the proxy serves from a two-tier cache (in-process LRU
//! in front of a shared Redis tier) and falls back to the origin on a miss.
//! Concurrent misses on the same key are coalesced into a single origin
//! fetch, and expired entries are served stale while a background task
//! refreshes them.

pub mod cache;
pub mod config;
pub mod health;
pub mod http;
pub mod metrics;
pub mod proxy;

use std::sync::Arc;

use crate::cache::store::TwoTierStore;
use crate::cache::ttl::TtlPolicy;
use crate::config::Config;
use crate::metrics::MetricsRegistry;
use crate::proxy::origin::Origin;
use crate::proxy::refresh::RefreshScheduler;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<TwoTierStore>,
    pub origin: Arc<dyn Origin>,
    pub ttl_policy: Arc<TtlPolicy>,
    pub scheduler: RefreshScheduler,
    pub metrics: MetricsRegistry,
    /// Shared client for raw pass-through forwarding (non-GET, skip list).
    pub http_client: reqwest::Client,
}
