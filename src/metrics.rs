use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LayerLabels {
    pub layer: CacheLayer,
}

/// Which cache tier served (or missed) a lookup.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CacheLayer {
    L1,
    L2,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CacheStatusLabels {
    pub cache_status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorKindLabels {
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FarTierOpLabels {
    pub op: String,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the proxy.
pub struct Metrics {
    // -- cache --
    pub cache_hits: Family<LayerLabels, Counter>,
    pub cache_misses: Family<LayerLabels, Counter>,

    // -- requests --
    pub requests: Family<CacheStatusLabels, Counter>,
    pub request_latency_seconds: Histogram,

    // -- origin --
    pub origin_fetches: Counter,
    pub origin_errors: Family<ErrorKindLabels, Counter>,

    // -- far tier --
    pub far_tier_errors: Family<FarTierOpLabels, Counter>,

    // -- coalescing locks --
    pub lock_acquisitions: Counter,
    pub lock_contended: Counter,

    // -- background refresh --
    pub refresh_scheduled: Counter,
    pub refresh_dropped: Counter,
    pub refresh_failed: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let cache_hits = Family::<LayerLabels, Counter>::default();
        registry.register(
            "relaycache_cache_hits_total",
            "Cache hits by tier",
            cache_hits.clone(),
        );

        let cache_misses = Family::<LayerLabels, Counter>::default();
        registry.register(
            "relaycache_cache_misses_total",
            "Cache misses by tier",
            cache_misses.clone(),
        );

        let requests = Family::<CacheStatusLabels, Counter>::default();
        registry.register(
            "relaycache_requests_total",
            "Proxied requests by cache status",
            requests.clone(),
        );

        let request_latency_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 12));
        registry.register(
            "relaycache_request_latency_seconds",
            "Request latency in seconds",
            request_latency_seconds.clone(),
        );

        let origin_fetches = Counter::default();
        registry.register(
            "relaycache_origin_fetches_total",
            "Origin fetches issued",
            origin_fetches.clone(),
        );

        let origin_errors = Family::<ErrorKindLabels, Counter>::default();
        registry.register(
            "relaycache_origin_errors_total",
            "Origin fetch failures by kind",
            origin_errors.clone(),
        );

        let far_tier_errors = Family::<FarTierOpLabels, Counter>::default();
        registry.register(
            "relaycache_far_tier_errors_total",
            "Far-tier failures by operation",
            far_tier_errors.clone(),
        );

        let lock_acquisitions = Counter::default();
        registry.register(
            "relaycache_lock_acquisitions_total",
            "Coalescing lock acquisitions",
            lock_acquisitions.clone(),
        );

        let lock_contended = Counter::default();
        registry.register(
            "relaycache_lock_contended_total",
            "Coalescing lock attempts that lost the race",
            lock_contended.clone(),
        );

        let refresh_scheduled = Counter::default();
        registry.register(
            "relaycache_refresh_scheduled_total",
            "Background refresh tasks scheduled",
            refresh_scheduled.clone(),
        );

        let refresh_dropped = Counter::default();
        registry.register(
            "relaycache_refresh_dropped_total",
            "Background refresh tasks dropped on back-pressure",
            refresh_dropped.clone(),
        );

        let refresh_failed = Counter::default();
        registry.register(
            "relaycache_refresh_failed_total",
            "Background refresh tasks that failed",
            refresh_failed.clone(),
        );

        Self {
            cache_hits,
            cache_misses,
            requests,
            request_latency_seconds,
            origin_fetches,
            origin_errors,
            far_tier_errors,
            lock_acquisitions,
            lock_contended,
            refresh_scheduled,
            refresh_dropped,
            refresh_failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all proxy metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    pub fn hit(&self, layer: CacheLayer) {
        self.metrics
            .cache_hits
            .get_or_create(&LayerLabels { layer })
            .inc();
    }

    pub fn miss(&self, layer: CacheLayer) {
        self.metrics
            .cache_misses
            .get_or_create(&LayerLabels { layer })
            .inc();
    }

    pub fn origin_error(&self, kind: &str) {
        self.metrics
            .origin_errors
            .get_or_create(&ErrorKindLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    pub fn far_tier_error(&self, op: &str) {
        self.metrics
            .far_tier_errors
            .get_or_create(&FarTierOpLabels { op: op.to_string() })
            .inc();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
