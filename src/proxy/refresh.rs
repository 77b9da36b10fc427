//! Background stale-while-revalidate refreshes.
//!
//! Stale hits enqueue a fire-and-forget refresh onto a bounded channel; a
//! single worker task drains it.  Scheduling never blocks the request path:
//! when the queue is full the job is dropped, which is safe because the
//! near-tier `refresh:{K}` mark expires and the next stale hit re-enters
//! the same path.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::entry::CacheEntry;
use crate::cache::key::CacheKey;
use crate::cache::store::TwoTierStore;
use crate::cache::ttl::TtlPolicy;
use crate::metrics::MetricsRegistry;
use crate::proxy::origin::Origin;

// ---------------------------------------------------------------------------
// Job and scheduler
// ---------------------------------------------------------------------------

/// One scheduled refresh of a stale cache key.
#[derive(Debug, Clone)]
pub struct RefreshJob {
    pub key: CacheKey,
    /// Request path, used by the TTL policy.
    pub path: String,
    /// Path plus original query string, used for the origin fetch.
    pub path_query: String,
}

/// Cheap handle for submitting refresh jobs from the request path.
#[derive(Clone)]
pub struct RefreshScheduler {
    tx: mpsc::Sender<RefreshJob>,
    metrics: MetricsRegistry,
}

impl RefreshScheduler {
    pub fn new(queue_size: usize, metrics: MetricsRegistry) -> (Self, mpsc::Receiver<RefreshJob>) {
        let (tx, rx) = mpsc::channel(queue_size);
        (Self { tx, metrics }, rx)
    }

    /// Submit a job without blocking.  Drops the job when the queue is full.
    pub fn schedule(&self, job: RefreshJob) {
        match self.tx.try_send(job) {
            Ok(()) => {
                self.metrics.metrics.refresh_scheduled.inc();
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(key = %job.key, "refresh queue full, dropping job");
                self.metrics.metrics.refresh_dropped.inc();
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!(key = %job.key, "refresh worker gone, dropping job");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Everything the refresh worker needs, threaded in explicitly so the
/// worker does not hold the full application state.
pub struct RefreshContext {
    pub store: Arc<TwoTierStore>,
    pub origin: Arc<dyn Origin>,
    pub ttl_policy: Arc<TtlPolicy>,
    pub lock_lease_seconds: u64,
    pub metrics: MetricsRegistry,
}

/// Drain refresh jobs until every sender is dropped.
pub async fn run_worker(mut rx: mpsc::Receiver<RefreshJob>, ctx: RefreshContext) {
    while let Some(job) = rx.recv().await {
        refresh_one(&ctx, &job).await;
    }
    debug!("refresh worker shutting down");
}

/// Refresh a single key: take the coalescing lock, re-fetch, store, and
/// always clear the refresh mark so the key can be scheduled again.
async fn refresh_one(ctx: &RefreshContext, job: &RefreshJob) {
    let token = Uuid::new_v4().to_string();

    if ctx
        .store
        .acquire_lock(&job.key, &token, ctx.lock_lease_seconds)
        .await
    {
        match ctx.origin.fetch(&job.path_query).await {
            Ok(response) if response.is_json() => match response.decode_json() {
                Ok(body) => {
                    let ttl =
                        ctx.ttl_policy
                            .ttl(&job.path, response.status.as_u16(), &response.content_type);
                    if ttl > 0 {
                        let entry = CacheEntry {
                            content_type: response.content_type,
                            status: response.status.as_u16(),
                            body,
                            stored_at: chrono::Utc::now().timestamp(),
                            ttl,
                        };
                        ctx.store.set(&job.key, &entry).await;
                        debug!(key = %job.key, ttl, "stale entry refreshed");
                    } else {
                        debug!(key = %job.key, "refresh fetched an uncacheable response");
                    }
                }
                Err(e) => {
                    warn!(key = %job.key, error = %e, "refresh response failed to decode");
                    ctx.metrics.metrics.refresh_failed.inc();
                }
            },
            Ok(response) => {
                debug!(
                    key = %job.key,
                    content_type = %response.content_type,
                    "refresh fetched non-JSON response, not cached"
                );
            }
            Err(e) => {
                // Log and drop; the next stale hit re-schedules.
                warn!(key = %job.key, error = %e, "background refresh failed");
                ctx.metrics.metrics.refresh_failed.inc();
                ctx.metrics.origin_error(e.kind());
            }
        }
        ctx.store.release_lock(&job.key, &token).await;
    } else {
        debug!(key = %job.key, "refresh lock busy, another worker is refreshing");
    }

    ctx.store.clear_refresh(&job.key);
}
