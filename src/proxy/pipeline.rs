//! The cache-aware GET pipeline.
//!
//! Decision order: request directives, store lookup, fresh/stale serving,
//! then the coalesced miss path.  Concurrent misses on one key elect a
//! single winner through the far-tier lock; everyone else waits briefly for
//! the winner's write and falls back to a direct, uncached fetch when the
//! wait budget runs out.

use std::time::Duration;

use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::entry::CacheEntry;
use crate::cache::key::CacheKey;
use crate::cache::store::Lookup;
use crate::proxy::cache_control::CacheDirectives;
use crate::proxy::origin::OriginResponse;
use crate::proxy::refresh::RefreshJob;
use crate::AppState;

// ---------------------------------------------------------------------------
// Cache status
// ---------------------------------------------------------------------------

/// Response header carrying the cache consultation outcome.
pub const CACHE_STATUS_HEADER: &str = "x-cache";

/// Externally visible outcome of the cache consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Stale,
    Miss,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Stale => "STALE",
            CacheStatus::Miss => "MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

/// Sleep between loser re-reads of the store.
const LOSER_BACKOFF: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Serve a GET request through the cache.  The caller has already handled
/// the method gate, the skip list, and `no-store`.
pub async fn handle_get(
    state: &AppState,
    path: &str,
    query: Option<&str>,
    directives: CacheDirectives,
) -> Response {
    let key = CacheKey::from_request(path, query, state.config.cache_key_include_query);
    let path_query = match query.filter(|q| !q.is_empty()) {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    };

    // `no-cache` forces revalidation: the lookup is skipped but the fetch
    // result is still written back.
    if !directives.no_cache {
        if let Some(response) = lookup_and_serve(state, &key, path, &path_query, directives).await
        {
            return response;
        }
    }

    fetch_coalesced(state, &key, path, &path_query, directives).await
}

/// Consult the store and serve a fresh or stale hit.  Returns `None` on a
/// miss, or when a `max-age` bound disqualifies the entry.
async fn lookup_and_serve(
    state: &AppState,
    key: &CacheKey,
    path: &str,
    path_query: &str,
    directives: CacheDirectives,
) -> Option<Response> {
    let now = chrono::Utc::now().timestamp();
    match state.store.get(key, now).await {
        Lookup::Fresh(entry) => {
            if age_exceeded(&entry, directives, now) {
                return None;
            }
            Some(entry_response(&entry, CacheStatus::Hit))
        }
        Lookup::Stale(entry) => {
            if age_exceeded(&entry, directives, now) {
                return None;
            }
            schedule_refresh(state, key, path, path_query);
            Some(entry_response(&entry, CacheStatus::Stale))
        }
        Lookup::Miss => None,
    }
}

/// Request `max-age=N`: an entry older than N seconds is treated as a miss.
fn age_exceeded(entry: &CacheEntry, directives: CacheDirectives, now: i64) -> bool {
    directives.max_age.is_some_and(|limit| entry.age(now) > limit)
}

/// Mark the key refresh-pending and enqueue the background refresh.  The
/// set-if-absent mark ensures only one in-flight refresh per key.
fn schedule_refresh(state: &AppState, key: &CacheKey, path: &str, path_query: &str) {
    if state.store.try_mark_refresh(key) {
        state.scheduler.schedule(RefreshJob {
            key: key.clone(),
            path: path.to_string(),
            path_query: path_query.to_string(),
        });
    }
}

// ---------------------------------------------------------------------------
// Coalesced miss path
// ---------------------------------------------------------------------------

async fn fetch_coalesced(
    state: &AppState,
    key: &CacheKey,
    path: &str,
    path_query: &str,
    directives: CacheDirectives,
) -> Response {
    let token = Uuid::new_v4().to_string();
    // Lease outlives the origin deadline so the lock cannot lapse mid-fetch.
    let lease = state.config.origin_timeout_seconds + 1;

    if state.store.acquire_lock(key, &token, lease).await {
        let response = winner_fetch(state, key, path, path_query, directives).await;
        state.store.release_lock(key, &token).await;
        response
    } else {
        loser_wait(state, key, path, path_query, directives).await
    }
}

/// The winner re-checks the store (another winner may have written between
/// our miss and the lock grant), then fetches and stores.
async fn winner_fetch(
    state: &AppState,
    key: &CacheKey,
    path: &str,
    path_query: &str,
    directives: CacheDirectives,
) -> Response {
    if !directives.no_cache {
        if let Some(response) = lookup_and_serve(state, key, path, path_query, directives).await {
            return response;
        }
    }
    fetch_and_store(state, key, path, path_query, directives, true).await
}

/// Losers poll the store while the winner fetches.  After the wait budget
/// is spent they fetch the origin directly without writing, so the winner
/// remains the only writer for this key.
async fn loser_wait(
    state: &AppState,
    key: &CacheKey,
    path: &str,
    path_query: &str,
    directives: CacheDirectives,
) -> Response {
    let deadline =
        tokio::time::Instant::now() + Duration::from_millis(state.config.loser_max_wait_ms);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(LOSER_BACKOFF.min(remaining)).await;

        let now = chrono::Utc::now().timestamp();
        match state.store.get(key, now).await {
            Lookup::Fresh(entry) if !age_exceeded(&entry, directives, now) => {
                // Loser responses carry MISS: the entry exists only because
                // of the coalesced fetch this request took part in.
                return entry_response(&entry, CacheStatus::Miss);
            }
            Lookup::Stale(entry) if !age_exceeded(&entry, directives, now) => {
                schedule_refresh(state, key, path, path_query);
                return entry_response(&entry, CacheStatus::Stale);
            }
            _ => {}
        }
    }

    debug!(key = %key, "loser wait budget spent, fetching origin directly");
    fetch_and_store(state, key, path, path_query, directives, false).await
}

/// Fetch the origin and, when allowed and cacheable, write the entry.
///
/// Only JSON responses are cached; everything else passes through with its
/// original bytes.  The effective TTL is the policy TTL clamped by a
/// request `max-age` bound.
async fn fetch_and_store(
    state: &AppState,
    key: &CacheKey,
    path: &str,
    path_query: &str,
    directives: CacheDirectives,
    write_allowed: bool,
) -> Response {
    let response = match state.origin.fetch(path_query).await {
        Ok(response) => {
            state.metrics.metrics.origin_fetches.inc();
            response
        }
        Err(e) => {
            warn!(key = %key, error = %e, "origin fetch failed");
            state.metrics.origin_error(e.kind());
            return serve_stale_or_bad_gateway(state, key).await;
        }
    };

    if !response.is_json() {
        return passthrough_response(&response, CacheStatus::Miss);
    }

    let body = match response.decode_json() {
        Ok(body) => body,
        Err(e) => {
            debug!(key = %key, error = %e, "declared-JSON body failed to parse, passing through");
            state.metrics.origin_error(e.kind());
            return passthrough_response(&response, CacheStatus::Miss);
        }
    };

    let mut ttl = state
        .ttl_policy
        .ttl(path, response.status.as_u16(), &response.content_type);
    if let Some(limit) = directives.max_age {
        ttl = ttl.min(limit);
    }

    let entry = CacheEntry {
        content_type: response.content_type,
        status: response.status.as_u16(),
        body,
        stored_at: chrono::Utc::now().timestamp(),
        ttl,
    };

    if write_allowed && ttl > 0 {
        state.store.set(key, &entry).await;
    }

    entry_response(&entry, CacheStatus::Miss)
}

/// On origin failure, a surviving cached copy beats surfacing the error.
async fn serve_stale_or_bad_gateway(state: &AppState, key: &CacheKey) -> Response {
    let now = chrono::Utc::now().timestamp();
    match state.store.get(key, now).await {
        Lookup::Fresh(entry) => entry_response(&entry, CacheStatus::Hit),
        Lookup::Stale(entry) => entry_response(&entry, CacheStatus::Stale),
        Lookup::Miss => {
            let body = serde_json::json!({"error": "origin unreachable"}).to_string();
            (
                StatusCode::BAD_GATEWAY,
                [
                    (header::CONTENT_TYPE, "application/json".to_string()),
                    (
                        HeaderName::from_static(CACHE_STATUS_HEADER),
                        CacheStatus::Miss.as_str().to_string(),
                    ),
                ],
                body,
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Response emission
// ---------------------------------------------------------------------------

/// Serialise a cache entry as an HTTP response, preserving the origin
/// status and media type.
fn entry_response(entry: &CacheEntry, status: CacheStatus) -> Response {
    let body = match serde_json::to_vec(&entry.body) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "failed to re-encode cached body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    (
        StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK),
        [
            (header::CONTENT_TYPE, entry.content_type.clone()),
            (
                HeaderName::from_static(CACHE_STATUS_HEADER),
                status.as_str().to_string(),
            ),
        ],
        body,
    )
        .into_response()
}

/// Return the origin bytes untouched.
fn passthrough_response(response: &OriginResponse, status: CacheStatus) -> Response {
    (
        response.status,
        [
            (header::CONTENT_TYPE, response.content_type.clone()),
            (
                HeaderName::from_static(CACHE_STATUS_HEADER),
                status.as_str().to_string(),
            ),
        ],
        response.body.clone(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(stored_at: i64, ttl: u64) -> CacheEntry {
        CacheEntry {
            content_type: "application/json".to_string(),
            status: 200,
            body: json!({}),
            stored_at,
            ttl,
        }
    }

    #[test]
    fn max_age_bounds_served_age() {
        let directives = CacheDirectives {
            max_age: Some(10),
            ..Default::default()
        };
        assert!(!age_exceeded(&entry(100, 30), directives, 105));
        assert!(!age_exceeded(&entry(100, 30), directives, 110));
        assert!(age_exceeded(&entry(100, 30), directives, 111));
        // Without max-age nothing is disqualified.
        assert!(!age_exceeded(&entry(100, 30), CacheDirectives::default(), 500));
    }

    #[test]
    fn cache_status_labels() {
        assert_eq!(CacheStatus::Hit.as_str(), "HIT");
        assert_eq!(CacheStatus::Stale.as_str(), "STALE");
        assert_eq!(CacheStatus::Miss.as_str(), "MISS");
        assert_eq!(CacheStatus::Bypass.as_str(), "BYPASS");
    }
}
