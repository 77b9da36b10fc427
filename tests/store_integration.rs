//! Two-tier store behaviour over real time and across instances sharing a
//! far tier.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use relaycache::cache::entry::CacheEntry;
use relaycache::cache::far::{FarTier, MemoryFarTier};
use relaycache::cache::key::CacheKey;
use relaycache::cache::near::NearCache;
use relaycache::cache::store::{Lookup, TwoTierStore};
use relaycache::metrics::MetricsRegistry;

fn store_over(far: Arc<dyn FarTier>) -> TwoTierStore {
    TwoTierStore::new(
        NearCache::new(64, Duration::from_secs(5)),
        far,
        10,
        MetricsRegistry::new(),
    )
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn entry(stored_at: i64, ttl: u64) -> CacheEntry {
    CacheEntry {
        content_type: "application/json".to_string(),
        status: 200,
        body: json!({"payload": [1, 2, 3], "label": "value"}),
        stored_at,
        ttl,
    }
}

#[tokio::test]
async fn stale_copy_outlives_fresh_copy() {
    let store = store_over(Arc::new(MemoryFarTier::new()));
    let key = CacheKey::from_request("/ttl", None, false);
    let t0 = now();
    store.set(&key, &entry(t0, 1)).await;

    assert!(matches!(store.get(&key, t0).await, Lookup::Fresh(_)));

    // Past the freshness window both physical far-tier keys decide: the
    // fresh key is gone, the stale key (ttl + offset) survives.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    match store.get(&key, now()).await {
        Lookup::Stale(e) => assert_eq!(e.stored_at, t0),
        other => panic!("expected stale, got {other:?}"),
    }
}

#[tokio::test]
async fn round_trip_preserves_structure() {
    let store = store_over(Arc::new(MemoryFarTier::new()));
    let key = CacheKey::from_request("/rt", None, false);
    let e = entry(now(), 30);
    store.set(&key, &e).await;
    match store.get(&key, now()).await {
        Lookup::Fresh(read) => {
            assert_eq!(read.body, e.body);
            assert_eq!(read.content_type, e.content_type);
            assert_eq!(read.status, e.status);
        }
        other => panic!("expected fresh, got {other:?}"),
    }
}

#[tokio::test]
async fn write_is_visible_to_a_second_instance() {
    let far: Arc<dyn FarTier> = Arc::new(MemoryFarTier::new());
    let writer = store_over(Arc::clone(&far));
    let reader = store_over(Arc::clone(&far));
    let key = CacheKey::from_request("/shared", None, false);

    writer.set(&key, &entry(now(), 30)).await;
    assert!(matches!(reader.get(&key, now()).await, Lookup::Fresh(_)));
}

#[tokio::test]
async fn lock_excludes_across_instances() {
    let far: Arc<dyn FarTier> = Arc::new(MemoryFarTier::new());
    let a = store_over(Arc::clone(&far));
    let b = store_over(Arc::clone(&far));
    let key = CacheKey::from_request("/locked", None, false);

    assert!(a.acquire_lock(&key, "token-a", 10).await);
    assert!(!b.acquire_lock(&key, "token-b", 10).await);

    // B cannot release A's lock.
    assert!(!b.release_lock(&key, "token-b").await);
    assert!(!b.acquire_lock(&key, "token-b", 10).await);

    assert!(a.release_lock(&key, "token-a").await);
    assert!(b.acquire_lock(&key, "token-b", 10).await);
}

#[tokio::test]
async fn lock_lease_expires() {
    let store = store_over(Arc::new(MemoryFarTier::new()));
    let key = CacheKey::from_request("/lease", None, false);

    assert!(store.acquire_lock(&key, "holder", 1).await);
    assert!(!store.acquire_lock(&key, "waiter", 1).await);

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    // The lease lapsed; a new attempt may take the lock.
    assert!(store.acquire_lock(&key, "waiter", 1).await);
}
