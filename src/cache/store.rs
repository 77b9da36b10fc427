use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::entry::{decode_frame, encode_frame, CacheEntry};
use crate::cache::far::{FarTier, FarTierStatus};
use crate::cache::key::CacheKey;
use crate::cache::near::NearCache;
use crate::metrics::{CacheLayer, MetricsRegistry};

// ---------------------------------------------------------------------------
// Lookup result
// ---------------------------------------------------------------------------

/// Outcome of a store consultation.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// A fresh entry was found in either tier.
    Fresh(CacheEntry),
    /// Only the stale copy survives; the caller should refresh.
    Stale(CacheEntry),
    Miss,
}

// ---------------------------------------------------------------------------
// TwoTierStore
// ---------------------------------------------------------------------------

/// The two-tier cache store.
///
/// Reads consult the near tier first and fall back to the far tier,
/// re-populating the near tier on a far hit.  Writes land in both tiers
/// plus the companion stale key.  Far-tier failures never propagate: reads
/// degrade to [`Lookup::Miss`], writes are logged and swallowed, and lock
/// operations degrade to "not acquired".
pub struct TwoTierStore {
    near: NearCache,
    far: Arc<dyn FarTier>,
    stale_ttl_offset: u64,
    metrics: MetricsRegistry,
}

impl TwoTierStore {
    pub fn new(
        near: NearCache,
        far: Arc<dyn FarTier>,
        stale_ttl_offset: u64,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            near,
            far,
            stale_ttl_offset,
            metrics,
        }
    }

    /// Consult both tiers for `key` at time `now` (epoch seconds).
    pub async fn get(&self, key: &CacheKey, now: i64) -> Lookup {
        if let Some(entry) = self.near.get(key.as_str(), now) {
            self.metrics.hit(CacheLayer::L1);
            return Lookup::Fresh(entry);
        }
        self.metrics.miss(CacheLayer::L1);

        let raw = match self.far.get(key.as_str()).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "far-tier read failed, degrading to miss");
                self.metrics.far_tier_error("get");
                return Lookup::Miss;
            }
        };

        if let Some(raw) = raw {
            match decode_frame(&raw) {
                Some(entry) if entry.is_fresh(now) => {
                    self.near.insert(key.as_str(), entry.clone());
                    self.metrics.hit(CacheLayer::L2);
                    return Lookup::Fresh(entry);
                }
                Some(_) => {
                    // The far tier has not expired the key yet but the entry
                    // is past its freshness window; fall through to stale.
                }
                None => warn!(key = %key, "discarding corrupt far-tier frame"),
            }
        }

        match self.far.get(&key.stale()).await {
            Ok(Some(raw)) => {
                if let Some(entry) = decode_frame(&raw) {
                    self.metrics.miss(CacheLayer::L2);
                    return Lookup::Stale(entry);
                }
                warn!(key = %key, "discarding corrupt stale frame");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "stale read failed, degrading to miss");
                self.metrics.far_tier_error("get");
                return Lookup::Miss;
            }
        }

        self.metrics.miss(CacheLayer::L2);
        Lookup::Miss
    }

    /// Write `entry` to both tiers, plus the stale copy with TTL
    /// `ttl + stale_ttl_offset`.  Writes with a zero TTL are rejected so a
    /// fresh key can never be born expired.
    pub async fn set(&self, key: &CacheKey, entry: &CacheEntry) {
        if entry.ttl == 0 {
            warn!(key = %key, "rejecting cache write with non-positive TTL");
            return;
        }

        let frame = match encode_frame(entry) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to serialise cache entry");
                return;
            }
        };

        if let Err(e) = self.far.set_ex(key.as_str(), &frame, entry.ttl).await {
            warn!(key = %key, error = %e, "far-tier write failed, entry cached near-only");
            self.metrics.far_tier_error("set");
        }
        let stale_ttl = entry.ttl + self.stale_ttl_offset;
        if let Err(e) = self.far.set_ex(&key.stale(), &frame, stale_ttl).await {
            warn!(key = %key, error = %e, "stale write failed");
            self.metrics.far_tier_error("set");
        }

        self.near.insert(key.as_str(), entry.clone());
    }

    // -- coalescing locks ---------------------------------------------------

    /// Attempt a far-tier SET-if-absent on the lock key.  Failures degrade
    /// to "not acquired" so the caller takes the loser path.
    pub async fn acquire_lock(&self, key: &CacheKey, token: &str, lease_secs: u64) -> bool {
        match self.far.set_nx_ex(&key.lock(), token, lease_secs).await {
            Ok(true) => {
                self.metrics.metrics.lock_acquisitions.inc();
                debug!(key = %key, "coalescing lock acquired");
                true
            }
            Ok(false) => {
                self.metrics.metrics.lock_contended.inc();
                false
            }
            Err(e) => {
                warn!(key = %key, error = %e, "lock acquire failed, treating as not acquired");
                self.metrics.far_tier_error("lock");
                false
            }
        }
    }

    /// Release the lock only if it is still owned by `token`.
    pub async fn release_lock(&self, key: &CacheKey, token: &str) -> bool {
        match self.far.del_if_eq(&key.lock(), token).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(key = %key, "lock release: lease expired or owned by another attempt");
                false
            }
            Err(e) => {
                warn!(key = %key, error = %e, "lock release failed");
                self.metrics.far_tier_error("lock");
                false
            }
        }
    }

    // -- refresh marks ------------------------------------------------------

    /// Set-if-absent on the near-tier refresh mark for `key`.  Returns
    /// `true` when this caller owns scheduling the refresh.
    pub fn try_mark_refresh(&self, key: &CacheKey) -> bool {
        self.near.try_mark_refresh(&key.refresh())
    }

    pub fn clear_refresh(&self, key: &CacheKey) {
        self.near.clear_refresh(&key.refresh())
    }

    // -- health -------------------------------------------------------------

    pub async fn status(&self) -> FarTierStatus {
        self.far.status().await
    }
}
