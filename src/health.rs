use serde::Serialize;

use crate::cache::far::FarTierStatus;
use crate::cache::store::TwoTierStore;

// ---------------------------------------------------------------------------
// Response type
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub far_tier: FarTierStatus,
}

// ---------------------------------------------------------------------------
// Check
// ---------------------------------------------------------------------------

/// Probe the far tier and report the proxy's health.
///
/// The proxy stays healthy (HTTP 200) even with the far tier down: caching
/// degrades to the near tier and direct forwarding, but requests are still
/// served.
pub async fn check(store: &TwoTierStore) -> HealthResponse {
    HealthResponse {
        status: "ok",
        far_tier: store.status().await,
    }
}
