//! Far-tier backends.
//!
//! The far tier is the shared cache reachable by every proxy instance.  The
//! production backend is Redis via a [`fred`] connection pool; an in-memory
//! backend backs the test harness and far-tier-free deployments.  Every
//! Redis round-trip is bounded by a configurable deadline so a slow or
//! partitioned far tier degrades instead of stalling the request path.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use fred::clients::Pool;
use fred::interfaces::{ClientLike, KeysInterface, LuaInterface};
use fred::types::config::ReconnectPolicy;
use fred::types::{Expiration, SetOptions};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Connectivity classification reported by `GET /health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FarTierStatus {
    Ok,
    Degraded,
    Down,
}

/// Minimal key-value surface the store needs from the shared tier.
///
/// Values are UTF-8 strings (length-prefixed JSON frames for cache entries,
/// opaque owner tokens for locks).
#[async_trait]
pub trait FarTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// SET with expiry.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    /// SET-if-absent with expiry.  Returns `true` when the key was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;

    /// Delete `key` only if its current value equals `value`, atomically on
    /// the server side.  Returns `true` when the key was deleted.
    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool>;

    async fn status(&self) -> FarTierStatus;
}

// ---------------------------------------------------------------------------
// Redis backend
// ---------------------------------------------------------------------------

/// Compare-and-delete evaluated server-side so a lock can only be released
/// by the attempt that acquired it.
const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// How long startup waits for the first Redis connection before continuing
/// in degraded mode.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct RedisFarTier {
    pool: Pool,
    deadline: Duration,
}

impl RedisFarTier {
    /// Build the connection pool and attempt the initial connect.
    ///
    /// An unreachable Redis at startup is not fatal: the proxy comes up
    /// degraded (every far-tier call fails fast against the deadline) and a
    /// background task keeps retrying the connection.
    pub async fn connect(url: &str, pool_size: usize, deadline: Duration) -> Result<Self> {
        let config = fred::types::config::Config::from_url(url)
            .with_context(|| format!("invalid redis_url: {url}"))?;

        let mut builder = fred::types::Builder::from_config(config);
        builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

        let pool = builder
            .build_pool(pool_size)
            .context("failed to build Redis connection pool")?;

        match tokio::time::timeout(CONNECT_TIMEOUT, pool.init()).await {
            Ok(Ok(_)) => info!(pool_size, "Redis pool initialised"),
            Ok(Err(e)) => {
                warn!(error = %e, "Redis unavailable at startup, continuing degraded");
                spawn_reconnect(pool.clone());
            }
            Err(_) => {
                warn!("Redis connect timed out at startup, continuing degraded");
                spawn_reconnect(pool.clone());
            }
        }

        Ok(Self { pool, deadline })
    }

    /// Bound a far-tier round-trip by the configured deadline.
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, fred::error::Error>>,
    {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context(format!("Redis {op} failed"))),
            Err(_) => Err(anyhow::anyhow!(
                "Redis {op} exceeded {}ms deadline",
                self.deadline.as_millis()
            )),
        }
    }
}

fn spawn_reconnect(pool: Pool) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            match pool.init().await {
                Ok(_) => {
                    info!("Redis pool initialised after retry");
                    break;
                }
                Err(e) => debug!(error = %e, "Redis reconnect attempt failed"),
            }
        }
    });
}

#[async_trait]
impl FarTier for RedisFarTier {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.bounded("GET", self.pool.get(key)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let fut = self.pool.set(
            key,
            value,
            Some(Expiration::EX(ttl_secs as i64)),
            None,
            false,
        );
        self.bounded("SET", fut).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let fut = self.pool.set(
            key,
            value,
            Some(Expiration::EX(ttl_secs as i64)),
            Some(SetOptions::NX),
            false,
        );
        // SET ... NX returns "OK" when the key was set, nil otherwise.
        let result: Option<String> = self.bounded("SET NX", fut).await?;
        Ok(result.is_some())
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        let fut = self.pool.eval(
            RELEASE_SCRIPT,
            vec![key.to_string()],
            vec![value.to_string()],
        );
        let deleted: i64 = self.bounded("EVAL", fut).await?;
        Ok(deleted == 1)
    }

    async fn status(&self) -> FarTierStatus {
        match tokio::time::timeout(self.deadline, self.pool.ping::<String>(None)).await {
            Ok(Ok(_)) => FarTierStatus::Ok,
            Ok(Err(_)) => FarTierStatus::Down,
            Err(_) => FarTierStatus::Degraded,
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Process-local far tier with real expiry semantics.
///
/// Not shared across instances; used by the test harness and by deployments
/// that run without Redis.
#[derive(Default)]
pub struct MemoryFarTier {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryFarTier {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(entries: &mut HashMap<String, (String, Instant)>) {
        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
    }
}

#[async_trait]
impl FarTier for MemoryFarTier {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries);
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let expires = Instant::now() + Duration::from_secs(ttl_secs);
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries);
        if entries.contains_key(key) {
            return Ok(false);
        }
        let expires = Instant::now() + Duration::from_secs(ttl_secs);
        entries.insert(key.to_string(), (value.to_string(), expires));
        Ok(true)
    }

    async fn del_if_eq(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        Self::purge_expired(&mut entries);
        match entries.get(key) {
            Some((current, _)) if current == value => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn status(&self) -> FarTierStatus {
        FarTierStatus::Ok
    }
}
