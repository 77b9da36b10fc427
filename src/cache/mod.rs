//! Two-tier cache for the caching reverse proxy.
//!
//! The near tier is a bounded in-process LRU; the far tier is a shared
//! Redis-compatible store reached through the [`far::FarTier`] trait.  The
//! [`store::TwoTierStore`] combines both and layers the fresh/stale key
//! family, coalescing locks, and refresh marks on top.

pub mod entry;
pub mod far;
pub mod key;
pub mod near;
pub mod store;
pub mod ttl;

pub use entry::CacheEntry;
pub use key::CacheKey;
pub use store::{Lookup, TwoTierStore};
