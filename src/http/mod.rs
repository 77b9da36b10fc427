//! HTTP ingress for the caching proxy.
//!
//! Provides the axum-based server that routes operational endpoints,
//! forwards uncacheable traffic, and hands cacheable GETs to the pipeline.

pub mod handler;
