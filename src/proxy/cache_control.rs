use axum::http::HeaderMap;

// ---------------------------------------------------------------------------
// Request directives
// ---------------------------------------------------------------------------

/// Request-side `Cache-Control` directives the proxy honours.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheDirectives {
    /// Force revalidation: treat the lookup as a miss, still write back.
    pub no_cache: bool,
    /// Bypass the cache entirely (no read, no write).
    pub no_store: bool,
    /// Upper bound on served age in seconds; also clamps the write TTL.
    pub max_age: Option<u64>,
}

/// Parse the comma-separated directive list from every `Cache-Control`
/// request header.  Token names are case-insensitive, whitespace around
/// commas and `=` is tolerated, unknown tokens and malformed `max-age`
/// values are ignored.
pub fn parse_cache_control(headers: &HeaderMap) -> CacheDirectives {
    let mut directives = CacheDirectives::default();

    for value in headers.get_all(axum::http::header::CACHE_CONTROL) {
        let Ok(raw) = value.to_str() else {
            continue;
        };
        for token in raw.split(',') {
            let token = token.trim();
            if token.eq_ignore_ascii_case("no-cache") {
                directives.no_cache = true;
            } else if token.eq_ignore_ascii_case("no-store") {
                directives.no_store = true;
            } else if let Some((name, value)) = token.split_once('=') {
                if name.trim().eq_ignore_ascii_case("max-age") {
                    if let Ok(secs) = value.trim().parse::<u64>() {
                        directives.max_age = Some(secs);
                    }
                }
            }
        }
    }

    directives
}
