use std::fmt;

// ---------------------------------------------------------------------------
// CacheKey
// ---------------------------------------------------------------------------

/// Canonical fingerprint of a cacheable request.
///
/// Keys are derived from the request path, plus a normalised query string
/// when enabled.  Equality is byte equality; the same fingerprint owns the
/// fresh, stale, and lock keys in the far tier and the refresh mark in the
/// near tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_request(path: &str, query: Option<&str>, include_query: bool) -> Self {
        let mut key = format!("cache:{path}");
        if include_query {
            if let Some(q) = query.filter(|q| !q.is_empty()) {
                key.push('?');
                key.push_str(&normalize_query(q));
            }
        }
        CacheKey(key)
    }

    /// The fresh far-tier key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The companion stale key, whose TTL outlives the fresh key.
    pub fn stale(&self) -> String {
        format!("stale:{}", self.0)
    }

    /// The coalescing-lock key.
    pub fn lock(&self) -> String {
        format!("lock:{}", self.0)
    }

    /// The near-tier refresh-pending mark.
    pub fn refresh(&self) -> String {
        format!("refresh:{}", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sort `k=v` pairs so that query-parameter order does not fragment the
/// keyspace.  Empty pairs (from `a=1&&b=2`) are dropped.
fn normalize_query(query: &str) -> String {
    let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    pairs.sort_unstable();
    pairs.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_only_key() {
        let key = CacheKey::from_request("/users/42", None, false);
        assert_eq!(key.as_str(), "cache:/users/42");
    }

    #[test]
    fn query_ignored_when_disabled() {
        let key = CacheKey::from_request("/users", Some("page=2"), false);
        assert_eq!(key.as_str(), "cache:/users");
    }

    #[test]
    fn query_normalised_when_enabled() {
        let a = CacheKey::from_request("/users", Some("b=2&a=1"), true);
        let b = CacheKey::from_request("/users", Some("a=1&b=2"), true);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "cache:/users?a=1&b=2");
    }

    #[test]
    fn empty_query_is_path_only() {
        let key = CacheKey::from_request("/users", Some(""), true);
        assert_eq!(key.as_str(), "cache:/users");
    }

    #[test]
    fn companion_keys_share_fingerprint() {
        let key = CacheKey::from_request("/a", None, false);
        assert_eq!(key.stale(), "stale:cache:/a");
        assert_eq!(key.lock(), "lock:cache:/a");
        assert_eq!(key.refresh(), "refresh:cache:/a");
    }
}
