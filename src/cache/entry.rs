use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

/// A cached origin response.
///
/// Only JSON bodies are stored; non-JSON responses are passed through
/// uncached by the pipeline.  Freshness is derived from `stored_at + ttl`
/// rather than kept as a separate deadline so that the same entry can be
/// re-evaluated against any clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Media type captured verbatim from the origin response.
    pub content_type: String,
    /// HTTP status of the origin response.
    pub status: u16,
    /// Decoded JSON body.
    pub body: serde_json::Value,
    /// Wall-clock insertion time, epoch seconds.
    pub stored_at: i64,
    /// Freshness lifetime in seconds from `stored_at`.
    pub ttl: u64,
}

impl CacheEntry {
    pub fn expires_at(&self) -> i64 {
        self.stored_at + self.ttl as i64
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        now < self.expires_at()
    }

    /// Seconds elapsed since the entry was stored (never negative).
    pub fn age(&self, now: i64) -> u64 {
        (now - self.stored_at).max(0) as u64
    }
}

// ---------------------------------------------------------------------------
// Far-tier framing
// ---------------------------------------------------------------------------

/// Serialise an entry into the far-tier value frame: `{len}:{json}`.
///
/// The length prefix (in bytes of the JSON text) lets the reader detect
/// truncated or corrupted values and treat them as absent.
pub fn encode_frame(entry: &CacheEntry) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(entry)?;
    Ok(format!("{}:{}", json.len(), json))
}

/// Decode a far-tier value frame.  Returns `None` for frames whose length
/// prefix does not match the payload or whose payload is not a valid entry.
pub fn decode_frame(raw: &str) -> Option<CacheEntry> {
    let (len, json) = raw.split_once(':')?;
    let len: usize = len.parse().ok()?;
    if json.len() != len {
        return None;
    }
    serde_json::from_str(json).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(stored_at: i64, ttl: u64) -> CacheEntry {
        CacheEntry {
            content_type: "application/json".to_string(),
            status: 200,
            body: json!({"data": "value", "nested": [1, 2, 3]}),
            stored_at,
            ttl,
        }
    }

    #[test]
    fn freshness_is_strict() {
        let e = entry(100, 30);
        assert!(e.is_fresh(100));
        assert!(e.is_fresh(129));
        assert!(!e.is_fresh(130));
        assert!(!e.is_fresh(131));
    }

    #[test]
    fn age_never_negative() {
        let e = entry(100, 30);
        assert_eq!(e.age(105), 5);
        assert_eq!(e.age(99), 0);
    }

    #[test]
    fn frame_round_trip() {
        let e = entry(100, 30);
        let frame = encode_frame(&e).unwrap();
        assert_eq!(decode_frame(&frame), Some(e));
    }

    #[test]
    fn truncated_frame_rejected() {
        let e = entry(100, 30);
        let frame = encode_frame(&e).unwrap();
        assert_eq!(decode_frame(&frame[..frame.len() - 4]), None);
    }

    #[test]
    fn garbage_rejected() {
        assert_eq!(decode_frame("not a frame"), None);
        assert_eq!(decode_frame("12:{\"wrong\":1}"), None);
        assert_eq!(decode_frame(""), None);
    }
}
