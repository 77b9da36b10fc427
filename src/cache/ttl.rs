use std::collections::HashMap;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::Config;

// ---------------------------------------------------------------------------
// TtlPolicy
// ---------------------------------------------------------------------------

/// Computes the freshness lifetime for a cache entry.
///
/// Rule precedence, highest first: ordered path globs, exact status code,
/// media type (parameters stripped, case-insensitive), configured default.
/// A result of 0 means "do not cache".
pub struct TtlPolicy {
    path_rules: Vec<(Regex, u64)>,
    by_status: HashMap<u16, u64>,
    by_content_type: HashMap<String, u64>,
    default_ttl: u64,
}

impl TtlPolicy {
    /// Compile the configured rules.  Path globs become anchored regexes so
    /// matching is a single pass per rule at request time.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut path_rules = Vec::with_capacity(config.ttl_by_path_pattern.len());
        for rule in &config.ttl_by_path_pattern {
            let regex = glob_to_regex(&rule.pattern)
                .with_context(|| format!("invalid path pattern: {}", rule.pattern))?;
            path_rules.push((regex, rule.ttl));
        }

        let by_content_type = config
            .ttl_by_content_type
            .iter()
            .map(|(media, ttl)| (media.to_ascii_lowercase(), *ttl))
            .collect();

        Ok(Self {
            path_rules,
            by_status: config.ttl_by_status_code.clone(),
            by_content_type,
            default_ttl: config.cache_default_ttl,
        })
    }

    pub fn ttl(&self, path: &str, status: u16, content_type: &str) -> u64 {
        for (regex, ttl) in &self.path_rules {
            if regex.is_match(path) {
                return *ttl;
            }
        }

        if let Some(ttl) = self.by_status.get(&status) {
            return *ttl;
        }

        let media = media_type(content_type);
        if let Some(ttl) = self.by_content_type.get(&media) {
            return *ttl;
        }

        self.default_ttl
    }
}

/// Strip parameters (`; charset=...`) and lower-case the media type.
fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Convert a glob pattern into an anchored regex.  `*` matches any run of
/// characters (including `/`), `?` matches a single character; everything
/// else is literal.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            _ => regex.push_str(&regex::escape(&ch.to_string())),
        }
    }
    regex.push('$');
    Regex::new(&regex).map_err(Into::into)
}
