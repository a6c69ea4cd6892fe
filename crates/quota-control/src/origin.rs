//! Origin pattern matching for access keys.
//!
//! Patterns are either `*`, a host (`example.com`), a wildcard host
//! (`*.example.com`, any subdomain depth but not the apex), or any of those
//! with a scheme (`https://example.com`). Trailing slashes are ignored and
//! comparison is case-insensitive.

/// Returns true when `origin` matches any pattern. An empty list allows all.
pub fn matches_any(patterns: &[String], origin: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| matches(p, origin))
}

/// Match a single pattern against an origin.
pub fn matches(pattern: &str, origin: &str) -> bool {
    let pattern = normalize(pattern);
    if pattern == "*" {
        return true;
    }
    let origin = normalize(origin);

    let (pattern_scheme, pattern_host) = split_scheme(&pattern);
    let (origin_scheme, origin_host) = split_scheme(&origin);

    if let Some(scheme) = pattern_scheme {
        if origin_scheme != Some(scheme) {
            return false;
        }
    }

    match pattern_host.strip_prefix("*.") {
        Some(domain) => origin_host
            .strip_suffix(domain)
            .is_some_and(|sub| sub.len() > 1 && sub.ends_with('.')),
        None => pattern_host == origin_host,
    }
}

fn normalize(value: &str) -> String {
    value.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn split_scheme(value: &str) -> (Option<&str>, &str) {
    match value.split_once("://") {
        Some((scheme, host)) => (Some(scheme), host),
        None => (None, value),
    }
}
