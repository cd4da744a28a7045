//! `Cache-Control` header parsing.

use std::collections::HashMap;

use http::HeaderMap;
use http::header::CACHE_CONTROL;

/// Directives of one or more `Cache-Control` headers.
///
/// Directive names are lowercased. Values keep their case with surrounding
/// quotes removed. Later occurrences of a directive win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    directives: HashMap<String, Option<String>>,
}

impl CacheControl {
    /// Parses a single header value such as `public, max-age=3600`.
    pub fn parse(header: &str) -> Self {
        let mut control = Self::default();
        control.extend(header);
        control
    }

    /// Parses every `Cache-Control` header in `headers`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut control = Self::default();
        for value in headers.get_all(CACHE_CONTROL) {
            if let Ok(value) = value.to_str() {
                control.extend(value);
            }
        }
        control
    }

    fn extend(&mut self, header: &str) {
        for directive in header.split(',') {
            let directive = directive.trim();
            if directive.is_empty() {
                continue;
            }
            let (name, value) = match directive.split_once('=') {
                Some((name, value)) => (name, Some(value.trim().trim_matches('"').to_string())),
                None => (directive, None),
            };
            self.directives
                .insert(name.trim().to_ascii_lowercase(), value);
        }
    }

    pub fn contains(&self, directive: &str) -> bool {
        self.directives.contains_key(directive)
    }

    /// Removes `directive`, returning whether it was present.
    pub fn remove(&mut self, directive: &str) -> bool {
        self.directives.remove(directive).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    pub fn no_store(&self) -> bool {
        self.contains("no-store")
    }

    pub fn no_cache(&self) -> bool {
        self.contains("no-cache")
    }

    pub fn must_revalidate(&self) -> bool {
        self.contains("must-revalidate")
    }

    /// `max-age` in seconds. Unparsable values count as zero.
    pub fn max_age(&self) -> Option<u64> {
        self.seconds("max-age")
    }

    /// `max-stale`: `Some(None)` for the bare directive, which accepts any
    /// staleness.
    pub fn max_stale(&self) -> Option<Option<u64>> {
        match self.directives.get("max-stale") {
            None => None,
            Some(None) => Some(None),
            Some(Some(value)) => Some(Some(value.parse().unwrap_or(0))),
        }
    }

    fn seconds(&self, directive: &str) -> Option<u64> {
        self.directives
            .get(directive)
            .map(|value| value.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn parses_flags_and_values() {
        let cc = CacheControl::parse("Public, MAX-AGE=\"3600\", must-revalidate, max-stale");
        assert!(cc.contains("public"));
        assert!(cc.must_revalidate());
        assert_eq!(cc.max_age(), Some(3600));
        assert_eq!(cc.max_stale(), Some(None));
        assert!(!cc.no_store());
    }

    #[test]
    fn merges_repeated_headers() {
        let mut headers = HeaderMap::new();
        headers.append(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.append(CACHE_CONTROL, HeaderValue::from_static("max-age=5, max-stale=30"));

        let cc = CacheControl::from_headers(&headers);
        assert!(cc.no_cache());
        assert_eq!(cc.max_age(), Some(5));
        assert_eq!(cc.max_stale(), Some(Some(30)));
    }

    #[test]
    fn garbage_max_age_counts_as_zero() {
        assert_eq!(CacheControl::parse("max-age=soon").max_age(), Some(0));
        assert_eq!(CacheControl::parse("private").max_age(), None);
    }
}
