//! Request fingerprints.
//!
//! A fingerprint identifies a request for caching and deduplication. It is
//! computed from the method, the canonical URL, the body and an optional set
//! of header names, and nothing else: priority, meta, `dont_filter` and the
//! errback never influence it.

use http::header::HeaderName;
use sha2::{Digest, Sha256};
use url::Url;
use url::form_urlencoded;

use crate::request::Request;

/// Computes request fingerprints.
#[derive(Debug, Clone, Default)]
pub struct Fingerprinter {
    include_headers: Vec<HeaderName>,
    keep_fragments: bool,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header names whose values become part of the fingerprint.
    pub fn include_headers(mut self, headers: impl IntoIterator<Item = HeaderName>) -> Self {
        self.include_headers = headers.into_iter().collect();
        self.include_headers.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        self.include_headers.dedup();
        self
    }

    /// Whether URL fragments distinguish requests. Off by default.
    pub fn keep_fragments(mut self, keep: bool) -> Self {
        self.keep_fragments = keep;
        self
    }

    pub fn fingerprint(&self, request: &Request) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.method.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(canonicalize_url(&request.url, self.keep_fragments).as_bytes());
        hasher.update([0]);
        hasher.update(&request.body);
        for name in &self.include_headers {
            hasher.update([0]);
            hasher.update(name.as_str().as_bytes());
            for value in request.headers.get_all(name) {
                hasher.update([b':']);
                hasher.update(value.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// Canonical URL form: query arguments sorted, fragment dropped unless kept.
///
/// Scheme and host are already lowercased by the URL parser, and default
/// ports are already elided.
pub fn canonicalize_url(url: &Url, keep_fragments: bool) -> String {
    let mut canonical = url.clone();
    if !keep_fragments {
        canonical.set_fragment(None);
    }
    if url.query().is_some() {
        let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        pairs.sort();
        if pairs.is_empty() {
            canonical.set_query(None);
        } else {
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            canonical.set_query(Some(&query));
        }
    }
    canonical.into()
}

impl Request {
    /// Fingerprint with the default [`Fingerprinter`].
    pub fn fingerprint(&self) -> String {
        Fingerprinter::default().fingerprint(self)
    }
}
