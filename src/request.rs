//! The outbound request flowing through the middleware chain.
//!
//! A [`Request`] is moved from hook to hook. Hooks that want to change it
//! hand back a modified copy (`with_*` builders or [`Clone`]); nothing else
//! holds a mutable reference while the request is in flight.
//!
//! Every clone shares the same abandon flag with its original, so a retry or a
//! redirect produced from a request can be cancelled together with it. A
//! request built with [`Request::new`] starts a fresh flag.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde_json::Value;
use url::Url;

use crate::error::{Failure, SpiderError};

/// Open key/value store used for cross-middleware signalling.
pub type Meta = HashMap<String, Value>;

/// Callback invoked with a failure nobody in the chain handled.
pub type Errback = Arc<dyn Fn(&Failure) + Send + Sync>;

#[derive(Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Scheduling priority, higher runs sooner.
    pub priority: i32,
    pub meta: Meta,
    /// Skip duplicate and offsite filtering for this request.
    pub dont_filter: bool,
    errback: Option<Errback>,
    abandoned: Arc<AtomicBool>,
}

impl Request {
    /// Creates a `GET` request for `url`.
    pub fn new(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            priority: 0,
            meta: Meta::new(),
            dont_filter: false,
            errback: None,
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Parses `url` and creates a `GET` request for it.
    pub fn get(url: &str) -> Result<Self, SpiderError> {
        Ok(Self::new(Url::parse(url)?))
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = url;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dont_filter(mut self, dont_filter: bool) -> Self {
        self.dont_filter = dont_filter;
        self
    }

    /// Appends a header value, keeping existing values for the same name.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_errback<F>(mut self, errback: F) -> Self
    where
        F: Fn(&Failure) + Send + Sync + 'static,
    {
        self.errback = Some(Arc::new(errback));
        self
    }

    pub fn errback(&self) -> Option<&Errback> {
        self.errback.as_ref()
    }

    /// Returns `true` if `key` is present and truthy.
    pub fn meta_flag(&self, key: &str) -> bool {
        match self.meta.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Null) | None => false,
            Some(Value::Number(n)) => n.as_i64() != Some(0),
            Some(_) => true,
        }
    }

    pub fn meta_u64(&self, key: &str) -> Option<u64> {
        self.meta.get(key).and_then(Value::as_u64)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }

    /// Host component of the URL, lowercased by the URL parser.
    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    /// Marks this request, and every clone sharing its flag, as abandoned.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("priority", &self.priority)
            .field("meta", &self.meta)
            .field("dont_filter", &self.dont_filter)
            .field("errback", &self.errback.is_some())
            .finish()
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.method, self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_abandon_flag() {
        let original = Request::get("http://example.com/").unwrap();
        let retry = original.clone().with_priority(-1);
        let unrelated = Request::get("http://example.com/").unwrap();

        retry.abandon();

        assert!(original.is_abandoned());
        assert!(!unrelated.is_abandoned());
    }

    #[test]
    fn meta_flag_truthiness() {
        let request = Request::get("http://example.com/")
            .unwrap()
            .with_meta("on", true)
            .with_meta("zero", 0)
            .with_meta("one", 1)
            .with_meta("null", Value::Null);

        assert!(request.meta_flag("on"));
        assert!(request.meta_flag("one"));
        assert!(!request.meta_flag("zero"));
        assert!(!request.meta_flag("null"));
        assert!(!request.meta_flag("missing"));
    }
}
