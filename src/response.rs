//! The inbound response handed back through the middleware chain.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use url::Url;

use crate::request::Request;

/// Flag carried by responses served from the HTTP cache.
pub const FLAG_CACHED: &str = "cached";

#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// The request this response answers, attached by the dispatcher.
    pub request: Option<Arc<Request>>,
    pub flags: Vec<String>,
}

impl Response {
    pub fn new(url: Url, status: StatusCode) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            request: None,
            flags: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, name: http::header::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_request(mut self, request: Request) -> Self {
        self.request = Some(Arc::new(request));
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        let flag = flag.into();
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
        self
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Whether this response was served from the HTTP cache.
    pub fn is_cached(&self) -> bool {
        self.has_flag(FLAG_CACHED)
    }

    /// Header value as a string, if present and valid ASCII.
    pub fn header_str(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}
