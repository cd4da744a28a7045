//! Session cookies.
//!
//! This middleware keeps cookies across requests to simulate a browser-like
//! session. Requests are grouped into jars by the `cookiejar` meta key, so a
//! crawl can keep several independent sessions against the same site.

use std::sync::Arc;

use async_trait::async_trait;
use cookie::Cookie;
use cookie_store::CookieStore;
use dashmap::DashMap;
use http::HeaderValue;
use http::header::{COOKIE, SET_COOKIE};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::SpiderError;
use crate::middleware::{Middleware, RequestAction, ResponseAction};
use crate::request::Request;
use crate::response::Response;

/// Meta key selecting the cookie jar of a request.
pub const COOKIEJAR: &str = "cookiejar";
/// Meta key keeping a request out of the cookie jars entirely.
pub const DONT_MERGE_COOKIES: &str = "dont_merge_cookies";

const DEFAULT_JAR: &str = "default";

/// Stores `Set-Cookie` values and replays them as `Cookie` headers.
pub struct CookieMiddleware {
    jars: DashMap<String, Arc<Mutex<CookieStore>>>,
}

impl CookieMiddleware {
    /// Creates a new `CookieMiddleware` with empty jars.
    pub fn new() -> Self {
        Self::with_store(CookieStore::default())
    }

    /// Creates a new `CookieMiddleware` whose default jar is pre-populated.
    pub fn with_store(store: CookieStore) -> Self {
        let jars = DashMap::new();
        jars.insert(DEFAULT_JAR.to_string(), Arc::new(Mutex::new(store)));
        Self { jars }
    }

    fn jar_key(request: &Request) -> String {
        match request.meta.get(COOKIEJAR) {
            None | Some(Value::Null) => DEFAULT_JAR.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    fn jar(&self, request: &Request) -> Arc<Mutex<CookieStore>> {
        self.jars
            .entry(Self::jar_key(request))
            .or_insert_with(|| Arc::new(Mutex::new(CookieStore::default())))
            .clone()
    }
}

impl std::fmt::Debug for CookieMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieMiddleware")
            .field("jars", &self.jars.len())
            .finish()
    }
}

#[async_trait]
impl Middleware for CookieMiddleware {
    fn name(&self) -> &str {
        "CookieMiddleware"
    }

    async fn process_request(&self, mut request: Request) -> Result<RequestAction, SpiderError> {
        if request.meta_flag(DONT_MERGE_COOKIES) {
            return Ok(RequestAction::Continue(request));
        }

        let existing = request
            .headers
            .get(COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        // A redirected request already carries the cookies sent with its source.
        let already_sent: Vec<&str> = existing.split(';').map(str::trim).collect();

        let jar = self.jar(&request);
        let cookie_header = jar
            .lock()
            .await
            .get_request_values(&request.url)
            .map(|(name, value)| format!("{}={}", name, value))
            .filter(|pair| !already_sent.contains(&pair.as_str()))
            .collect::<Vec<_>>()
            .join("; ");

        if !cookie_header.is_empty() {
            let header = if existing.is_empty() {
                cookie_header
            } else {
                format!("{}; {}", existing, cookie_header)
            };
            trace!("Sending cookies to {}: {}", request.url, header);
            request.headers.insert(COOKIE, HeaderValue::from_str(&header)?);
        }

        Ok(RequestAction::Continue(request))
    }

    async fn process_response(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<ResponseAction, SpiderError> {
        if request.meta_flag(DONT_MERGE_COOKIES) {
            return Ok(ResponseAction::Continue(response));
        }

        let cookies_to_store: Vec<Cookie<'static>> = response
            .headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|val| val.to_str().ok())
            .filter_map(|s| Cookie::parse(s).ok())
            .map(|c| c.into_owned())
            .collect();

        if !cookies_to_store.is_empty() {
            self.jar(request)
                .lock()
                .await
                .store_response_cookies(cookies_to_store.into_iter(), &response.url);
        }

        Ok(ResponseAction::Continue(response))
    }
}

impl Default for CookieMiddleware {
    fn default() -> Self {
        Self::new()
    }
}
