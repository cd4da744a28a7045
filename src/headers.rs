//! Default request headers and the crawler's `User-Agent`.
//!
//! Both middlewares only fill in headers the request does not already carry.

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use tracing::info;

use crate::error::SpiderError;
use crate::middleware::{Middleware, RequestAction};
use crate::request::Request;

/// Default `User-Agent` announced by the crawler.
pub const DEFAULT_USER_AGENT: &str = concat!("spider-intercept/", env!("CARGO_PKG_VERSION"));

/// Sets configured headers on requests that lack them.
#[derive(Debug, Clone)]
pub struct DefaultHeadersMiddleware {
    headers: HeaderMap,
}

impl Default for DefaultHeadersMiddleware {
    fn default() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(http::header::ACCEPT_LANGUAGE, HeaderValue::from_static("en"));
        Self { headers }
    }
}

impl DefaultHeadersMiddleware {
    pub fn new(headers: HeaderMap) -> Self {
        let middleware = Self { headers };
        info!("Initializing DefaultHeadersMiddleware with config: {:?}", middleware);
        middleware
    }

    /// Builds the middleware from string pairs, validating names and values.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, SpiderError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }
        Ok(Self::new(headers))
    }
}

#[async_trait]
impl Middleware for DefaultHeadersMiddleware {
    fn name(&self) -> &str {
        "DefaultHeadersMiddleware"
    }

    async fn process_request(&self, mut request: Request) -> Result<RequestAction, SpiderError> {
        for name in self.headers.keys() {
            if !request.headers.contains_key(name) {
                for value in self.headers.get_all(name) {
                    request.headers.append(name.clone(), value.clone());
                }
            }
        }
        Ok(RequestAction::Continue(request))
    }
}

/// Sets the crawler's `User-Agent` on requests that lack one.
#[derive(Debug, Clone)]
pub struct UserAgentMiddleware {
    user_agent: HeaderValue,
}

impl Default for UserAgentMiddleware {
    fn default() -> Self {
        Self {
            user_agent: HeaderValue::from_static(DEFAULT_USER_AGENT),
        }
    }
}

impl UserAgentMiddleware {
    pub fn new(user_agent: &str) -> Result<Self, SpiderError> {
        let middleware = Self {
            user_agent: HeaderValue::from_str(user_agent)?,
        };
        info!("Initializing UserAgentMiddleware with config: {:?}", middleware);
        Ok(middleware)
    }
}

#[async_trait]
impl Middleware for UserAgentMiddleware {
    fn name(&self) -> &str {
        "UserAgentMiddleware"
    }

    async fn process_request(&self, mut request: Request) -> Result<RequestAction, SpiderError> {
        if !request.headers.contains_key(USER_AGENT) {
            request.headers.insert(USER_AGENT, self.user_agent.clone());
        }
        Ok(RequestAction::Continue(request))
    }
}
