//! Proxy selection.
//!
//! [`ProxyMiddleware`] assigns a proxy URL to every outgoing request by
//! writing it into the request meta under [`PROXY`], where the transport picks
//! it up. A request that already has a `proxy` entry keeps it, and a `null`
//! entry means "connect directly".
//!
//! The pool comes from a [`ProxySource`]. With an explicit list or a file the
//! pool is rotated according to a [`ProxyRotationStrategy`]; with
//! [`ProxySource::Env`] the proxy is chosen per URL scheme from the
//! `http_proxy` / `https_proxy` variables and never rotates.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{FailureKind, SpiderError};
use crate::middleware::{ExceptionAction, Middleware, RequestAction, ResponseAction};
use crate::request::Request;
use crate::response::Response;

/// Meta key holding the proxy URL chosen for a request.
pub const PROXY: &str = "proxy";

/// How the pool hands out proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyRotationStrategy {
    /// Round robin over the pool.
    #[default]
    Sequential,
    /// A uniformly random member of the pool for each request.
    Random,
    /// Stay on one proxy and move to the next only after it looks blocked.
    StickyFailover,
}

/// Where the proxy pool comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProxySource {
    List(Vec<String>),
    /// A text file with one proxy URL per line; `#` starts a comment line.
    File(PathBuf),
    /// Per-scheme proxies from the environment.
    Env,
}

impl Default for ProxySource {
    fn default() -> Self {
        ProxySource::List(Vec::new())
    }
}

/// Rotating pool of proxy URLs.
struct ProxyPool {
    proxies: Vec<String>,
    strategy: ProxyRotationStrategy,
    cursor: AtomicUsize,
}

impl ProxyPool {
    fn pick(&self) -> Option<String> {
        if self.proxies.is_empty() {
            return None;
        }
        let index = match self.strategy {
            ProxyRotationStrategy::Sequential => self.cursor.fetch_add(1, Ordering::Relaxed),
            ProxyRotationStrategy::StickyFailover => self.cursor.load(Ordering::Relaxed),
            ProxyRotationStrategy::Random => {
                return self.proxies.choose(&mut rand::thread_rng()).cloned();
            }
        };
        self.proxies.get(index % self.proxies.len()).cloned()
    }

    /// Moves a sticky pool on to its next proxy.
    fn advance(&self) {
        if self.strategy == ProxyRotationStrategy::StickyFailover && !self.proxies.is_empty() {
            let previous = self.cursor.fetch_add(1, Ordering::Relaxed);
            info!(
                "Rotating away from proxy {}",
                self.proxies[previous % self.proxies.len()]
            );
        }
    }
}

/// Builder for [`ProxyMiddleware`].
#[derive(Debug, Clone, Default)]
pub struct ProxyMiddlewareBuilder {
    source: ProxySource,
    strategy: ProxyRotationStrategy,
    block_detection_texts: Vec<String>,
}

impl ProxyMiddlewareBuilder {
    pub fn source(mut self, source: ProxySource) -> Self {
        self.source = source;
        self
    }

    pub fn strategy(mut self, strategy: ProxyRotationStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Body snippets (e.g. a captcha page marker) that count as a block.
    /// Only consulted by [`ProxyRotationStrategy::StickyFailover`].
    pub fn with_block_detection_texts(mut self, texts: Vec<String>) -> Self {
        self.block_detection_texts = texts;
        self
    }

    /// Fails when a proxy file is configured but cannot be read.
    pub fn build(self) -> Result<ProxyMiddleware, SpiderError> {
        let (proxies, by_scheme) = match self.source {
            ProxySource::List(list) => (list, HashMap::new()),
            ProxySource::File(path) => (read_proxy_file(&path)?, HashMap::new()),
            ProxySource::Env => (Vec::new(), proxies_from_env()),
        };

        let middleware = ProxyMiddleware {
            pool: ProxyPool {
                proxies,
                strategy: self.strategy,
                cursor: AtomicUsize::new(0),
            },
            by_scheme,
            block_markers: self.block_detection_texts,
        };
        info!("Initializing ProxyMiddleware with config: {:?}", middleware);
        Ok(middleware)
    }
}

fn read_proxy_file(path: &Path) -> Result<Vec<String>, SpiderError> {
    let contents = fs::read_to_string(path).map_err(|e| {
        SpiderError::ConfigurationError(format!("cannot read proxy file {}: {}", path.display(), e))
    })?;
    let proxies: Vec<String> = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    if proxies.is_empty() {
        warn!("Proxy file {} lists no proxies", path.display());
    }
    Ok(proxies)
}

fn proxies_from_env() -> HashMap<String, String> {
    let mut by_scheme = HashMap::new();
    for scheme in ["http", "https"] {
        let value = std::env::var(format!("{scheme}_proxy"))
            .or_else(|_| std::env::var(format!("{}_PROXY", scheme.to_ascii_uppercase())));
        if let Ok(proxy) = value
            && !proxy.trim().is_empty()
        {
            by_scheme.insert(scheme.to_string(), proxy.trim().to_string());
        }
    }
    by_scheme
}

pub struct ProxyMiddleware {
    pool: ProxyPool,
    by_scheme: HashMap<String, String>,
    block_markers: Vec<String>,
}

impl fmt::Debug for ProxyMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Proxy URLs may embed credentials, so only sizes are shown.
        f.debug_struct("ProxyMiddleware")
            .field("strategy", &self.pool.strategy)
            .field("pool_size", &self.pool.proxies.len())
            .field("env_schemes", &self.by_scheme.keys().collect::<Vec<_>>())
            .field("block_markers", &self.block_markers)
            .finish()
    }
}

impl ProxyMiddleware {
    pub fn builder() -> ProxyMiddlewareBuilder {
        ProxyMiddlewareBuilder::default()
    }

    fn choose(&self, request: &Request) -> Option<String> {
        if self.pool.proxies.is_empty() {
            self.by_scheme.get(request.url.scheme()).cloned()
        } else {
            self.pool.pick()
        }
    }

    /// Whether `response` suggests the current proxy got blocked.
    fn looks_blocked(&self, response: &Response) -> bool {
        let status = response.status;
        if status.is_client_error() || status.is_server_error() {
            return true;
        }
        if !status.is_success() || self.block_markers.is_empty() {
            return false;
        }
        let body = String::from_utf8_lossy(&response.body);
        self.block_markers.iter().any(|marker| body.contains(marker.as_str()))
    }
}

#[async_trait]
impl Middleware for ProxyMiddleware {
    fn name(&self) -> &str {
        "ProxyMiddleware"
    }

    async fn process_request(&self, mut request: Request) -> Result<RequestAction, SpiderError> {
        if request.meta.contains_key(PROXY) {
            return Ok(RequestAction::Continue(request));
        }
        if let Some(proxy) = self.choose(&request) {
            debug!("Routing {} through {}", request, proxy);
            request.meta.insert(PROXY.to_string(), proxy.into());
        }
        Ok(RequestAction::Continue(request))
    }

    async fn process_response(
        &self,
        _request: &Request,
        response: Response,
    ) -> Result<ResponseAction, SpiderError> {
        if self.pool.strategy == ProxyRotationStrategy::StickyFailover && self.looks_blocked(&response) {
            debug!("{} ({}) looks blocked", response.url, response.status);
            self.pool.advance();
        }
        Ok(ResponseAction::Continue(response))
    }

    async fn process_exception(
        &self,
        _request: &Request,
        error: &SpiderError,
    ) -> Result<ExceptionAction, SpiderError> {
        // Only network failures say anything about the proxy.
        if matches!(error.kind(), FailureKind::Transport(_)) {
            self.pool.advance();
        }
        Ok(ExceptionAction::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    async fn proxy_of(mw: &ProxyMiddleware, request: Request) -> Option<String> {
        match mw.process_request(request).await.unwrap() {
            RequestAction::Continue(r) => r.meta_str(PROXY).map(str::to_string),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn pool() -> ProxySource {
        ProxySource::List(vec!["http://p1:8080".into(), "http://p2:8080".into()])
    }

    #[tokio::test]
    async fn sequential_cycles_through_pool() {
        let mw = ProxyMiddleware::builder().source(pool()).build().unwrap();
        let request = Request::get("http://example.com/").unwrap();

        let mut picked = Vec::new();
        for _ in 0..3 {
            picked.push(proxy_of(&mw, request.clone()).await.unwrap());
        }
        assert_eq!(picked, ["http://p1:8080", "http://p2:8080", "http://p1:8080"]);
    }

    #[tokio::test]
    async fn explicit_meta_proxy_is_kept() {
        let mw = ProxyMiddleware::builder().source(pool()).build().unwrap();
        let request = Request::get("http://example.com/")
            .unwrap()
            .with_meta(PROXY, "http://mine:3128");
        assert_eq!(proxy_of(&mw, request).await.as_deref(), Some("http://mine:3128"));

        let direct = Request::get("http://example.com/")
            .unwrap()
            .with_meta(PROXY, serde_json::Value::Null);
        assert_eq!(proxy_of(&mw, direct).await, None);
    }

    #[tokio::test]
    async fn sticky_failover_rotates_on_block() {
        let mw = ProxyMiddleware::builder()
            .source(pool())
            .strategy(ProxyRotationStrategy::StickyFailover)
            .with_block_detection_texts(vec!["captcha".into()])
            .build()
            .unwrap();
        let request = Request::get("http://example.com/").unwrap();

        assert_eq!(proxy_of(&mw, request.clone()).await.as_deref(), Some("http://p1:8080"));
        assert_eq!(proxy_of(&mw, request.clone()).await.as_deref(), Some("http://p1:8080"));

        let fine = Response::new(request.url.clone(), StatusCode::OK).with_body("welcome");
        mw.process_response(&request, fine).await.unwrap();
        assert_eq!(proxy_of(&mw, request.clone()).await.as_deref(), Some("http://p1:8080"));

        let blocked = Response::new(request.url.clone(), StatusCode::OK).with_body("please solve the captcha");
        mw.process_response(&request, blocked).await.unwrap();
        assert_eq!(proxy_of(&mw, request).await.as_deref(), Some("http://p2:8080"));
    }

    #[tokio::test]
    async fn sticky_failover_rotates_only_on_transport_errors() {
        let mw = ProxyMiddleware::builder()
            .source(pool())
            .strategy(ProxyRotationStrategy::StickyFailover)
            .build()
            .unwrap();
        let request = Request::get("http://example.com/").unwrap();

        let filtered = SpiderError::ignored("offsite request to elsewhere.org");
        mw.process_exception(&request, &filtered).await.unwrap();
        assert_eq!(proxy_of(&mw, request.clone()).await.as_deref(), Some("http://p1:8080"));

        let refused = SpiderError::transport(crate::error::TransportErrorKind::Connect, "refused");
        mw.process_exception(&request, &refused).await.unwrap();
        assert_eq!(proxy_of(&mw, request).await.as_deref(), Some("http://p2:8080"));
    }

    #[test]
    fn missing_proxy_file_is_a_configuration_error() {
        let err = ProxyMiddleware::builder()
            .source(ProxySource::File(PathBuf::from("/nonexistent/proxies.txt")))
            .build()
            .unwrap_err();
        assert!(matches!(err, SpiderError::ConfigurationError(_)));
    }

    #[test]
    fn proxy_file_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.txt");
        std::fs::write(&path, "# pool\nhttp://a:1\n\n  http://b:2  \n").unwrap();

        assert_eq!(read_proxy_file(&path).unwrap(), ["http://a:1", "http://b:2"]);
    }
}
