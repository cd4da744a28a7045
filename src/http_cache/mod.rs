//! Response cache.
//!
//! [`HttpCacheMiddleware`] sits closest to the transport. On the way out it
//! looks the request's fingerprint up in a [`CacheStorage`] and answers from
//! it when it can, so a second run of a crawl can replay without network
//! access. On the way back it stores what the transport returned.
//!
//! What is stored, and when a stored response may be reused, is decided by a
//! [`CachePolicy`]. With [`DummyPolicy`] every stored response is reused
//! forever. With [`Rfc2616Policy`] stale responses are revalidated with a
//! conditional request; a `304 Not Modified` answer refreshes the stored entry
//! and the stored body is served.
//!
//! Requests are identified by their fingerprint (see [`crate::fingerprint`]).

pub mod control;
pub mod policy;
pub mod storage;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use http::StatusCode;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, DATE, TRANSFER_ENCODING};
use tracing::{debug, info, trace};

use crate::error::{FailureKind, SpiderError};
use crate::fingerprint::Fingerprinter;
use crate::middleware::{ExceptionAction, Middleware, RequestAction, ResponseAction};
use crate::request::Request;
use crate::response::{FLAG_CACHED, Response};
use crate::stats::StatsCollector;

pub use control::CacheControl;
pub use policy::{CachePolicy, DummyPolicy, Rfc2616Policy};
pub use storage::{CacheEntry, CacheStorage, FilesystemStorage, MemoryStorage};

/// Meta key keeping a request out of the cache entirely.
pub const DONT_CACHE: &str = "dont_cache";

/// Set on requests the policy refused, so their responses are not stored.
const UNCACHEABLE: &str = "_cache_uncacheable";
/// Fingerprint of the stale entry a conditional request revalidates.
const REVALIDATE: &str = "_cache_revalidate";

/// Builder for `HttpCacheMiddleware`.
#[derive(Default)]
pub struct HttpCacheMiddlewareBuilder {
    cache_dir: Option<PathBuf>,
    expiration: Duration,
    storage: Option<Arc<dyn CacheStorage>>,
    policy: Option<Arc<dyn CachePolicy>>,
    fingerprinter: Fingerprinter,
    ignore_missing: bool,
    stats: Option<Arc<StatsCollector>>,
}

impl HttpCacheMiddlewareBuilder {
    /// Sets the directory of the default filesystem storage.
    pub fn cache_dir(mut self, path: PathBuf) -> Self {
        self.cache_dir = Some(path);
        self
    }

    /// Age after which filesystem entries read as absent. Zero keeps them forever.
    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    /// Uses `storage` instead of the filesystem.
    pub fn storage(mut self, storage: Arc<dyn CacheStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn policy(mut self, policy: Arc<dyn CachePolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn fingerprinter(mut self, fingerprinter: Fingerprinter) -> Self {
        self.fingerprinter = fingerprinter;
        self
    }

    /// Fail requests that miss the cache instead of downloading them.
    pub fn ignore_missing(mut self, ignore_missing: bool) -> Self {
        self.ignore_missing = ignore_missing;
        self
    }

    pub fn stats(mut self, stats: Arc<StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Fails when no storage is given and there is no user cache directory.
    pub fn build(self) -> Result<HttpCacheMiddleware, SpiderError> {
        let storage: Arc<dyn CacheStorage> = match (self.storage, self.cache_dir) {
            (Some(storage), _) => storage,
            (None, Some(dir)) => Arc::new(FilesystemStorage::new(dir).expiration(self.expiration)),
            (None, None) => Arc::new(FilesystemStorage::in_default_dir()?.expiration(self.expiration)),
        };
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(DummyPolicy::new()));

        let middleware = HttpCacheMiddleware {
            storage,
            policy,
            fingerprinter: self.fingerprinter,
            ignore_missing: self.ignore_missing,
            stats: self.stats,
        };
        info!(
            "Initializing HttpCacheMiddleware with config: {:?}",
            middleware
        );

        Ok(middleware)
    }
}

#[derive(Debug)]
pub struct HttpCacheMiddleware {
    storage: Arc<dyn CacheStorage>,
    policy: Arc<dyn CachePolicy>,
    fingerprinter: Fingerprinter,
    ignore_missing: bool,
    stats: Option<Arc<StatsCollector>>,
}

impl HttpCacheMiddleware {
    pub fn builder() -> HttpCacheMiddlewareBuilder {
        HttpCacheMiddlewareBuilder::default()
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    fn inc(&self, counter: &str) {
        if let Some(stats) = &self.stats {
            stats.inc(format!("httpcache/{}", counter));
        }
    }

    async fn cache_response(
        &self,
        fingerprint: &str,
        request: &Request,
        response: &Response,
    ) -> Result<(), SpiderError> {
        if self.policy.should_cache_response(request, response) {
            self.inc("store");
            trace!("Storing response for {} ({})", request, fingerprint);
            self.storage
                .store(CacheEntry::new(fingerprint, request, response))
                .await
        } else {
            self.inc("uncacheable");
            trace!("Response for {} is not cacheable", request);
            Ok(())
        }
    }

    /// Folds a `304 Not Modified` into the stored entry and returns the
    /// refreshed entry.
    async fn refresh(
        &self,
        mut entry: CacheEntry,
        not_modified: &Response,
    ) -> Result<CacheEntry, SpiderError> {
        for name in not_modified.headers.keys() {
            if name == CONTENT_LENGTH || name == CONTENT_ENCODING || name == TRANSFER_ENCODING {
                continue;
            }
            entry.response.headers.remove(name);
            for value in not_modified.headers.get_all(name) {
                entry.response.headers.append(name.clone(), value.clone());
            }
        }
        entry.stored_at = SystemTime::now();
        self.storage.store(entry.clone()).await?;
        Ok(entry)
    }
}

#[async_trait]
impl Middleware for HttpCacheMiddleware {
    fn name(&self) -> &str {
        "HttpCacheMiddleware"
    }

    async fn open(&self) -> Result<(), SpiderError> {
        self.storage.open().await
    }

    async fn close(&self) -> Result<(), SpiderError> {
        self.storage.close().await
    }

    async fn process_request(&self, mut request: Request) -> Result<RequestAction, SpiderError> {
        // Left over on requests cloned from an earlier attempt.
        request.meta.remove(UNCACHEABLE);
        request.meta.remove(REVALIDATE);

        if request.meta_flag(DONT_CACHE) {
            return Ok(RequestAction::Continue(request));
        }
        if !self.policy.should_cache_request(&request) {
            return Ok(RequestAction::Continue(request.with_meta(UNCACHEABLE, true)));
        }

        let fingerprint = self.fingerprinter.fingerprint(&request);
        trace!(
            "Checking cache for request: {} (fingerprint: {})",
            request, fingerprint
        );

        let Some(entry) = self.storage.retrieve(&fingerprint).await? else {
            self.inc("miss");
            if self.ignore_missing {
                self.inc("ignore");
                return Err(SpiderError::ignored(format!(
                    "ignored request not in cache: {}",
                    request.url
                )));
            }
            trace!("Cache miss for request: {}", request);
            return Ok(RequestAction::Continue(request));
        };

        let cached = entry.response.with_flag(FLAG_CACHED);
        if self
            .policy
            .is_cached_response_valid(&entry.request, &cached, &request)
        {
            self.inc("hit");
            debug!("Returning cached response for {}", request);
            return Ok(RequestAction::Respond(cached));
        }

        debug!("Cached response for {} is stale, revalidating", request);
        let request = self
            .policy
            .revalidation_request(&cached, request)
            .with_meta(REVALIDATE, fingerprint);
        Ok(RequestAction::Continue(request))
    }

    async fn process_response(
        &self,
        request: &Request,
        mut response: Response,
    ) -> Result<ResponseAction, SpiderError> {
        if request.meta_flag(DONT_CACHE)
            || request.meta_flag(UNCACHEABLE)
            || response.is_cached()
        {
            return Ok(ResponseAction::Continue(response));
        }

        if !response.headers.contains_key(DATE) {
            response.headers.insert(DATE, policy::http_date_now());
        }

        let Some(fingerprint) = request.meta_str(REVALIDATE) else {
            self.inc("firsthand");
            let fingerprint = self.fingerprinter.fingerprint(request);
            self.cache_response(&fingerprint, request, &response).await?;
            return Ok(ResponseAction::Continue(response));
        };

        let Some(entry) = self.storage.retrieve(fingerprint).await? else {
            // Entry vanished while the conditional request was in flight.
            self.inc("firsthand");
            self.cache_response(fingerprint, request, &response).await?;
            return Ok(ResponseAction::Continue(response));
        };

        if self
            .policy
            .is_revalidation_valid(&entry.response, &response, request)
        {
            self.inc("revalidate");
            let entry = if response.status == StatusCode::NOT_MODIFIED {
                self.refresh(entry, &response).await?
            } else {
                entry
            };
            debug!("Revalidated cached response for {}", request);
            return Ok(ResponseAction::Continue(
                entry.response.with_flag(FLAG_CACHED),
            ));
        }

        self.inc("invalidate");
        self.cache_response(fingerprint, request, &response).await?;
        Ok(ResponseAction::Continue(response))
    }

    async fn process_exception(
        &self,
        request: &Request,
        error: &SpiderError,
    ) -> Result<ExceptionAction, SpiderError> {
        let Some(fingerprint) = request.meta_str(REVALIDATE) else {
            return Ok(ExceptionAction::Pass);
        };
        if !matches!(error.kind(), FailureKind::Transport(_)) {
            return Ok(ExceptionAction::Pass);
        }
        match self.storage.retrieve(fingerprint).await? {
            Some(entry) => {
                self.inc("errorrecovery");
                debug!("Serving stale cached response for {} after {}", request, error);
                Ok(ExceptionAction::Respond(entry.response.with_flag(FLAG_CACHED)))
            }
            None => Ok(ExceptionAction::Pass),
        }
    }
}
