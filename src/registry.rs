//! Built-in middleware names, their default order keys, and chain assembly.
//!
//! The chain is assembled once, at startup, from the default order table
//! merged with the overrides in [`Settings::order_overrides`]. An override
//! with a number moves a middleware, `null` removes it. The merged list is
//! sorted by order key with ties broken by name, so the same settings always
//! produce the same chain.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, info};

use crate::chain::{MiddlewareChain, Registration};
use crate::compression::HttpCompressionMiddleware;
use crate::cookies::CookieMiddleware;
use crate::error::SpiderError;
use crate::headers::{DefaultHeadersMiddleware, UserAgentMiddleware};
use crate::http_cache::{
    CachePolicy, CacheStorage, DummyPolicy, FilesystemStorage, HttpCacheMiddleware, MemoryStorage,
    Rfc2616Policy,
};
use crate::middleware::Middleware;
use crate::offsite::OffsiteMiddleware;
use crate::proxy::{ProxyMiddleware, ProxySource};
use crate::redirect::{MetaRefreshMiddleware, RedirectMiddleware};
use crate::retry::RetryMiddleware;
use crate::robots_txt::{GoogleRobotsParser, RobotsParser, RobotsTxtMiddleware, SimpleRobotsParser};
use crate::settings::{CachePolicyKind, CacheStorageKind, RobotsParserKind, Settings};
use crate::stats::{DownloaderStatsMiddleware, StatsCollector};
use crate::transport::Transport;

pub const OFFSITE: &str = "offsite";
pub const ROBOTS_TXT: &str = "robots_txt";
pub const DEFAULT_HEADERS: &str = "default_headers";
pub const USER_AGENT: &str = "user_agent";
pub const RETRY: &str = "retry";
pub const META_REFRESH: &str = "meta_refresh";
pub const HTTP_COMPRESSION: &str = "http_compression";
pub const REDIRECT: &str = "redirect";
pub const COOKIES: &str = "cookies";
pub const HTTP_PROXY: &str = "http_proxy";
pub const DOWNLOADER_STATS: &str = "downloader_stats";
pub const HTTP_CACHE: &str = "http_cache";

/// Default order key of every built-in middleware.
pub const DEFAULT_ORDERS: &[(&str, i32)] = &[
    (OFFSITE, 50),
    (ROBOTS_TXT, 100),
    (DEFAULT_HEADERS, 400),
    (USER_AGENT, 500),
    (RETRY, 550),
    (META_REFRESH, 580),
    (HTTP_COMPRESSION, 590),
    (REDIRECT, 600),
    (COOKIES, 700),
    (HTTP_PROXY, 750),
    (DOWNLOADER_STATS, 850),
    (HTTP_CACHE, 900),
];

/// Merges `overrides` into `defaults` and sorts the result by (order, name).
///
/// Overrides may only name middlewares present in `defaults`.
pub fn merge_orders<'a, I>(
    defaults: I,
    overrides: &BTreeMap<String, Option<i32>>,
) -> Result<Vec<(String, i32)>, SpiderError>
where
    I: IntoIterator<Item = (&'a str, i32)>,
{
    let mut merged: BTreeMap<String, i32> = defaults
        .into_iter()
        .map(|(name, order)| (name.to_string(), order))
        .collect();
    let known: Vec<String> = merged.keys().cloned().collect();

    for (name, order) in overrides {
        if !known.contains(name) {
            return Err(SpiderError::ConfigurationError(format!(
                "unknown middleware in order overrides: {}",
                name
            )));
        }
        match order {
            Some(order) => {
                merged.insert(name.clone(), *order);
            }
            None => {
                debug!("Middleware {} disabled by settings", name);
                merged.remove(name);
            }
        }
    }

    let mut ordered: Vec<(String, i32)> = merged.into_iter().collect();
    ordered.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    Ok(ordered)
}

/// Assembles a [`MiddlewareChain`] from [`Settings`].
pub struct ChainBuilder {
    settings: Settings,
    transport: Option<Arc<dyn Transport>>,
    stats: Arc<StatsCollector>,
    custom: HashMap<String, (i32, Arc<dyn Middleware>)>,
    cache_storage: Option<Arc<dyn CacheStorage>>,
}

impl ChainBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            transport: None,
            stats: Arc::new(StatsCollector::new()),
            custom: HashMap::new(),
            cache_storage: None,
        }
    }

    /// Transport used by middlewares that download on their own (robots.txt).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn stats(mut self, stats: Arc<StatsCollector>) -> Self {
        self.stats = stats;
        self
    }

    /// Storage for the HTTP cache, replacing the one named in the settings.
    pub fn cache_storage(mut self, storage: Arc<dyn CacheStorage>) -> Self {
        self.cache_storage = Some(storage);
        self
    }

    /// Adds a custom middleware under `name` with a default `order`.
    ///
    /// Order overrides apply to custom middlewares like to built-in ones.
    /// Registering a built-in name replaces the built-in.
    pub fn register(mut self, name: impl Into<String>, order: i32, middleware: Arc<dyn Middleware>) -> Self {
        self.custom.insert(name.into(), (order, middleware));
        self
    }

    pub fn build(self) -> Result<MiddlewareChain, SpiderError> {
        self.settings.validate()?;

        let mut defaults: BTreeMap<&str, i32> = DEFAULT_ORDERS.iter().copied().collect();
        for (name, (order, _)) in &self.custom {
            defaults.insert(name.as_str(), *order);
        }
        let ordered = merge_orders(defaults, &self.settings.order_overrides)?;

        let mut entries = Vec::with_capacity(ordered.len());
        for (name, order) in ordered {
            let middleware = match self.custom.get(&name) {
                Some((_, middleware)) => Some(middleware.clone()),
                None => self.builtin(&name)?,
            };
            if let Some(middleware) = middleware {
                entries.push(Registration::new(name, order, middleware));
            }
        }

        let chain = MiddlewareChain::new(entries);
        info!("Middleware chain: {:?}", chain.names());
        Ok(chain)
    }

    /// Instantiates a built-in, or `None` when the settings switch it off.
    fn builtin(&self, name: &str) -> Result<Option<Arc<dyn Middleware>>, SpiderError> {
        let s = &self.settings;
        let stats = self.stats.clone();
        let middleware: Arc<dyn Middleware> = match name {
            OFFSITE => Arc::new(OffsiteMiddleware::new(&s.offsite_allowed_domains).stats(stats)),
            ROBOTS_TXT => {
                if !s.robotstxt_obey {
                    return Ok(None);
                }
                let transport = self.transport.clone().ok_or_else(|| {
                    SpiderError::ConfigurationError(
                        "robotstxt_obey requires a transport".to_string(),
                    )
                })?;
                let parser: Arc<dyn RobotsParser> = match s.robotstxt_parser {
                    RobotsParserKind::Google => Arc::new(GoogleRobotsParser),
                    RobotsParserKind::Simple => Arc::new(SimpleRobotsParser),
                };
                Arc::new(
                    RobotsTxtMiddleware::new(transport)
                        .parser(parser)
                        .user_agent(s.user_agent.clone())
                        .stats(stats),
                )
            }
            DEFAULT_HEADERS => {
                let mut headers = HeaderMap::new();
                for (name, value) in &s.default_request_headers {
                    headers.append(
                        HeaderName::from_bytes(name.as_bytes())?,
                        HeaderValue::from_str(value)?,
                    );
                }
                Arc::new(DefaultHeadersMiddleware::new(headers))
            }
            USER_AGENT => Arc::new(UserAgentMiddleware::new(&s.user_agent)?),
            RETRY => {
                if !s.retry_enabled {
                    return Ok(None);
                }
                Arc::new(
                    RetryMiddleware::new()
                        .max_retries(s.retry_times)
                        .retry_http_codes(s.retry_http_codes.clone())
                        .priority_adjust(s.retry_priority_adjust)
                        .stats(stats),
                )
            }
            META_REFRESH => {
                if !s.metarefresh_enabled {
                    return Ok(None);
                }
                Arc::new(
                    MetaRefreshMiddleware::new()
                        .max_delay(Duration::from_secs(s.metarefresh_maxdelay))
                        .max_redirects(s.redirect_max_times)
                        .priority_adjust(s.redirect_priority_adjust)
                        .stats(stats),
                )
            }
            HTTP_COMPRESSION => {
                if !s.compression_enabled {
                    return Ok(None);
                }
                Arc::new(
                    HttpCompressionMiddleware::new()
                        .max_size(s.download_maxsize)
                        .stats(stats),
                )
            }
            REDIRECT => {
                if !s.redirect_enabled {
                    return Ok(None);
                }
                Arc::new(
                    RedirectMiddleware::new()
                        .max_redirects(s.redirect_max_times)
                        .priority_adjust(s.redirect_priority_adjust)
                        .stats(stats),
                )
            }
            COOKIES => {
                if !s.cookies_enabled {
                    return Ok(None);
                }
                Arc::new(CookieMiddleware::new())
            }
            HTTP_PROXY => {
                let source = if s.proxies.is_empty() {
                    ProxySource::Env
                } else {
                    ProxySource::List(s.proxies.clone())
                };
                Arc::new(
                    ProxyMiddleware::builder()
                        .source(source)
                        .strategy(s.proxy_strategy)
                        .build()?,
                )
            }
            DOWNLOADER_STATS => Arc::new(DownloaderStatsMiddleware::new(stats)),
            HTTP_CACHE => {
                if !s.cache_enabled {
                    return Ok(None);
                }
                Arc::new(self.http_cache(stats)?)
            }
            other => {
                return Err(SpiderError::ConfigurationError(format!(
                    "unknown middleware: {}",
                    other
                )));
            }
        };
        Ok(Some(middleware))
    }

    fn http_cache(&self, stats: Arc<StatsCollector>) -> Result<HttpCacheMiddleware, SpiderError> {
        let s = &self.settings;
        let expiration = Duration::from_secs(s.cache_expiration_secs);

        let storage: Arc<dyn CacheStorage> = match (&self.cache_storage, s.cache_storage) {
            (Some(storage), _) => storage.clone(),
            (None, CacheStorageKind::Memory) => Arc::new(MemoryStorage::new().expiration(expiration)),
            (None, CacheStorageKind::Filesystem) => {
                let storage = match &s.cache_dir {
                    Some(dir) => FilesystemStorage::new(dir),
                    None => FilesystemStorage::in_default_dir()?,
                };
                Arc::new(storage.expiration(expiration))
            }
        };

        let policy: Arc<dyn CachePolicy> = match s.cache_policy {
            CachePolicyKind::Dummy => Arc::new(
                DummyPolicy::new()
                    .ignore_schemes(s.cache_ignore_schemes.clone())
                    .ignore_http_codes(s.cache_ignore_http_codes.clone()),
            ),
            CachePolicyKind::Rfc2616 => Arc::new(
                Rfc2616Policy::new()
                    .ignore_schemes(s.cache_ignore_schemes.clone())
                    .always_store(s.cache_always_store)
                    .ignore_response_cache_controls(s.cache_ignore_response_cache_controls.clone()),
            ),
        };

        HttpCacheMiddleware::builder()
            .storage(storage)
            .policy(policy)
            .ignore_missing(s.cache_ignore_missing)
            .stats(stats)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_move_and_disable_entries() {
        let overrides = BTreeMap::from([
            ("retry".to_string(), Some(10)),
            ("cookies".to_string(), None),
        ]);
        let merged = merge_orders(DEFAULT_ORDERS.iter().copied(), &overrides).unwrap();
        let names: Vec<&str> = merged.iter().map(|(n, _)| n.as_str()).collect();

        assert_eq!(names.first(), Some(&"retry"));
        assert!(!names.contains(&"cookies"));
        assert_eq!(names.last(), Some(&"http_cache"));
    }

    #[test]
    fn ties_are_broken_by_name() {
        let merged = merge_orders([("b", 5), ("a", 5), ("c", 1)], &BTreeMap::new()).unwrap();
        assert_eq!(
            merged,
            vec![("c".to_string(), 1), ("a".to_string(), 5), ("b".to_string(), 5)]
        );
    }

    #[test]
    fn unknown_override_is_rejected() {
        let overrides = BTreeMap::from([("nope".to_string(), Some(1))]);
        let err = merge_orders(DEFAULT_ORDERS.iter().copied(), &overrides).unwrap_err();
        assert!(matches!(err, SpiderError::ConfigurationError(_)));
    }

    #[test]
    fn default_settings_build_the_default_chain() {
        let chain = ChainBuilder::new(Settings::default()).build().unwrap();
        assert_eq!(
            chain.names(),
            vec![
                OFFSITE,
                DEFAULT_HEADERS,
                USER_AGENT,
                RETRY,
                META_REFRESH,
                HTTP_COMPRESSION,
                REDIRECT,
                COOKIES,
                HTTP_PROXY,
                DOWNLOADER_STATS,
            ]
        );
    }

    #[test]
    fn robots_without_transport_is_a_configuration_error() {
        let settings = Settings {
            robotstxt_obey: true,
            ..Settings::default()
        };
        let err = ChainBuilder::new(settings).build().unwrap_err();
        assert!(matches!(err, SpiderError::ConfigurationError(_)));
    }

    #[test]
    fn cache_is_installed_last_when_enabled() {
        let settings = Settings {
            cache_enabled: true,
            cache_storage: CacheStorageKind::Memory,
            ..Settings::default()
        };
        let chain = ChainBuilder::new(settings).build().unwrap();
        assert_eq!(chain.names().last(), Some(&HTTP_CACHE));
    }
}
