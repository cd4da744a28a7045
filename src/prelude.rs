//! Commonly used items from the `spider-intercept` crate.
//!
//! This module provides a convenient way to import the most commonly used types
//! and traits from the `spider-intercept` crate in a single import.

pub use crate::request::Request;
pub use crate::response::Response;

// Chain, dispatcher and assembly
pub use crate::chain::{MiddlewareChain, Outcome, Registration};
pub use crate::dispatcher::{Dispatcher, DownloadOutcome, RunReport};
pub use crate::registry::ChainBuilder;
pub use crate::settings::Settings;
pub use crate::stats::{DownloaderStatsMiddleware, StatsCollector};
pub use crate::transport::Transport;
#[cfg(feature = "reqwest-transport")]
pub use crate::transport::ReqwestTransport;

pub use crate::error::{Failure, FailureKind, SpiderError, TransportErrorKind};

// Built-in middleware
pub use crate::compression::HttpCompressionMiddleware;
pub use crate::cookies::CookieMiddleware;
pub use crate::headers::{DefaultHeadersMiddleware, UserAgentMiddleware};
pub use crate::http_cache::{
    CachePolicy, CacheStorage, DummyPolicy, FilesystemStorage, HttpCacheMiddleware, MemoryStorage,
    Rfc2616Policy,
};
pub use crate::offsite::OffsiteMiddleware;
pub use crate::proxy::{ProxyMiddleware, ProxyRotationStrategy, ProxySource};
pub use crate::redirect::{MetaRefreshMiddleware, RedirectMiddleware};
pub use crate::retry::RetryMiddleware;
pub use crate::robots_txt::{GoogleRobotsParser, RobotsParser, RobotsTxtMiddleware, SimpleRobotsParser};

// Re-export the core middleware trait
pub use crate::middleware::{ExceptionAction, Middleware, RequestAction, ResponseAction};
