//! # spider-intercept
//!
//! Downloader middleware chain for the `spider-lib` crawling framework.
//!
//! ## Overview
//!
//! Every request a crawler sends and every response it receives passes
//! through an ordered chain of middlewares. Each middleware may rewrite the
//! traffic, answer a request without touching the network, send a new request
//! back to the scheduler, or reject it outright.
//!
//! ## Available Middlewares
//!
//! - **HTTP Caching**: stores responses and replays them, with a
//!   store-everything policy or HTTP/1.1 freshness and revalidation
//! - **Retries**: reschedules requests after retryable statuses or transport errors
//! - **Redirects**: follows `3xx` responses and `<meta http-equiv="refresh">`
//! - **Robots.txt**: adheres to `robots.txt` rules
//! - **Offsite filtering**: keeps the crawl on its allowed domains
//! - **Proxy**: picks and rotates proxy servers
//! - **Compression**: decodes gzip, deflate and zstd bodies
//! - **Cookies**: persists cookies across requests, one jar per session
//! - **Default headers / User-Agent**
//! - **Downloader stats**
//!
//! ## Architecture
//!
//! Each middleware implements the [`Middleware`] trait. A [`MiddlewareChain`]
//! runs request hooks in ascending order key and response and exception hooks
//! in descending order key. The [`Dispatcher`] wraps the chain around a
//! [`Transport`] and routes failures nobody handled to the request's errback.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use spider_intercept::prelude::*;
//!
//! let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new()?);
//! let settings = Settings::from_path("crawl.json")?;
//! let chain = ChainBuilder::new(settings)
//!     .transport(transport.clone())
//!     .build()?;
//!
//! let dispatcher = Dispatcher::new(Arc::new(chain), transport);
//! dispatcher.open().await?;
//! let report = dispatcher.run([Request::get("https://example.com/")?], 8).await;
//! dispatcher.close().await?;
//! ```

pub mod chain;
pub mod compression;
pub mod cookies;
pub mod dispatcher;
pub mod error;
pub mod fingerprint;
pub mod headers;
pub mod http_cache;
pub mod middleware;
pub mod offsite;
pub mod proxy;
pub mod redirect;
pub mod registry;
pub mod request;
pub mod response;
pub mod retry;
pub mod robots_txt;
pub mod settings;
pub mod stats;
pub mod transport;

pub mod prelude;

pub use chain::{MiddlewareChain, Outcome, Registration};
pub use dispatcher::{DownloadOutcome, Dispatcher};
pub use error::{Failure, FailureKind, SpiderError};
pub use middleware::{ExceptionAction, Middleware, RequestAction, ResponseAction};
pub use request::Request;
pub use response::Response;
pub use transport::Transport;
