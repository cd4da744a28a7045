//! Crawl statistics.
//!
//! [`StatsCollector`] is a shared bag of named counters. Middlewares that have
//! something to report (cache hits, retries given up, offsite rejections)
//! receive an `Arc<StatsCollector>` at construction time.
//!
//! [`DownloaderStatsMiddleware`] counts the traffic crossing its position in
//! the chain.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::SpiderError;
use crate::middleware::{ExceptionAction, Middleware, RequestAction, ResponseAction};
use crate::request::Request;
use crate::response::Response;

#[derive(Debug, Default)]
pub struct StatsCollector {
    counters: DashMap<String, i64>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, key: impl Into<String>) {
        self.add(key, 1);
    }

    pub fn add(&self, key: impl Into<String>, value: i64) {
        *self.counters.entry(key.into()).or_insert(0) += value;
    }

    /// Current value of `key`, zero when never touched.
    pub fn get(&self, key: &str) -> i64 {
        self.counters.get(key).map(|v| *v).unwrap_or(0)
    }

    /// Sorted copy of every counter.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

/// Counts requests, responses and exceptions passing through the chain.
#[derive(Debug)]
pub struct DownloaderStatsMiddleware {
    stats: Arc<StatsCollector>,
}

impl DownloaderStatsMiddleware {
    pub fn new(stats: Arc<StatsCollector>) -> Self {
        let middleware = Self { stats };
        info!("Initializing DownloaderStatsMiddleware with config: {:?}", middleware);
        middleware
    }
}

#[async_trait]
impl Middleware for DownloaderStatsMiddleware {
    fn name(&self) -> &str {
        "DownloaderStatsMiddleware"
    }

    async fn close(&self) -> Result<(), SpiderError> {
        debug!("Downloader stats: {:?}", self.stats.snapshot());
        Ok(())
    }

    async fn process_request(&self, request: Request) -> Result<RequestAction, SpiderError> {
        self.stats.inc("downloader/request_count");
        self.stats
            .inc(format!("downloader/request_method_count/{}", request.method));
        Ok(RequestAction::Continue(request))
    }

    async fn process_response(
        &self,
        _request: &Request,
        response: Response,
    ) -> Result<ResponseAction, SpiderError> {
        self.stats.inc("downloader/response_count");
        self.stats.inc(format!(
            "downloader/response_status_count/{}",
            response.status.as_u16()
        ));
        self.stats
            .add("downloader/response_bytes", response.body.len() as i64);
        Ok(ResponseAction::Continue(response))
    }

    async fn process_exception(
        &self,
        _request: &Request,
        error: &SpiderError,
    ) -> Result<ExceptionAction, SpiderError> {
        self.stats.inc("downloader/exception_count");
        self.stats.inc(format!(
            "downloader/exception_type_count/{}",
            error.kind().as_str()
        ));
        Ok(ExceptionAction::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;
    use http::StatusCode;

    #[tokio::test]
    async fn counts_traffic() {
        let stats = Arc::new(StatsCollector::new());
        let middleware = DownloaderStatsMiddleware::new(stats.clone());
        let request = Request::get("http://example.com/").unwrap();

        middleware.process_request(request.clone()).await.unwrap();
        let response = Response::new(request.url.clone(), StatusCode::NOT_FOUND).with_body("nope");
        middleware.process_response(&request, response).await.unwrap();
        middleware
            .process_exception(
                &request,
                &SpiderError::transport(TransportErrorKind::Timeout, "slow"),
            )
            .await
            .unwrap();

        assert_eq!(stats.get("downloader/request_count"), 1);
        assert_eq!(stats.get("downloader/request_method_count/GET"), 1);
        assert_eq!(stats.get("downloader/response_status_count/404"), 1);
        assert_eq!(stats.get("downloader/response_bytes"), 4);
        assert_eq!(stats.get("downloader/exception_type_count/timeout"), 1);
    }
}
