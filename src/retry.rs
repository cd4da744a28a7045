//! Retries.
//!
//! [`RetryMiddleware`] reschedules requests that
//! come back with a retryable HTTP status or fail with a retryable transport
//! error (timeouts, refused connections, dropped connections, DNS failures).
//!
//! Each retry is a fresh clone of the request carrying an incremented
//! `retry_times` counter in its meta, the reason of the retry, and an adjusted
//! priority. Once a request has used up its budget the middleware lets the
//! failure continue: a retryable response is passed on as-is, a retryable
//! error stays unhandled and ends up at the request's errback.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use crate::error::{SpiderError, TransportErrorKind};
use crate::middleware::{ExceptionAction, Middleware, ResponseAction};
use crate::request::Request;
use crate::response::Response;
use crate::stats::StatsCollector;

/// Meta key holding how many times a request has been retried.
pub const RETRY_TIMES: &str = "retry_times";
/// Meta key overriding the retry budget for one request.
pub const MAX_RETRY_TIMES: &str = "max_retry_times";
/// Meta key recording why the last retry happened.
pub const RETRY_REASON: &str = "retry_reason";
/// Meta key disabling retries for one request.
pub const DONT_RETRY: &str = "dont_retry";

/// Reschedules requests that hit a retryable status or transport error.
#[derive(Debug, Clone)]
pub struct RetryMiddleware {
    /// Retry budget per request, unless overridden through `max_retry_times`.
    pub max_retries: u32,
    /// Statuses treated as transient.
    pub retry_http_codes: Vec<u16>,
    /// Transport error kinds that should trigger a retry.
    pub retry_on: Vec<TransportErrorKind>,
    /// Added to the priority of every retried request.
    pub priority_adjust: i32,
    stats: Option<Arc<StatsCollector>>,
}

impl Default for RetryMiddleware {
    fn default() -> Self {
        let middleware = RetryMiddleware {
            max_retries: 2,
            retry_http_codes: vec![500, 502, 503, 504, 522, 524, 408, 429],
            retry_on: TransportErrorKind::RETRYABLE.to_vec(),
            priority_adjust: -1,
            stats: None,
        };
        info!("Initializing RetryMiddleware with config: {:?}", middleware);
        middleware
    }
}

impl RetryMiddleware {
    /// Two retries on the usual transient statuses and connection errors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default retry budget.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Replaces the transient status list.
    pub fn retry_http_codes(mut self, retry_http_codes: Vec<u16>) -> Self {
        self.retry_http_codes = retry_http_codes;
        self
    }

    /// Sets the transport error kinds that should trigger a retry.
    pub fn retry_on(mut self, kinds: Vec<TransportErrorKind>) -> Self {
        self.retry_on = kinds;
        self
    }

    /// Sets the priority delta applied to retried requests.
    pub fn priority_adjust(mut self, priority_adjust: i32) -> Self {
        self.priority_adjust = priority_adjust;
        self
    }

    pub fn stats(mut self, stats: Arc<StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    fn inc(&self, key: impl Into<String>) {
        if let Some(stats) = &self.stats {
            stats.inc(key);
        }
    }

    /// Builds the next attempt for `request`, or `None` once the budget is spent.
    pub fn retry_request(&self, request: &Request, reason: &str) -> Option<Request> {
        let retries = request.meta_u64(RETRY_TIMES).unwrap_or(0) + 1;
        let max_retries = request
            .meta_u64(MAX_RETRY_TIMES)
            .unwrap_or(u64::from(self.max_retries));

        if retries <= max_retries {
            info!(
                "Retrying {} (failed {} times): {}",
                request, retries, reason
            );
            self.inc("retry/count");
            self.inc(format!("retry/reason_count/{}", reason));

            let mut retry = request.clone();
            retry.meta.insert(RETRY_TIMES.to_string(), retries.into());
            retry.meta.insert(RETRY_REASON.to_string(), reason.into());
            retry.dont_filter = true;
            retry.priority = request.priority.saturating_add(self.priority_adjust);
            Some(retry)
        } else {
            warn!(
                "Gave up retrying {} (failed {} times): {}",
                request, retries, reason
            );
            self.inc("retry/max_reached");
            None
        }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "RetryMiddleware"
    }

    async fn process_response(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<ResponseAction, SpiderError> {
        trace!(
            "Processing response for URL: {} with status: {}",
            response.url, response.status
        );

        if request.meta_flag(DONT_RETRY) {
            return Ok(ResponseAction::Continue(response));
        }

        if self.retry_http_codes.contains(&response.status.as_u16()) {
            let reason = response.status.as_u16().to_string();
            if let Some(retry) = self.retry_request(request, &reason) {
                return Ok(ResponseAction::Reschedule(retry));
            }
        } else {
            trace!(
                "Response status {} is not in retry codes, continuing",
                response.status
            );
        }

        Ok(ResponseAction::Continue(response))
    }

    async fn process_exception(
        &self,
        request: &Request,
        error: &SpiderError,
    ) -> Result<ExceptionAction, SpiderError> {
        trace!("Handling error for request {}: {}", request, error);

        if let SpiderError::Transport { kind, .. } = error
            && self.retry_on.contains(kind)
            && !request.meta_flag(DONT_RETRY)
        {
            if let Some(retry) = self.retry_request(request, kind.as_str()) {
                return Ok(ExceptionAction::Reschedule(retry));
            }
        } else {
            debug!("Error is not retryable, passing it on: {}", error);
        }

        Ok(ExceptionAction::Pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn timeout() -> SpiderError {
        SpiderError::transport(TransportErrorKind::Timeout, "timed out")
    }

    #[tokio::test]
    async fn retries_up_to_budget_then_gives_up() {
        let stats = Arc::new(StatsCollector::new());
        let retry = RetryMiddleware::new().max_retries(3).stats(stats.clone());
        let mut request = Request::get("http://example.com/").unwrap().with_priority(5);
        let mut counts = Vec::new();

        for _ in 0..3 {
            match retry.process_exception(&request, &timeout()).await.unwrap() {
                ExceptionAction::Reschedule(next) => {
                    counts.push(next.meta_u64(RETRY_TIMES).unwrap());
                    assert_eq!(next.priority, request.priority - 1);
                    assert!(next.dont_filter);
                    request = next;
                }
                other => panic!("expected reschedule, got {other:?}"),
            }
        }

        assert_eq!(counts, vec![1, 2, 3]);
        assert!(matches!(
            retry.process_exception(&request, &timeout()).await.unwrap(),
            ExceptionAction::Pass
        ));
        assert_eq!(stats.get("retry/count"), 3);
        assert_eq!(stats.get("retry/reason_count/timeout"), 3);
        assert_eq!(stats.get("retry/max_reached"), 1);
    }

    #[tokio::test]
    async fn per_request_budget_overrides_setting() {
        let retry = RetryMiddleware::new().max_retries(5);
        let request = Request::get("http://example.com/")
            .unwrap()
            .with_meta(MAX_RETRY_TIMES, 0);

        assert!(matches!(
            retry.process_exception(&request, &timeout()).await.unwrap(),
            ExceptionAction::Pass
        ));
    }

    #[tokio::test]
    async fn retries_listed_status_and_passes_through_when_exhausted() {
        let retry = RetryMiddleware::new().max_retries(1);
        let request = Request::get("http://example.com/").unwrap();
        let response = Response::new(request.url.clone(), StatusCode::SERVICE_UNAVAILABLE);

        let next = match retry.process_response(&request, response.clone()).await.unwrap() {
            ResponseAction::Reschedule(next) => next,
            other => panic!("expected reschedule, got {other:?}"),
        };
        assert_eq!(next.meta_str(RETRY_REASON), Some("503"));

        match retry.process_response(&next, response).await.unwrap() {
            ResponseAction::Continue(resp) => assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE),
            other => panic!("expected pass-through, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ignores_non_retryable_failures_and_opt_out() {
        let retry = RetryMiddleware::new();
        let request = Request::get("http://example.com/").unwrap();
        let opted_out = request.clone().with_meta(DONT_RETRY, true);

        assert!(matches!(
            retry
                .process_exception(&request, &SpiderError::ignored("robots"))
                .await
                .unwrap(),
            ExceptionAction::Pass
        ));
        assert!(matches!(
            retry.process_exception(&opted_out, &timeout()).await.unwrap(),
            ExceptionAction::Pass
        ));
    }
}
