//! The ordered middleware chain and its three phase runners.
//!
//! Registrations are sorted once by order key (ties broken by name) and never
//! change afterwards. The request phase walks them in ascending order, the
//! response and exception phases walk them in descending order, so the
//! middleware with the smallest key sits closest to the engine and the one
//! with the largest key closest to the transport.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{Failure, SpiderError};
use crate::middleware::{ExceptionAction, Middleware, RequestAction, ResponseAction};
use crate::request::Request;
use crate::response::Response;

/// A middleware together with its position in the chain.
#[derive(Clone)]
pub struct Registration {
    name: String,
    order: i32,
    middleware: Arc<dyn Middleware>,
}

impl Registration {
    pub fn new(name: impl Into<String>, order: i32, middleware: Arc<dyn Middleware>) -> Self {
        Self {
            name: name.into(),
            order,
            middleware,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn middleware(&self) -> &Arc<dyn Middleware> {
        &self.middleware
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("order", &self.order)
            .field("middleware", &self.middleware.name())
            .finish()
    }
}

/// Result of running one phase of the chain.
#[derive(Debug)]
pub enum Outcome {
    /// Every request hook passed; send this request to the transport.
    Continue(Request),
    /// A final (or short-circuit) response.
    Respond(Response),
    /// A new request for the scheduler.
    Reschedule(Request),
    /// A failure nobody recovered from. From the exception phase this means
    /// the failure is unhandled.
    Fail(Failure),
}

/// Immutable, ordered list of middlewares.
#[derive(Debug, Clone, Default)]
pub struct MiddlewareChain {
    entries: Vec<Registration>,
}

impl MiddlewareChain {
    pub fn new(mut entries: Vec<Registration>) -> Self {
        entries.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
        debug!(
            "Assembled middleware chain: {:?}",
            entries
                .iter()
                .map(|e| format!("{}={}", e.name, e.order))
                .collect::<Vec<_>>()
        );
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registrations in request-phase order.
    pub fn entries(&self) -> &[Registration] {
        &self.entries
    }

    /// Names in request-phase order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// Runs every middleware's session start hook, in ascending order.
    pub async fn open(&self) -> Result<(), SpiderError> {
        for entry in &self.entries {
            trace!("Opening middleware {}", entry.name);
            entry.middleware.open().await?;
        }
        Ok(())
    }

    /// Runs every middleware's session end hook, in descending order.
    ///
    /// All hooks run even if one fails; the first error is returned.
    pub async fn close(&self) -> Result<(), SpiderError> {
        let mut first_error = None;
        for entry in self.entries.iter().rev() {
            trace!("Closing middleware {}", entry.name);
            if let Err(e) = entry.middleware.close().await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs request hooks in ascending order.
    pub async fn process_request(&self, mut request: Request) -> Outcome {
        for entry in &self.entries {
            trace!("{} process_request {}", entry.name, request);
            let fallback = request.clone();
            match entry.middleware.process_request(request).await {
                Ok(RequestAction::Continue(next)) => request = next,
                Ok(RequestAction::Respond(response)) => {
                    debug!("{} answered {} without download", entry.name, fallback);
                    return Outcome::Respond(response);
                }
                Ok(RequestAction::Reschedule(next)) => {
                    debug!("{} rescheduled {} as {}", entry.name, fallback, next);
                    return Outcome::Reschedule(next);
                }
                Err(error) => {
                    debug!("{} failed {}: {}", entry.name, fallback, error);
                    return Outcome::Fail(Failure::new(error, fallback));
                }
            }
        }
        Outcome::Continue(request)
    }

    /// Runs response hooks in descending order.
    pub async fn process_response(&self, request: &Request, mut response: Response) -> Outcome {
        for entry in self.entries.iter().rev() {
            trace!(
                "{} process_response {} ({})",
                entry.name, request, response.status
            );
            match entry.middleware.process_response(request, response).await {
                Ok(ResponseAction::Continue(next)) => response = next,
                Ok(ResponseAction::Reschedule(next)) => {
                    debug!("{} rescheduled {} as {}", entry.name, request, next);
                    return Outcome::Reschedule(next);
                }
                Err(error) => {
                    debug!("{} failed response for {}: {}", entry.name, request, error);
                    return Outcome::Fail(Failure::new(error, request.clone()));
                }
            }
        }
        Outcome::Respond(response)
    }

    /// Runs exception hooks in descending order until one claims the failure.
    pub async fn process_exception(&self, failure: Failure) -> Outcome {
        for entry in self.entries.iter().rev() {
            trace!("{} process_exception {}", entry.name, failure);
            match entry
                .middleware
                .process_exception(&failure.request, &failure.error)
                .await
            {
                Ok(ExceptionAction::Pass) => continue,
                Ok(ExceptionAction::Respond(response)) => {
                    debug!("{} recovered {} with a response", entry.name, failure);
                    return Outcome::Respond(response);
                }
                Ok(ExceptionAction::Reschedule(next)) => {
                    debug!("{} rescheduled {} as {}", entry.name, failure, next);
                    return Outcome::Reschedule(next);
                }
                Err(error) => {
                    debug!("{} replaced failure {} with {}", entry.name, failure, error);
                    return Outcome::Fail(Failure::new(error, failure.request));
                }
            }
        }
        Outcome::Fail(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use http::StatusCode;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Probe {
        name: String,
        log: Log,
        respond: bool,
        fail: bool,
    }

    impl Probe {
        fn new(name: &str, log: &Log) -> Self {
            Self {
                name: name.to_string(),
                log: log.clone(),
                respond: false,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Middleware for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        async fn process_request(&self, request: Request) -> Result<RequestAction, SpiderError> {
            self.log.lock().unwrap().push(format!("req:{}", self.name));
            if self.fail {
                return Err(SpiderError::ignored("probe"));
            }
            if self.respond {
                return Ok(RequestAction::Respond(Response::new(
                    request.url.clone(),
                    StatusCode::OK,
                )));
            }
            Ok(RequestAction::Continue(request))
        }

        async fn process_response(
            &self,
            _request: &Request,
            response: Response,
        ) -> Result<ResponseAction, SpiderError> {
            self.log.lock().unwrap().push(format!("resp:{}", self.name));
            Ok(ResponseAction::Continue(response))
        }

        async fn process_exception(
            &self,
            _request: &Request,
            _error: &SpiderError,
        ) -> Result<ExceptionAction, SpiderError> {
            self.log.lock().unwrap().push(format!("exc:{}", self.name));
            Ok(ExceptionAction::Pass)
        }
    }

    fn chain(probes: Vec<(i32, Probe)>) -> MiddlewareChain {
        MiddlewareChain::new(
            probes
                .into_iter()
                .map(|(order, p)| Registration::new(p.name.clone(), order, Arc::new(p)))
                .collect(),
        )
    }

    #[tokio::test]
    async fn registration_order_is_sorted_by_key_then_name() {
        let log = Log::default();
        let chain = chain(vec![
            (900, Probe::new("cache", &log)),
            (100, Probe::new("robots", &log)),
            (550, Probe::new("retry", &log)),
            (550, Probe::new("alpha", &log)),
        ]);

        assert_eq!(chain.names(), vec!["robots", "alpha", "retry", "cache"]);
    }

    #[tokio::test]
    async fn request_hook_failure_keeps_the_request() {
        let log = Log::default();
        let mut failing = Probe::new("b", &log);
        failing.fail = true;
        let chain = chain(vec![
            (1, Probe::new("a", &log)),
            (2, failing),
            (3, Probe::new("c", &log)),
        ]);

        let request = Request::get("http://example.com/x").unwrap();
        match chain.process_request(request).await {
            Outcome::Fail(failure) => {
                assert!(failure.error.is_ignored());
                assert_eq!(failure.request.url.as_str(), "http://example.com/x");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(*log.lock().unwrap(), vec!["req:a", "req:b"]);
    }

    #[tokio::test]
    async fn unclaimed_exception_is_returned_as_fail() {
        let log = Log::default();
        let chain = chain(vec![(1, Probe::new("a", &log)), (2, Probe::new("b", &log))]);
        let request = Request::get("http://example.com/").unwrap();

        let outcome = chain
            .process_exception(Failure::new(SpiderError::ignored("x"), request))
            .await;

        assert!(matches!(outcome, Outcome::Fail(_)));
        assert_eq!(*log.lock().unwrap(), vec!["exc:b", "exc:a"]);
    }
}
