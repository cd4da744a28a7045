//! Drives one request through the chain and the transport.
//!
//! [`Dispatcher::download`] composes the three phases of the chain around a
//! [`Transport`] call:
//!
//! 1. request hooks (ascending); a short-circuit response skips the transport,
//! 2. the transport, unless short-circuited,
//! 3. response hooks (descending) for a response, or exception hooks
//!    (descending) for a failure. An exception hook that recovers with a
//!    response hands it to the response hooks.
//!
//! Failures nobody recovered from are routed once: to the request's errback
//! if it has one, otherwise [`FailureKind::Ignored`] failures are dropped
//! quietly and every other kind is logged as an error. Abandoned requests are
//! checked after every suspension point and never reach an errback.
//!
//! [`Dispatcher::run`] is a small scheduler: a priority queue drained with a
//! bounded number of downloads in flight, feeding reschedules back in.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, error, trace};

use crate::chain::{MiddlewareChain, Outcome};
use crate::error::{Failure, FailureKind, SpiderError};
use crate::request::Request;
use crate::response::Response;
use crate::transport::Transport;

/// How a download ended.
#[derive(Debug)]
pub enum DownloadOutcome {
    /// A final response, with the request it answers attached.
    Response(Response),
    /// A new request for the scheduler (retry, redirect, ...).
    Reschedule(Request),
    /// A failure nobody recovered from. It has already been routed.
    Failed(Failure),
    /// The request was abandoned while in flight.
    Abandoned(Request),
}

enum Phase {
    Response(Request, Response),
    Exception(Failure),
}

pub struct Dispatcher {
    chain: Arc<MiddlewareChain>,
    transport: Arc<dyn Transport>,
}

impl Dispatcher {
    pub fn new(chain: Arc<MiddlewareChain>, transport: Arc<dyn Transport>) -> Self {
        Self { chain, transport }
    }

    pub fn chain(&self) -> &Arc<MiddlewareChain> {
        &self.chain
    }

    /// Starts the crawl session for every middleware.
    pub async fn open(&self) -> Result<(), SpiderError> {
        self.chain.open().await
    }

    /// Ends the crawl session for every middleware.
    pub async fn close(&self) -> Result<(), SpiderError> {
        self.chain.close().await
    }

    pub async fn download(&self, request: Request) -> DownloadOutcome {
        if request.is_abandoned() {
            return DownloadOutcome::Abandoned(request);
        }

        let outcome = self.chain.process_request(request.clone()).await;
        if request.is_abandoned() {
            return DownloadOutcome::Abandoned(request);
        }

        let phase = match outcome {
            Outcome::Continue(prepared) => {
                trace!("Fetching {}", prepared);
                let fetched = self.transport.fetch(&prepared).await;
                if prepared.is_abandoned() {
                    return DownloadOutcome::Abandoned(prepared);
                }
                match fetched {
                    Ok(response) => Phase::Response(prepared, response),
                    Err(error) => Phase::Exception(Failure::new(error, prepared)),
                }
            }
            Outcome::Respond(response) => Phase::Response(request, response),
            Outcome::Reschedule(next) => return DownloadOutcome::Reschedule(next),
            Outcome::Fail(failure) => Phase::Exception(failure),
        };

        let (request, response) = match phase {
            Phase::Response(request, response) => (request, response),
            Phase::Exception(failure) => {
                let request = failure.request.clone();
                let outcome = self.chain.process_exception(failure).await;
                if request.is_abandoned() {
                    return DownloadOutcome::Abandoned(request);
                }
                match outcome {
                    Outcome::Respond(response) => (request, response),
                    Outcome::Reschedule(next) | Outcome::Continue(next) => {
                        return DownloadOutcome::Reschedule(next);
                    }
                    Outcome::Fail(failure) => return self.fail(failure),
                }
            }
        };

        let outcome = self.chain.process_response(&request, response).await;
        if request.is_abandoned() {
            return DownloadOutcome::Abandoned(request);
        }
        match outcome {
            Outcome::Respond(response) => DownloadOutcome::Response(response.with_request(request)),
            Outcome::Reschedule(next) | Outcome::Continue(next) => DownloadOutcome::Reschedule(next),
            Outcome::Fail(failure) => self.fail(failure),
        }
    }

    fn fail(&self, failure: Failure) -> DownloadOutcome {
        if failure.request.is_abandoned() {
            return DownloadOutcome::Abandoned(failure.request);
        }
        self.route_failure(&failure);
        DownloadOutcome::Failed(failure)
    }

    /// Delivers an unhandled failure to its errback, or logs it.
    pub fn route_failure(&self, failure: &Failure) {
        if failure.request.is_abandoned() {
            return;
        }
        if let Some(errback) = failure.request.errback() {
            errback(failure);
            return;
        }
        match failure.kind() {
            FailureKind::Ignored => debug!("Ignoring {}", failure),
            _ => error!("Error downloading {}", failure),
        }
    }

    /// Downloads `requests` and everything rescheduled from them.
    ///
    /// Higher priority requests start first; equal priorities keep their
    /// arrival order. At most `concurrency` downloads are in flight.
    pub async fn run<I>(&self, requests: I, concurrency: usize) -> RunReport
    where
        I: IntoIterator<Item = Request>,
    {
        let mut queue = BinaryHeap::new();
        let mut sequence = 0u64;
        for request in requests {
            queue.push(Queued::new(request, &mut sequence));
        }

        let mut report = RunReport::default();
        let mut in_flight = FuturesUnordered::new();
        loop {
            while in_flight.len() < concurrency.max(1) {
                let Some(queued) = queue.pop() else {
                    break;
                };
                in_flight.push(self.download(queued.request));
            }
            let Some(outcome) = in_flight.next().await else {
                break;
            };
            match outcome {
                DownloadOutcome::Response(response) => report.responses.push(response),
                DownloadOutcome::Reschedule(request) => {
                    report.rescheduled += 1;
                    queue.push(Queued::new(request, &mut sequence));
                }
                DownloadOutcome::Failed(failure) => report.failures.push(failure),
                DownloadOutcome::Abandoned(_) => report.abandoned += 1,
            }
        }
        debug!(
            "Run finished: {} responses, {} failures, {} rescheduled, {} abandoned",
            report.responses.len(),
            report.failures.len(),
            report.rescheduled,
            report.abandoned
        );
        report
    }
}

/// What [`Dispatcher::run`] produced.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Final responses in completion order.
    pub responses: Vec<Response>,
    pub failures: Vec<Failure>,
    pub rescheduled: usize,
    pub abandoned: usize,
}

struct Queued {
    priority: i32,
    sequence: u64,
    request: Request,
}

impl Queued {
    fn new(request: Request, sequence: &mut u64) -> Self {
        *sequence += 1;
        Self {
            priority: request.priority,
            sequence: *sequence,
            request,
        }
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: higher priority first, then lower sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}
