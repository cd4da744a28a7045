//! Core `Middleware` trait and the per-phase actions it returns.
//!
//! A middleware may take part in any subset of the three phases a download
//! goes through. The defaults pass everything along untouched, so an
//! implementation only overrides the hooks it cares about.
//!
//! - [`Middleware::process_request`] runs before the transport, in ascending
//!   order of the chain.
//! - [`Middleware::process_response`] runs on the way back, in descending order.
//! - [`Middleware::process_exception`] runs, also descending, when the
//!   transport or a request hook fails.
//!
//! Hooks take `&self`: one chain instance is shared by every request in
//! flight, so middlewares keep their mutable state behind interior
//! mutability.

use async_trait::async_trait;

use crate::error::SpiderError;
use crate::request::Request;
use crate::response::Response;

/// What a request hook wants to happen next.
#[derive(Debug)]
pub enum RequestAction {
    /// Hand the request, possibly annotated, to the next hook.
    Continue(Request),
    /// Answer without calling the transport. The response enters the
    /// response phase.
    Respond(Response),
    /// Stop here and send a new request back to the scheduler.
    Reschedule(Request),
}

/// What a response hook wants to happen next.
#[derive(Debug)]
pub enum ResponseAction {
    /// Hand the response, possibly replaced, to the next hook.
    Continue(Response),
    /// Drop the response and send a new request back to the scheduler.
    Reschedule(Request),
}

/// What an exception hook wants to happen next.
#[derive(Debug)]
pub enum ExceptionAction {
    /// Not handled here; offer the failure to the next hook.
    Pass,
    /// Recover with a response, which enters the response phase.
    Respond(Response),
    /// Recover by sending a new request back to the scheduler.
    Reschedule(Request),
}

/// A trait for intercepting requests, responses and failures.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Called once when the crawl session starts.
    async fn open(&self) -> Result<(), SpiderError> {
        Ok(())
    }

    /// Called once when the crawl session ends.
    async fn close(&self) -> Result<(), SpiderError> {
        Ok(())
    }

    async fn process_request(&self, request: Request) -> Result<RequestAction, SpiderError> {
        Ok(RequestAction::Continue(request))
    }

    async fn process_response(
        &self,
        _request: &Request,
        response: Response,
    ) -> Result<ResponseAction, SpiderError> {
        Ok(ResponseAction::Continue(response))
    }

    async fn process_exception(
        &self,
        _request: &Request,
        _error: &SpiderError,
    ) -> Result<ExceptionAction, SpiderError> {
        Ok(ExceptionAction::Pass)
    }
}
