#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use spider_intercept::error::TransportErrorKind;
use spider_intercept::{Request, Response, SpiderError, Transport};

#[derive(Clone)]
enum Reply {
    Respond {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    Fail(TransportErrorKind),
}

/// Transport answering from per-URL scripts.
///
/// Replies for a URL are consumed in order; the last one repeats. Unknown
/// URLs get a `404`.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, VecDeque<Reply>>>,
    seen: Mutex<Vec<Request>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Self::default()
        })
    }

    pub fn reply(&self, url: &str, status: u16, headers: &[(&str, &str)], body: &str) {
        self.push(
            url,
            Reply::Respond {
                status,
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                body: body.as_bytes().to_vec(),
            },
        );
    }

    pub fn fail(&self, url: &str, kind: TransportErrorKind) {
        self.push(url, Reply::Fail(kind));
    }

    fn push(&self, url: &str, reply: Reply) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received, in order.
    pub fn seen(&self) -> Vec<Request> {
        self.seen.lock().unwrap().clone()
    }

    fn next_reply(&self, url: &str) -> Option<Reply> {
        let mut routes = self.routes.lock().unwrap();
        let queue = routes.get_mut(url)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, request: &Request) -> Result<Response, SpiderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_reply(request.url.as_str()) {
            None => Ok(Response::new(request.url.clone(), StatusCode::NOT_FOUND)),
            Some(Reply::Fail(kind)) => Err(SpiderError::transport(kind, "scripted failure")),
            Some(Reply::Respond {
                status,
                headers,
                body,
            }) => {
                let mut response =
                    Response::new(request.url.clone(), StatusCode::from_u16(status).unwrap())
                        .with_body(body);
                for (name, value) in headers {
                    response = response.with_header(
                        HeaderName::from_bytes(name.as_bytes()).unwrap(),
                        HeaderValue::from_str(&value).unwrap(),
                    );
                }
                Ok(response)
            }
        }
    }
}
