//! Redirect handling.
//!
//! [`RedirectMiddleware`] follows HTTP 3xx responses carrying a `Location`
//! header, [`MetaRefreshMiddleware`] follows `<meta http-equiv="refresh">`
//! tags in HTML bodies. Both reschedule a copy of the original request aimed
//! at the new target and append `(url, reason)` to the redirect trail kept in
//! the request meta under [`REDIRECT_TRAIL`]. The reason is the numeric status
//! for HTTP redirects and [`META_REFRESH_REASON`] for meta refreshes.
//!
//! A request whose trail would grow past the configured maximum fails with
//! [`SpiderError::ProtocolViolation`]. That failure is terminal: the retry
//! middleware does not touch it.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION};
use http::{Method, StatusCode};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, trace};
use url::Url;

use crate::error::SpiderError;
use crate::middleware::{Middleware, ResponseAction};
use crate::request::Request;
use crate::response::Response;
use crate::stats::StatsCollector;

/// Meta key holding the `[[url, reason], ...]` trail.
pub const REDIRECT_TRAIL: &str = "redirect_trail";
/// Meta key holding the number of redirects followed so far.
pub const REDIRECT_TIMES: &str = "redirect_times";
/// Meta key disabling redirect handling for one request.
pub const DONT_REDIRECT: &str = "dont_redirect";
/// Meta key listing statuses the spider wants to see unprocessed.
pub const HANDLE_HTTPSTATUS_LIST: &str = "handle_httpstatus_list";
/// Meta key asking for every status to reach the spider unprocessed.
pub const HANDLE_HTTPSTATUS_ALL: &str = "handle_httpstatus_all";
/// Trail reason used for meta refresh redirects.
pub const META_REFRESH_REASON: &str = "meta refresh";

const DEFAULT_MAX_REDIRECTS: usize = 20;
const DEFAULT_PRIORITY_ADJUST: i32 = 2;
const FOLLOWED_SCHEMES: [&str; 2] = ["http", "https"];

/// Reads the redirect trail from `request` meta.
pub fn redirect_trail(request: &Request) -> Vec<(String, Value)> {
    request
        .meta
        .get(REDIRECT_TRAIL)
        .and_then(Value::as_array)
        .map(|hops| {
            hops.iter()
                .filter_map(|hop| match hop.as_array().map(Vec::as_slice) {
                    Some([url, reason]) => url.as_str().map(|u| (u.to_string(), reason.clone())),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn handles_status(request: &Request, status: StatusCode) -> bool {
    if request.meta_flag(HANDLE_HTTPSTATUS_ALL) {
        return true;
    }
    request
        .meta
        .get(HANDLE_HTTPSTATUS_LIST)
        .and_then(Value::as_array)
        .is_some_and(|codes| {
            codes
                .iter()
                .any(|c| c.as_u64() == Some(u64::from(status.as_u16())))
        })
}

/// Settings shared by both redirect middlewares.
#[derive(Debug, Clone)]
struct RedirectLimits {
    max_redirects: usize,
    priority_adjust: i32,
    stats: Option<Arc<StatsCollector>>,
}

impl Default for RedirectLimits {
    fn default() -> Self {
        Self {
            max_redirects: DEFAULT_MAX_REDIRECTS,
            priority_adjust: DEFAULT_PRIORITY_ADJUST,
            stats: None,
        }
    }
}

impl RedirectLimits {
    /// Copy of `source` aimed at `target`, with the trail extended by one hop.
    fn redirect(
        &self,
        source: &Request,
        target: Url,
        reason: Value,
        switch_to_get: bool,
    ) -> Result<Request, SpiderError> {
        let mut trail = redirect_trail(source);
        if trail.len() >= self.max_redirects {
            debug!(
                "Discarding {}: max redirections ({}) reached",
                source, self.max_redirects
            );
            if let Some(stats) = &self.stats {
                stats.inc("redirect/max_reached");
            }
            return Err(SpiderError::ProtocolViolation(format!(
                "max redirections ({}) reached for {}",
                self.max_redirects, source.url
            )));
        }
        trail.push((source.url.to_string(), reason));

        let host_changed = source.url.host_str() != target.host_str();
        let scheme_changed = source.url.scheme() != target.scheme();

        let mut redirected = source.clone().with_url(target);
        redirected.priority = source.priority.saturating_add(self.priority_adjust);
        redirected.meta.insert(
            REDIRECT_TRAIL.to_string(),
            Value::Array(
                trail
                    .iter()
                    .map(|(url, reason)| Value::Array(vec![Value::from(url.as_str()), reason.clone()]))
                    .collect(),
            ),
        );
        redirected
            .meta
            .insert(REDIRECT_TIMES.to_string(), Value::from(trail.len()));

        if host_changed {
            redirected.headers.remove(COOKIE);
        }
        if host_changed || scheme_changed {
            redirected.headers.remove(AUTHORIZATION);
        }
        if switch_to_get {
            redirected.method = Method::GET;
            redirected.body = Default::default();
            redirected.headers.remove(CONTENT_TYPE);
            redirected.headers.remove(CONTENT_LENGTH);
        }
        if let Some(stats) = &self.stats {
            stats.inc("redirect/count");
        }
        Ok(redirected)
    }
}

/// Follows HTTP redirects.
#[derive(Debug, Clone, Default)]
pub struct RedirectMiddleware {
    limits: RedirectLimits,
}

impl RedirectMiddleware {
    pub fn new() -> Self {
        let middleware = Self::default();
        info!("Initializing RedirectMiddleware with config: {:?}", middleware);
        middleware
    }

    /// Sets the maximum number of hops a single request may follow.
    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.limits.max_redirects = max_redirects;
        self
    }

    /// Sets the priority delta applied to redirected requests.
    pub fn priority_adjust(mut self, priority_adjust: i32) -> Self {
        self.limits.priority_adjust = priority_adjust;
        self
    }

    pub fn stats(mut self, stats: Arc<StatsCollector>) -> Self {
        self.limits.stats = Some(stats);
        self
    }
}

#[async_trait]
impl Middleware for RedirectMiddleware {
    fn name(&self) -> &str {
        "RedirectMiddleware"
    }

    async fn process_response(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<ResponseAction, SpiderError> {
        let status = response.status;
        if request.meta_flag(DONT_REDIRECT) || handles_status(request, status) {
            return Ok(ResponseAction::Continue(response));
        }
        if !matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308) {
            return Ok(ResponseAction::Continue(response));
        }
        let location = match response
            .headers
            .get(LOCATION)
            .map(|v| v.to_str().map(str::to_owned))
        {
            Some(Ok(location)) => location,
            Some(Err(e)) => {
                return Err(SpiderError::ProtocolViolation(format!(
                    "unreadable Location header: {}",
                    e
                )));
            }
            None => {
                trace!("{} response without Location for {}", status, request);
                return Ok(ResponseAction::Continue(response));
            }
        };
        let target = response.url.join(location.trim()).map_err(|e| {
            SpiderError::ProtocolViolation(format!(
                "malformed redirect target {:?} from {}: {}",
                location, response.url, e
            ))
        })?;
        if !FOLLOWED_SCHEMES.contains(&target.scheme()) {
            debug!("Not following redirect to unsupported scheme: {}", target);
            return Ok(ResponseAction::Continue(response));
        }

        let switch_to_get = match status.as_u16() {
            302 | 303 => request.method != Method::HEAD,
            301 => request.method == Method::POST,
            _ => false,
        };

        let redirected = self.limits.redirect(
            request,
            target,
            Value::from(status.as_u16()),
            switch_to_get,
        )?;
        debug!("Redirecting ({}) to {} from {}", status.as_u16(), redirected, request);
        Ok(ResponseAction::Reschedule(redirected))
    }
}

static NOSCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<noscript\b.*?</noscript\s*>").expect("valid noscript regex")
});
static META_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("valid meta regex"));
static ATTRIBUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z][a-z0-9_-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("valid attribute regex")
});
static REFRESH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)^\s*(\d*\.?\d+)\s*[;,]\s*(?:url\s*=\s*)?["']?([^"']*)["']?"#)
        .expect("valid refresh regex")
});

/// Extracts `(delay, url)` from the first refresh meta tag of an HTML body.
///
/// Tags inside `<noscript>` are ignored. Refresh tags without a URL do not
/// count as redirects.
pub fn meta_refresh(html: &str) -> Option<(f64, String)> {
    let html = NOSCRIPT_RE.replace_all(html, "");
    for tag in META_TAG_RE.find_iter(&html) {
        let mut http_equiv = None;
        let mut content = None;
        for caps in ATTRIBUTE_RE.captures_iter(tag.as_str()) {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match caps[1].to_ascii_lowercase().as_str() {
                "http-equiv" => http_equiv = Some(value.to_string()),
                "content" => content = Some(value.to_string()),
                _ => {}
            }
        }
        if !http_equiv.is_some_and(|v| v.trim().eq_ignore_ascii_case("refresh")) {
            continue;
        }
        let content = content?;
        let caps = REFRESH_RE.captures(&content)?;
        let delay = caps[1].parse::<f64>().ok()?;
        let url = caps[2].trim();
        if url.is_empty() {
            return None;
        }
        return Some((delay, url.to_string()));
    }
    None
}

const META_REFRESH_SCAN_BYTES: usize = 4096;

/// Follows `<meta http-equiv="refresh">` redirects in HTML responses.
#[derive(Debug, Clone)]
pub struct MetaRefreshMiddleware {
    limits: RedirectLimits,
    /// Refreshes with a delay at or above this are left alone.
    pub max_delay: Duration,
}

impl Default for MetaRefreshMiddleware {
    fn default() -> Self {
        Self {
            limits: RedirectLimits::default(),
            max_delay: Duration::from_secs(100),
        }
    }
}

impl MetaRefreshMiddleware {
    pub fn new() -> Self {
        let middleware = Self::default();
        info!(
            "Initializing MetaRefreshMiddleware with config: {:?}",
            middleware
        );
        middleware
    }

    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.limits.max_redirects = max_redirects;
        self
    }

    pub fn priority_adjust(mut self, priority_adjust: i32) -> Self {
        self.limits.priority_adjust = priority_adjust;
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn stats(mut self, stats: Arc<StatsCollector>) -> Self {
        self.limits.stats = Some(stats);
        self
    }
}

fn is_html(response: &Response) -> bool {
    response
        .header_str(CONTENT_TYPE)
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("html"))
}

#[async_trait]
impl Middleware for MetaRefreshMiddleware {
    fn name(&self) -> &str {
        "MetaRefreshMiddleware"
    }

    async fn process_response(
        &self,
        request: &Request,
        response: Response,
    ) -> Result<ResponseAction, SpiderError> {
        if request.meta_flag(DONT_REDIRECT) || request.method == Method::HEAD || !is_html(&response)
        {
            return Ok(ResponseAction::Continue(response));
        }

        let head = &response.body[..response.body.len().min(META_REFRESH_SCAN_BYTES)];
        let Some((delay, location)) = meta_refresh(&String::from_utf8_lossy(head)) else {
            return Ok(ResponseAction::Continue(response));
        };
        if delay >= self.max_delay.as_secs_f64() {
            trace!("Ignoring meta refresh after {}s on {}", delay, response.url);
            return Ok(ResponseAction::Continue(response));
        }

        let target = response.url.join(&location).map_err(|e| {
            SpiderError::ProtocolViolation(format!(
                "malformed meta refresh target {:?} on {}: {}",
                location, response.url, e
            ))
        })?;
        if !FOLLOWED_SCHEMES.contains(&target.scheme()) {
            return Ok(ResponseAction::Continue(response));
        }

        let redirected = self
            .limits
            .redirect(request, target, Value::from(META_REFRESH_REASON), true)?;
        debug!("Redirecting (meta refresh) to {} from {}", redirected, request);
        Ok(ResponseAction::Reschedule(redirected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn redirect_response(request: &Request, status: u16, location: &str) -> Response {
        Response::new(request.url.clone(), StatusCode::from_u16(status).unwrap())
            .with_header(LOCATION, HeaderValue::from_str(location).unwrap())
    }

    async fn follow(mw: &RedirectMiddleware, request: &Request, status: u16, location: &str) -> Request {
        match mw
            .process_response(request, redirect_response(request, status, location))
            .await
            .unwrap()
        {
            ResponseAction::Reschedule(next) => next,
            other => panic!("expected redirect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn post_is_switched_to_get_on_302_but_kept_on_307() {
        let mw = RedirectMiddleware::new();
        let request = Request::get("http://example.com/form")
            .unwrap()
            .with_method(Method::POST)
            .with_body("a=1")
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/x-www-form-urlencoded"));

        let get = follow(&mw, &request, 302, "/done").await;
        assert_eq!(get.method, Method::GET);
        assert!(get.body.is_empty());
        assert!(get.headers.get(CONTENT_TYPE).is_none());
        assert_eq!(get.url.as_str(), "http://example.com/done");

        let kept = follow(&mw, &request, 307, "/again").await;
        assert_eq!(kept.method, Method::POST);
        assert_eq!(&kept.body[..], b"a=1");
    }

    #[tokio::test]
    async fn cross_host_redirect_drops_credentials() {
        let mw = RedirectMiddleware::new();
        let request = Request::get("https://example.com/")
            .unwrap()
            .with_header(COOKIE, HeaderValue::from_static("a=b"))
            .with_header(AUTHORIZATION, HeaderValue::from_static("Bearer x"));

        let same = follow(&mw, &request, 301, "/home").await;
        assert!(same.headers.contains_key(COOKIE));
        assert!(same.headers.contains_key(AUTHORIZATION));

        let other = follow(&mw, &request, 301, "https://other.org/").await;
        assert!(!other.headers.contains_key(COOKIE));
        assert!(!other.headers.contains_key(AUTHORIZATION));
    }

    #[tokio::test]
    async fn honours_opt_outs() {
        let mw = RedirectMiddleware::new();
        let base = Request::get("http://example.com/").unwrap();
        for request in [
            base.clone().with_meta(DONT_REDIRECT, true),
            base.clone().with_meta(HANDLE_HTTPSTATUS_ALL, true),
            base.clone().with_meta(HANDLE_HTTPSTATUS_LIST, serde_json::json!([301])),
        ] {
            let response = redirect_response(&request, 301, "/elsewhere");
            assert!(matches!(
                mw.process_response(&request, response).await.unwrap(),
                ResponseAction::Continue(_)
            ));
        }
    }

    #[tokio::test]
    async fn malformed_location_is_a_protocol_violation() {
        let mw = RedirectMiddleware::new();
        let request = Request::get("http://example.com/").unwrap();
        let response = redirect_response(&request, 302, "http://[::1");

        let err = mw.process_response(&request, response).await.unwrap_err();
        assert!(matches!(err, SpiderError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn non_http_targets_are_left_alone() {
        let mw = RedirectMiddleware::new();
        let request = Request::get("http://example.com/").unwrap();
        for location in ["file:///etc/passwd", "ftp://example.com/x", "data:text/plain,hi"] {
            let response = redirect_response(&request, 302, location);
            assert!(matches!(
                mw.process_response(&request, response).await.unwrap(),
                ResponseAction::Continue(_)
            ));
        }

        let refresh = MetaRefreshMiddleware::new();
        let page = Response::new(request.url.clone(), StatusCode::OK)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/html"))
            .with_body(r#"<meta http-equiv="refresh" content="0;url=file:///etc/passwd">"#);
        assert!(matches!(
            refresh.process_response(&request, page).await.unwrap(),
            ResponseAction::Continue(_)
        ));
    }

    #[tokio::test]
    async fn relative_location_resolves_against_response_url() {
        let mw = RedirectMiddleware::new();
        let request = Request::get("http://example.com/start").unwrap();
        let response = Response::new(Url::parse("http://cdn.example.com/dir/page").unwrap(), StatusCode::FOUND)
            .with_header(LOCATION, HeaderValue::from_static("next"));

        match mw.process_response(&request, response).await.unwrap() {
            ResponseAction::Reschedule(next) => {
                assert_eq!(next.url.as_str(), "http://cdn.example.com/dir/next")
            }
            other => panic!("expected redirect, got {other:?}"),
        }
    }

    #[test]
    fn parses_meta_refresh_tags() {
        assert_eq!(
            meta_refresh(r#"<html><head><meta http-equiv="refresh" content="5; url=/next"></head>"#),
            Some((5.0, "/next".to_string()))
        );
        assert_eq!(
            meta_refresh(r#"<META CONTENT='0;URL="http://example.org/"' HTTP-EQUIV=Refresh>"#),
            Some((0.0, "http://example.org/".to_string()))
        );
        assert_eq!(
            meta_refresh(r#"<noscript><meta http-equiv="refresh" content="0;url=/js"></noscript>"#),
            None
        );
        assert_eq!(meta_refresh(r#"<meta http-equiv="refresh" content="30">"#), None);
        assert_eq!(meta_refresh(r#"<meta charset="utf-8">"#), None);
    }

    #[tokio::test]
    async fn meta_refresh_redirects_html_below_max_delay() {
        let mw = MetaRefreshMiddleware::new().max_delay(Duration::from_secs(10));
        let request = Request::get("http://example.com/a/").unwrap();
        let html = |delay: u32| {
            Response::new(request.url.clone(), StatusCode::OK)
                .with_header(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"))
                .with_body(format!(
                    r#"<meta http-equiv="refresh" content="{delay};url=b.html">"#
                ))
        };

        match mw.process_response(&request, html(1)).await.unwrap() {
            ResponseAction::Reschedule(next) => {
                assert_eq!(next.url.as_str(), "http://example.com/a/b.html");
                assert_eq!(
                    redirect_trail(&next),
                    vec![(
                        "http://example.com/a/".to_string(),
                        Value::from(META_REFRESH_REASON)
                    )]
                );
            }
            other => panic!("expected redirect, got {other:?}"),
        }
        assert!(matches!(
            mw.process_response(&request, html(60)).await.unwrap(),
            ResponseAction::Continue(_)
        ));
    }
}
