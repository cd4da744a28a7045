//! Cache policies: what gets stored and when a stored response may be reused.
//!
//! [`DummyPolicy`] stores everything and never expires it, which is what
//! replaying a crawl offline wants. [`Rfc2616Policy`] follows HTTP/1.1
//! freshness and validation rules: it honours `Cache-Control`, `Expires`,
//! `Age` and `Last-Modified`, and revalidates stale entries with conditional
//! requests.
//!
//! `Pragma: no-cache`, `Vary` and invalidation on unsafe methods are not
//! implemented.

use std::fmt::Debug;
use std::time::{Duration, SystemTime};

use http::header::{
    AGE, DATE, ETAG, EXPIRES, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use http::StatusCode;

use super::control::CacheControl;
use crate::request::Request;
use crate::response::Response;

const ONE_YEAR: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Decides what the HTTP cache stores and whether stored responses are usable.
pub trait CachePolicy: Send + Sync + Debug {
    /// Whether the cache should be consulted and filled for `request`.
    fn should_cache_request(&self, request: &Request) -> bool;

    /// Whether `response` to `request` may be stored.
    fn should_cache_response(&self, request: &Request, response: &Response) -> bool;

    /// Whether the stored response can be served for `request` as is.
    fn is_cached_response_valid(
        &self,
        cached_request: &Request,
        cached_response: &Response,
        request: &Request,
    ) -> bool;

    /// `request` with the validators needed to revalidate `cached_response`.
    fn revalidation_request(&self, cached_response: &Response, request: Request) -> Request;

    /// Whether `new_response` to a revalidation confirms `cached_response`.
    fn is_revalidation_valid(
        &self,
        cached_response: &Response,
        new_response: &Response,
        request: &Request,
    ) -> bool;
}

/// Stores everything, reuses everything.
#[derive(Debug, Clone, Default)]
pub struct DummyPolicy {
    ignore_schemes: Vec<String>,
    ignore_http_codes: Vec<u16>,
}

impl DummyPolicy {
    pub fn new() -> Self {
        Self {
            ignore_schemes: vec!["file".to_string()],
            ignore_http_codes: Vec::new(),
        }
    }

    pub fn ignore_schemes(mut self, schemes: Vec<String>) -> Self {
        self.ignore_schemes = schemes;
        self
    }

    pub fn ignore_http_codes(mut self, codes: Vec<u16>) -> Self {
        self.ignore_http_codes = codes;
        self
    }
}

impl CachePolicy for DummyPolicy {
    fn should_cache_request(&self, request: &Request) -> bool {
        !self
            .ignore_schemes
            .iter()
            .any(|s| s == request.url.scheme())
    }

    fn should_cache_response(&self, _request: &Request, response: &Response) -> bool {
        !self.ignore_http_codes.contains(&response.status.as_u16())
    }

    fn is_cached_response_valid(&self, _: &Request, _: &Response, _: &Request) -> bool {
        true
    }

    fn revalidation_request(&self, _cached_response: &Response, request: Request) -> Request {
        request
    }

    fn is_revalidation_valid(&self, _: &Response, _: &Response, _: &Request) -> bool {
        true
    }
}

/// HTTP/1.1 caching semantics.
#[derive(Debug, Clone)]
pub struct Rfc2616Policy {
    ignore_schemes: Vec<String>,
    always_store: bool,
    /// Response `Cache-Control` directives to disregard, e.g. `no-store`.
    ignore_response_cache_controls: Vec<String>,
}

impl Default for Rfc2616Policy {
    fn default() -> Self {
        Self {
            ignore_schemes: vec!["file".to_string()],
            always_store: false,
            ignore_response_cache_controls: Vec::new(),
        }
    }
}

fn header_time(response: &Response, name: http::header::HeaderName) -> Option<SystemTime> {
    response
        .header_str(name)
        .and_then(|v| httpdate::parse_http_date(v.trim()).ok())
}

fn since(later: SystemTime, earlier: SystemTime) -> Duration {
    later.duration_since(earlier).unwrap_or(Duration::ZERO)
}

impl Rfc2616Policy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ignore_schemes(mut self, schemes: Vec<String>) -> Self {
        self.ignore_schemes = schemes;
        self
    }

    /// Store responses even when the rules say they are not cacheable.
    pub fn always_store(mut self, always_store: bool) -> Self {
        self.always_store = always_store;
        self
    }

    pub fn ignore_response_cache_controls(mut self, directives: Vec<String>) -> Self {
        self.ignore_response_cache_controls = directives
            .into_iter()
            .map(|d| d.to_ascii_lowercase())
            .collect();
        self
    }

    fn response_cache_control(&self, response: &Response) -> CacheControl {
        let mut cc = CacheControl::from_headers(&response.headers);
        for directive in &self.ignore_response_cache_controls {
            cc.remove(directive);
        }
        cc
    }

    /// How long `response` stays fresh after its `Date`.
    pub fn freshness_lifetime(&self, response: &Response, now: SystemTime) -> Duration {
        let cc = self.response_cache_control(response);
        if let Some(max_age) = cc.max_age() {
            return Duration::from_secs(max_age);
        }

        let date = header_time(response, DATE).unwrap_or(now);

        if response.headers.contains_key(EXPIRES) {
            // An unparsable Expires means already expired.
            return header_time(response, EXPIRES)
                .map(|expires| since(expires, date))
                .unwrap_or(Duration::ZERO);
        }

        if let Some(last_modified) = header_time(response, LAST_MODIFIED)
            && last_modified <= date
        {
            return since(date, last_modified) / 10;
        }

        if matches!(response.status.as_u16(), 300 | 301 | 308) {
            return ONE_YEAR;
        }
        Duration::ZERO
    }

    /// Age of `response` at `now`: the larger of `Age` and the time since `Date`.
    pub fn current_age(&self, response: &Response, now: SystemTime) -> Duration {
        let date = header_time(response, DATE).unwrap_or(now);
        let apparent = since(now, date);
        let age = response
            .header_str(AGE)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);
        apparent.max(age)
    }

    /// Freshness check against an explicit clock.
    pub fn is_fresh_at(&self, cached_response: &Response, request: &Request, now: SystemTime) -> bool {
        let cc = self.response_cache_control(cached_response);
        let request_cc = CacheControl::from_headers(&request.headers);
        if cc.no_cache() || request_cc.no_cache() {
            return false;
        }

        let mut lifetime = self.freshness_lifetime(cached_response, now);
        let age = self.current_age(cached_response, now);

        if let Some(max_age) = request_cc.max_age() {
            lifetime = lifetime.min(Duration::from_secs(max_age));
        }
        if age < lifetime {
            return true;
        }

        if !cc.must_revalidate() {
            match request_cc.max_stale() {
                Some(None) => return true,
                Some(Some(stale)) => {
                    // A tolerance past the representable range accepts any staleness.
                    let limit = lifetime.checked_add(Duration::from_secs(stale));
                    if limit.is_none_or(|limit| age < limit) {
                        return true;
                    }
                }
                None => {}
            }
        }
        false
    }
}

impl CachePolicy for Rfc2616Policy {
    fn should_cache_request(&self, request: &Request) -> bool {
        if self.ignore_schemes.iter().any(|s| s == request.url.scheme()) {
            return false;
        }
        !CacheControl::from_headers(&request.headers).no_store()
    }

    fn should_cache_response(&self, _request: &Request, response: &Response) -> bool {
        let cc = self.response_cache_control(response);
        let status = response.status.as_u16();
        if cc.no_store() || response.status == StatusCode::NOT_MODIFIED {
            return false;
        }
        if self.always_store {
            return true;
        }
        if cc.max_age().is_some() || response.headers.contains_key(EXPIRES) {
            return true;
        }
        match status {
            300 | 301 | 308 => true,
            200 | 203 | 401 => {
                response.headers.contains_key(LAST_MODIFIED) || response.headers.contains_key(ETAG)
            }
            _ => false,
        }
    }

    fn is_cached_response_valid(
        &self,
        _cached_request: &Request,
        cached_response: &Response,
        request: &Request,
    ) -> bool {
        self.is_fresh_at(cached_response, request, SystemTime::now())
    }

    fn revalidation_request(&self, cached_response: &Response, mut request: Request) -> Request {
        if let Some(last_modified) = cached_response.headers.get(LAST_MODIFIED) {
            request
                .headers
                .insert(IF_MODIFIED_SINCE, last_modified.clone());
        }
        if let Some(etag) = cached_response.headers.get(ETAG) {
            request.headers.insert(IF_NONE_MATCH, etag.clone());
        }
        request
    }

    fn is_revalidation_valid(
        &self,
        cached_response: &Response,
        new_response: &Response,
        _request: &Request,
    ) -> bool {
        // Serve the stale copy rather than a server error, unless told not to.
        if new_response.status.is_server_error()
            && !self.response_cache_control(cached_response).must_revalidate()
        {
            return true;
        }
        new_response.status == StatusCode::NOT_MODIFIED
    }
}

/// Current time as an HTTP `Date` header value.
pub fn http_date_now() -> HeaderValue {
    // Formatted dates are plain ASCII.
    HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now()))
        .unwrap_or_else(|_| HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CACHE_CONTROL;

    fn at(now: SystemTime) -> HeaderValue {
        HeaderValue::from_str(&httpdate::fmt_http_date(now)).unwrap()
    }

    fn request() -> Request {
        Request::get("http://example.com/").unwrap()
    }

    fn response(status: u16) -> Response {
        Response::new(request().url, StatusCode::from_u16(status).unwrap())
    }

    #[test]
    fn max_age_freshness_window() {
        let policy = Rfc2616Policy::new();
        let stored = SystemTime::now();
        let cached = response(200)
            .with_header(DATE, at(stored))
            .with_header(CACHE_CONTROL, HeaderValue::from_static("max-age=100"));

        assert!(policy.is_fresh_at(&cached, &request(), stored + Duration::from_secs(50)));
        assert!(!policy.is_fresh_at(&cached, &request(), stored + Duration::from_secs(150)));
    }

    #[test]
    fn age_header_counts_when_larger() {
        let policy = Rfc2616Policy::new();
        let now = SystemTime::now();
        let cached = response(200)
            .with_header(DATE, at(now))
            .with_header(AGE, HeaderValue::from_static("120"))
            .with_header(CACHE_CONTROL, HeaderValue::from_static("max-age=100"));

        assert_eq!(policy.current_age(&cached, now), Duration::from_secs(120));
        assert!(!policy.is_fresh_at(&cached, &request(), now));
    }

    #[test]
    fn lifetime_fallbacks() {
        let policy = Rfc2616Policy::new();
        let now = SystemTime::now();

        let expires = response(200)
            .with_header(DATE, at(now))
            .with_header(EXPIRES, at(now + Duration::from_secs(600)));
        assert_eq!(policy.freshness_lifetime(&expires, now), Duration::from_secs(600));

        let bad_expires = response(200)
            .with_header(DATE, at(now))
            .with_header(EXPIRES, HeaderValue::from_static("0"));
        assert_eq!(policy.freshness_lifetime(&bad_expires, now), Duration::ZERO);

        let heuristic = response(200)
            .with_header(DATE, at(now))
            .with_header(LAST_MODIFIED, at(now - Duration::from_secs(1000)));
        assert_eq!(policy.freshness_lifetime(&heuristic, now), Duration::from_secs(100));

        let permanent = response(301).with_header(DATE, at(now));
        assert_eq!(policy.freshness_lifetime(&permanent, now), ONE_YEAR);

        assert_eq!(policy.freshness_lifetime(&response(200), now), Duration::ZERO);
    }

    #[test]
    fn request_directives_override_freshness() {
        let policy = Rfc2616Policy::new();
        let stored = SystemTime::now();
        let cached = response(200)
            .with_header(DATE, at(stored))
            .with_header(CACHE_CONTROL, HeaderValue::from_static("max-age=100"));
        let later = stored + Duration::from_secs(150);

        let no_cache = request().with_header(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        assert!(!policy.is_fresh_at(&cached, &no_cache, stored));

        let capped = request().with_header(CACHE_CONTROL, HeaderValue::from_static("max-age=10"));
        assert!(!policy.is_fresh_at(&cached, &capped, stored + Duration::from_secs(20)));

        let stale_ok = request().with_header(CACHE_CONTROL, HeaderValue::from_static("max-stale=100"));
        assert!(policy.is_fresh_at(&cached, &stale_ok, later));

        let any_stale = request().with_header(CACHE_CONTROL, HeaderValue::from_static("max-stale"));
        assert!(policy.is_fresh_at(&cached, &any_stale, later + ONE_YEAR));

        let strict = cached
            .clone()
            .with_header(CACHE_CONTROL, HeaderValue::from_static("must-revalidate"));
        assert!(!policy.is_fresh_at(&strict, &any_stale, later));
    }

    #[test]
    fn huge_max_stale_accepts_any_staleness() {
        let policy = Rfc2616Policy::new();
        let stored = SystemTime::now();
        let cached = response(200)
            .with_header(DATE, at(stored))
            .with_header(CACHE_CONTROL, HeaderValue::from_static("max-age=100"));
        let huge = request().with_header(
            CACHE_CONTROL,
            HeaderValue::from_static("max-stale=18446744073709551615"),
        );

        assert!(policy.is_fresh_at(&cached, &huge, stored + Duration::from_secs(200)));
    }

    #[test]
    fn admission_rules() {
        let policy = Rfc2616Policy::new();
        let req = request();

        let no_store = response(200).with_header(CACHE_CONTROL, HeaderValue::from_static("no-store, max-age=60"));
        assert!(!policy.should_cache_response(&req, &no_store));
        assert!(!policy.should_cache_response(&req, &response(304)));
        assert!(policy.should_cache_response(&req, &response(301)));
        assert!(!policy.should_cache_response(&req, &response(200)));
        assert!(policy.should_cache_response(&req, &response(200).with_header(ETAG, HeaderValue::from_static("\"v1\""))));
        assert!(Rfc2616Policy::new().always_store(true).should_cache_response(&req, &response(200)));

        let lenient = Rfc2616Policy::new().ignore_response_cache_controls(vec!["no-store".into()]);
        assert!(lenient.should_cache_response(&req, &no_store));

        let no_store_request = request().with_header(CACHE_CONTROL, HeaderValue::from_static("no-store"));
        assert!(!policy.should_cache_request(&no_store_request));
        assert!(!policy.should_cache_request(&Request::get("file:///tmp/x").unwrap()));
    }

    #[test]
    fn revalidation_adds_validators_and_accepts_304_or_5xx() {
        let policy = Rfc2616Policy::new();
        let cached = response(200)
            .with_header(ETAG, HeaderValue::from_static("\"v1\""))
            .with_header(LAST_MODIFIED, HeaderValue::from_static("Mon, 01 Jan 2024 00:00:00 GMT"));

        let conditional = policy.revalidation_request(&cached, request());
        assert_eq!(conditional.headers[IF_NONE_MATCH], "\"v1\"");
        assert_eq!(conditional.headers[IF_MODIFIED_SINCE], "Mon, 01 Jan 2024 00:00:00 GMT");

        assert!(policy.is_revalidation_valid(&cached, &response(304), &conditional));
        assert!(policy.is_revalidation_valid(&cached, &response(503), &conditional));
        assert!(!policy.is_revalidation_valid(&cached, &response(200), &conditional));

        let strict = cached.with_header(CACHE_CONTROL, HeaderValue::from_static("must-revalidate"));
        assert!(!policy.is_revalidation_valid(&strict, &response(503), &conditional));
    }

    #[test]
    fn dummy_policy_keeps_everything_but_ignored_codes() {
        let policy = DummyPolicy::new().ignore_http_codes(vec![404]);
        let req = request();

        assert!(policy.should_cache_request(&req));
        assert!(policy.should_cache_response(&req, &response(500)));
        assert!(!policy.should_cache_response(&req, &response(404)));
        assert!(policy.is_cached_response_valid(&req, &response(200), &req));
    }
}
