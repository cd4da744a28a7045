//! Offsite filtering.
//!
//! [`OffsiteMiddleware`] drops requests whose host is not one of the allowed
//! domains or a subdomain of one. Matching is done on dot boundaries, so
//! `www.example.org` allows `bob.www.example.org` but not `www2.example.org`
//! or `badwww.example.org`. An empty allow-list lets everything through.
//!
//! Each distinct offending host is reported once per run; later rejections
//! of the same host are only counted.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashSet;
use tracing::{debug, info, warn};

use crate::error::SpiderError;
use crate::middleware::{Middleware, RequestAction};
use crate::request::Request;
use crate::stats::StatsCollector;

/// Meta key letting one request bypass offsite filtering.
pub const ALLOW_OFFSITE: &str = "allow_offsite";

#[derive(Debug)]
pub struct OffsiteMiddleware {
    /// `None` means every host is allowed.
    allowed_domains: Option<Vec<String>>,
    reported_hosts: DashSet<String>,
    stats: Option<Arc<StatsCollector>>,
}

impl Default for OffsiteMiddleware {
    fn default() -> Self {
        Self::new(Vec::<String>::new())
    }
}

impl OffsiteMiddleware {
    pub fn new<I, S>(allowed_domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let configured: Vec<String> = allowed_domains
            .into_iter()
            .map(|d| d.as_ref().trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();

        let allowed_domains = if configured.is_empty() {
            None
        } else {
            Some(
                configured
                    .into_iter()
                    .filter_map(|domain| normalize_domain(&domain))
                    .collect(),
            )
        };

        let middleware = Self {
            allowed_domains,
            reported_hosts: DashSet::new(),
            stats: None,
        };
        info!("Initializing OffsiteMiddleware with config: {:?}", middleware.allowed_domains);
        middleware
    }

    pub fn stats(mut self, stats: Arc<StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Whether `host` is an allowed domain or one of its subdomains.
    pub fn is_allowed_host(&self, host: &str) -> bool {
        let Some(domains) = &self.allowed_domains else {
            return true;
        };
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// Hosts rejected so far.
    pub fn reported_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.reported_hosts.iter().map(|h| h.clone()).collect();
        hosts.sort();
        hosts
    }

    fn inc(&self, key: &str) {
        if let Some(stats) = &self.stats {
            stats.inc(key);
        }
    }
}

fn normalize_domain(domain: &str) -> Option<String> {
    if domain.contains("://") || domain.contains('/') {
        warn!(
            "allowed_domains accepts only domains, not URLs. Ignoring URL entry {} in allowed_domains.",
            domain
        );
        return None;
    }
    if domain.contains(':') {
        warn!(
            "allowed_domains accepts only domains without ports. Ignoring entry {} in allowed_domains.",
            domain
        );
        return None;
    }
    Some(domain.trim_start_matches('.').trim_end_matches('.').to_ascii_lowercase())
}

#[async_trait]
impl Middleware for OffsiteMiddleware {
    fn name(&self) -> &str {
        "OffsiteMiddleware"
    }

    async fn process_request(&self, request: Request) -> Result<RequestAction, SpiderError> {
        if request.dont_filter || request.meta_flag(ALLOW_OFFSITE) {
            return Ok(RequestAction::Continue(request));
        }
        let Some(host) = request.host() else {
            return Ok(RequestAction::Continue(request));
        };
        if self.is_allowed_host(host) {
            return Ok(RequestAction::Continue(request));
        }

        let host = host.to_string();
        if self.reported_hosts.insert(host.clone()) {
            info!("Filtered offsite request to {:?}: {}", host, request);
            self.inc("offsite/domains");
        } else {
            debug!("Filtered offsite request: {}", request);
        }
        self.inc("offsite/filtered");
        Err(SpiderError::ignored(format!("offsite request to {}", host)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> Request {
        Request::get(url).unwrap()
    }

    #[test]
    fn subdomains_match_on_dot_boundaries() {
        let mw = OffsiteMiddleware::new(["www.example.org", "scrapy.org"]);

        assert!(mw.is_allowed_host("www.example.org"));
        assert!(mw.is_allowed_host("bob.www.example.org"));
        assert!(mw.is_allowed_host("SCRAPY.org"));
        assert!(!mw.is_allowed_host("www2.example.com"));
        assert!(!mw.is_allowed_host("example.org"));
        assert!(!mw.is_allowed_host("badwww.example.org"));
        assert!(!mw.is_allowed_host("scrapy.org.evil.com"));
    }

    #[test]
    fn empty_list_allows_everything_and_bad_entries_are_skipped() {
        assert!(OffsiteMiddleware::default().is_allowed_host("anything.test"));

        let mw = OffsiteMiddleware::new(["http://example.com/", "example.net:8080", "example.io"]);
        assert!(!mw.is_allowed_host("example.com"));
        assert!(!mw.is_allowed_host("example.net"));
        assert!(mw.is_allowed_host("a.example.io"));
    }

    #[tokio::test]
    async fn rejected_host_is_reported_once() {
        let stats = Arc::new(StatsCollector::new());
        let mw = OffsiteMiddleware::new(["www.example.org"]).stats(stats.clone());

        for path in ["/a", "/b", "/c"] {
            let err = mw
                .process_request(request(&format!("http://www2.example.com{path}")))
                .await
                .unwrap_err();
            assert!(err.is_ignored());
        }

        assert_eq!(stats.get("offsite/domains"), 1);
        assert_eq!(stats.get("offsite/filtered"), 3);
        assert_eq!(mw.reported_hosts(), vec!["www2.example.com".to_string()]);
    }

    #[tokio::test]
    async fn dont_filter_and_meta_bypass() {
        let mw = OffsiteMiddleware::new(["example.org"]);

        assert!(
            mw.process_request(request("http://other.com/").with_dont_filter(true))
                .await
                .is_ok()
        );
        assert!(
            mw.process_request(request("http://other.com/").with_meta(ALLOW_OFFSITE, true))
                .await
                .is_ok()
        );
        assert!(
            mw.process_request(request("http://bob.example.org/"))
                .await
                .is_ok()
        );
    }
}
