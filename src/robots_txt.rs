//! Robots.txt Middleware for respecting website crawling policies.
//!
//! This module provides the `RobotsTxtMiddleware`, which fetches, caches and
//! interprets `robots.txt` files. Before each outgoing request the middleware
//! checks whether the request's URL and User-Agent are permitted by the
//! target origin's rules.
//!
//! Rules are fetched lazily, once per origin. Concurrent requests to an origin
//! whose rules are not known yet all wait on the same in-flight fetch. How a
//! `robots.txt` body is interpreted is left to a [`RobotsParser`], so the
//! matching strategy can be swapped without touching the gate itself.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::{HeaderValue, USER_AGENT};
use moka::future::Cache;
use robotstxt::DefaultMatcher;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::SpiderError;
use crate::headers::DEFAULT_USER_AGENT;
use crate::middleware::{Middleware, RequestAction};
use crate::request::Request;
use crate::stats::StatsCollector;
use crate::transport::Transport;

/// Meta key letting one request skip the robots.txt check.
pub const DONT_OBEY_ROBOTSTXT: &str = "dont_obey_robotstxt";

/// Parsed rules of one `robots.txt` file.
pub trait RuleSet: Send + Sync + Debug {
    /// Whether `user_agent` may fetch `url`.
    fn allows(&self, url: &Url, user_agent: &str) -> bool;
}

/// Turns a `robots.txt` body into a [`RuleSet`].
pub trait RobotsParser: Send + Sync + Debug {
    fn parse(&self, body: &str) -> Arc<dyn RuleSet>;
}

/// Rule set used when no rules could be obtained.
#[derive(Debug)]
pub struct AllowAll;

impl RuleSet for AllowAll {
    fn allows(&self, _url: &Url, _user_agent: &str) -> bool {
        true
    }
}

/// Product token of a User-Agent string: `Foo-Bot/1.2 (+url)` gives `Foo-Bot`.
fn product_token(user_agent: &str) -> &str {
    let end = user_agent
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        .unwrap_or(user_agent.len());
    &user_agent[..end]
}

/// Google's matcher: the most specific (longest) matching rule wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct GoogleRobotsParser;

#[derive(Debug)]
struct GoogleRuleSet {
    body: String,
}

impl RuleSet for GoogleRuleSet {
    fn allows(&self, url: &Url, user_agent: &str) -> bool {
        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&self.body, product_token(user_agent), url.as_str())
    }
}

impl RobotsParser for GoogleRobotsParser {
    fn parse(&self, body: &str) -> Arc<dyn RuleSet> {
        Arc::new(GoogleRuleSet {
            body: body.to_string(),
        })
    }
}

/// Classic first-match prefix rules.
///
/// The first group whose agent name appears in the User-Agent applies,
/// falling back to the `*` group. Within a group the first rule whose path
/// is a prefix of the request path decides.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleRobotsParser;

#[derive(Debug, Default)]
struct Group {
    agents: Vec<String>,
    rules: Vec<(bool, String)>,
}

#[derive(Debug, Default)]
struct SimpleRuleSet {
    groups: Vec<Group>,
    default_group: Option<Group>,
}

impl SimpleRuleSet {
    fn group_for(&self, user_agent: &str) -> Option<&Group> {
        let user_agent = user_agent.to_ascii_lowercase();
        self.groups
            .iter()
            .find(|group| {
                group.agents.iter().any(|agent| {
                    let token = agent.split('/').next().unwrap_or_default();
                    !token.is_empty() && user_agent.contains(token)
                })
            })
            .or(self.default_group.as_ref())
    }
}

impl RuleSet for SimpleRuleSet {
    fn allows(&self, url: &Url, user_agent: &str) -> bool {
        if url.path() == "/robots.txt" {
            return true;
        }
        let Some(group) = self.group_for(user_agent) else {
            return true;
        };
        let target = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        group
            .rules
            .iter()
            .find(|(_, path)| target.starts_with(path.as_str()))
            .map(|(allow, _)| *allow)
            .unwrap_or(true)
    }
}

impl RobotsParser for SimpleRobotsParser {
    fn parse(&self, body: &str) -> Arc<dyn RuleSet> {
        let mut rule_set = SimpleRuleSet::default();
        let mut current = Group::default();
        let mut in_rules = false;

        let finish = |group: Group, rule_set: &mut SimpleRuleSet| {
            if group.agents.is_empty() {
                return;
            }
            if group.agents.iter().any(|a| a == "*") {
                if rule_set.default_group.is_none() {
                    rule_set.default_group = Some(group);
                }
            } else {
                rule_set.groups.push(group);
            }
        };

        for line in body.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match field.trim().to_ascii_lowercase().as_str() {
                "user-agent" => {
                    if in_rules {
                        finish(std::mem::take(&mut current), &mut rule_set);
                        in_rules = false;
                    }
                    current.agents.push(value.to_ascii_lowercase());
                }
                "disallow" if !current.agents.is_empty() => {
                    in_rules = true;
                    // An empty Disallow allows everything.
                    if !value.is_empty() {
                        current.rules.push((false, value.to_string()));
                    }
                }
                "allow" if !current.agents.is_empty() => {
                    in_rules = true;
                    if !value.is_empty() {
                        current.rules.push((true, value.to_string()));
                    }
                }
                _ => {}
            }
        }
        finish(current, &mut rule_set);
        Arc::new(rule_set)
    }
}

/// Robots.txt middleware
pub struct RobotsTxtMiddleware {
    transport: Arc<dyn Transport>,
    parser: Arc<dyn RobotsParser>,
    user_agent: String,
    cache_ttl: Duration,
    cache_capacity: u64,
    request_timeout: Duration,
    cache: Cache<String, Arc<dyn RuleSet>>,
    stats: Option<Arc<StatsCollector>>,
}

impl Debug for RobotsTxtMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotsTxtMiddleware")
            .field("parser", &self.parser)
            .field("user_agent", &self.user_agent)
            .field("cache_ttl", &self.cache_ttl)
            .field("cache_capacity", &self.cache_capacity)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl RobotsTxtMiddleware {
    /// Creates a `RobotsTxtMiddleware` that fetches rules through `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let cache_ttl = Duration::from_secs(60 * 60 * 24);
        let cache_capacity = 10_000;
        let middleware = Self {
            transport,
            parser: Arc::new(GoogleRobotsParser),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cache_ttl,
            cache_capacity,
            request_timeout: Duration::from_secs(5),
            cache: Self::build_cache(cache_ttl, cache_capacity),
            stats: None,
        };
        info!(
            "Initializing RobotsTxtMiddleware with config: {:?}",
            middleware
        );
        middleware
    }

    /// Set the parser used to interpret robots.txt bodies.
    pub fn parser(mut self, parser: Arc<dyn RobotsParser>) -> Self {
        self.parser = parser;
        self.rebuild_cache();
        self
    }

    /// Set the User-Agent checked for requests that carry none.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the time-to-live for the cache.
    pub fn cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self.rebuild_cache();
        self
    }

    /// Set the max capacity for the cache.
    pub fn cache_capacity(mut self, cache_capacity: u64) -> Self {
        self.cache_capacity = cache_capacity;
        self.rebuild_cache();
        self
    }

    /// Set the timeout for fetching robots.txt files.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn stats(mut self, stats: Arc<StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    fn build_cache(ttl: Duration, capacity: u64) -> Cache<String, Arc<dyn RuleSet>> {
        Cache::builder()
            .time_to_live(ttl)
            .max_capacity(capacity)
            .build()
    }

    /// Rebuilds the cache with the current settings.
    fn rebuild_cache(&mut self) {
        self.cache = Self::build_cache(self.cache_ttl, self.cache_capacity);
    }

    fn inc(&self, key: &str) {
        if let Some(stats) = &self.stats {
            stats.inc(key);
        }
    }

    /// Rules for `origin`, fetching them if this is the first request there.
    pub async fn rules_for(&self, origin: &str) -> Arc<dyn RuleSet> {
        self.cache
            .get_with(origin.to_string(), self.fetch_rules(origin))
            .await
    }

    async fn fetch_rules(&self, origin: &str) -> Arc<dyn RuleSet> {
        let robots_url = format!("{}/robots.txt", origin);
        debug!("Fetching robots.txt from: {}", robots_url);
        self.inc("robotstxt/request_count");

        let permissive = || -> Arc<dyn RuleSet> { Arc::new(AllowAll) };

        let request = match Request::get(&robots_url) {
            Ok(request) => request
                .with_meta(DONT_OBEY_ROBOTSTXT, true)
                .with_meta("download_timeout", self.request_timeout.as_secs()),
            Err(e) => {
                warn!("Invalid robots.txt URL {}: {}", robots_url, e);
                return permissive();
            }
        };
        let request = match HeaderValue::from_str(&self.user_agent) {
            Ok(ua) => request.with_header(USER_AGENT, ua),
            Err(_) => request,
        };

        match self.transport.fetch(&request).await {
            Ok(response) if response.status.is_success() => {
                match String::from_utf8(response.body.to_vec()) {
                    Ok(text) => self.parser.parse(&text),
                    Err(e) => {
                        warn!("Failed to read robots.txt {}: {}", robots_url, e);
                        permissive()
                    }
                }
            }
            Ok(response) => {
                debug!(
                    "robots.txt {} returned {}, allowing all",
                    robots_url, response.status
                );
                self.inc(&format!(
                    "robotstxt/response_status_count/{}",
                    response.status.as_u16()
                ));
                permissive()
            }
            Err(e) => {
                warn!("Failed to fetch robots.txt {}: {}", robots_url, e);
                self.inc(&format!("robotstxt/exception_count/{}", e.kind().as_str()));
                permissive()
            }
        }
    }
}

#[async_trait]
impl Middleware for RobotsTxtMiddleware {
    fn name(&self) -> &str {
        "RobotsTxtMiddleware"
    }

    async fn process_request(&self, request: Request) -> Result<RequestAction, SpiderError> {
        if request.meta_flag(DONT_OBEY_ROBOTSTXT) {
            return Ok(RequestAction::Continue(request));
        }
        let origin = request.url.origin().unicode_serialization();
        if origin == "null" {
            return Ok(RequestAction::Continue(request));
        }

        let rules = self.rules_for(&origin).await;

        let user_agent = match request.headers.get(USER_AGENT) {
            Some(value) => value
                .to_str()
                .map_err(|e| SpiderError::HeaderValueError(e.to_string()))?
                .to_string(),
            None => self.user_agent.clone(),
        };

        if rules.allows(&request.url, &user_agent) {
            return Ok(RequestAction::Continue(request));
        }

        debug!("Forbidden by robots.txt: {}", request);
        self.inc("robotstxt/forbidden");
        Err(SpiderError::ignored(format!(
            "forbidden by robots.txt: {}",
            request.url
        )))
    }
}
