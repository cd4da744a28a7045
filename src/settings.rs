//! Settings snapshot used to assemble the middleware chain.
//!
//! [`Settings`] is plain data: every field has a default, so a snapshot can be
//! deserialized from a partial JSON document. [`crate::registry::ChainBuilder`]
//! turns it into configured middlewares.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SpiderError;
use crate::headers::DEFAULT_USER_AGENT;
use crate::proxy::ProxyRotationStrategy;

/// Which cache policy the HTTP cache uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicyKind {
    /// Store everything, reuse forever.
    #[default]
    Dummy,
    /// HTTP/1.1 freshness and revalidation.
    Rfc2616,
}

/// Where the HTTP cache keeps its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStorageKind {
    #[default]
    Filesystem,
    Memory,
}

/// How robots.txt bodies are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RobotsParserKind {
    /// Longest-match semantics.
    #[default]
    Google,
    /// First-match prefix rules.
    Simple,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Order key per middleware name; `null` disables the middleware.
    pub order_overrides: BTreeMap<String, Option<i32>>,

    pub cache_enabled: bool,
    pub cache_policy: CachePolicyKind,
    pub cache_storage: CacheStorageKind,
    /// Root of the filesystem cache; the platform cache directory when unset.
    pub cache_dir: Option<PathBuf>,
    /// Entries older than this many seconds are ignored. `0` keeps them forever.
    pub cache_expiration_secs: u64,
    pub cache_ignore_http_codes: Vec<u16>,
    pub cache_ignore_schemes: Vec<String>,
    /// Fail requests missing from the cache instead of downloading them.
    pub cache_ignore_missing: bool,
    pub cache_always_store: bool,
    pub cache_ignore_response_cache_controls: Vec<String>,

    pub retry_enabled: bool,
    pub retry_times: u32,
    pub retry_http_codes: Vec<u16>,
    pub retry_priority_adjust: i32,

    pub redirect_enabled: bool,
    pub redirect_max_times: usize,
    pub redirect_priority_adjust: i32,
    pub metarefresh_enabled: bool,
    /// Seconds; meta refreshes with a longer delay are not followed.
    pub metarefresh_maxdelay: u64,

    pub robotstxt_obey: bool,
    pub robotstxt_parser: RobotsParserKind,

    pub offsite_allowed_domains: Vec<String>,

    pub user_agent: String,
    pub default_request_headers: BTreeMap<String, String>,

    pub compression_enabled: bool,
    /// Largest decoded body in bytes. `0` disables the limit.
    pub download_maxsize: usize,

    pub cookies_enabled: bool,

    /// Proxy pool. When empty the `http_proxy`/`https_proxy` variables are used.
    pub proxies: Vec<String>,
    pub proxy_strategy: ProxyRotationStrategy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            order_overrides: BTreeMap::new(),
            cache_enabled: false,
            cache_policy: CachePolicyKind::default(),
            cache_storage: CacheStorageKind::default(),
            cache_dir: None,
            cache_expiration_secs: 0,
            cache_ignore_http_codes: Vec::new(),
            cache_ignore_schemes: vec!["file".to_string()],
            cache_ignore_missing: false,
            cache_always_store: false,
            cache_ignore_response_cache_controls: Vec::new(),
            retry_enabled: true,
            retry_times: 2,
            retry_http_codes: vec![500, 502, 503, 504, 522, 524, 408, 429],
            retry_priority_adjust: -1,
            redirect_enabled: true,
            redirect_max_times: 20,
            redirect_priority_adjust: 2,
            metarefresh_enabled: true,
            metarefresh_maxdelay: 100,
            robotstxt_obey: false,
            robotstxt_parser: RobotsParserKind::default(),
            offsite_allowed_domains: Vec::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            default_request_headers: BTreeMap::from([
                (
                    "Accept".to_string(),
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
                ),
                ("Accept-Language".to_string(), "en".to_string()),
            ]),
            compression_enabled: true,
            download_maxsize: 1024 * 1024 * 1024,
            cookies_enabled: true,
            proxies: Vec::new(),
            proxy_strategy: ProxyRotationStrategy::default(),
        }
    }
}

impl Settings {
    /// Parses a JSON snapshot. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, SpiderError> {
        let settings: Settings = serde_json::from_str(json)
            .map_err(|e| SpiderError::ConfigurationError(format!("invalid settings: {}", e)))?;
        settings.validate()?;
        debug!("Loaded settings: {:?}", settings);
        Ok(settings)
    }

    /// Reads and parses a JSON snapshot from `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SpiderError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SpiderError::ConfigurationError(format!(
                "cannot read settings file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&json)
    }

    /// Rejects values no middleware could work with.
    pub fn validate(&self) -> Result<(), SpiderError> {
        let lists = [
            ("cache_ignore_http_codes", &self.cache_ignore_http_codes),
            ("retry_http_codes", &self.retry_http_codes),
        ];
        for (name, codes) in lists {
            if let Some(code) = codes.iter().find(|c| !(100..=599).contains(*c)) {
                return Err(SpiderError::ConfigurationError(format!(
                    "{} contains invalid status code {}",
                    name, code
                )));
            }
        }
        if self.user_agent.trim().is_empty() {
            return Err(SpiderError::ConfigurationError(
                "user_agent must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
