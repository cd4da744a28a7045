//! Cache storage backends.
//!
//! A [`CacheStorage`] keeps one [`CacheEntry`] per request fingerprint. The
//! last write for a fingerprint wins. Two backends are provided:
//! [`MemoryStorage`] for a single process run and [`FilesystemStorage`],
//! which survives restarts and is what replaying a crawl offline relies on.
//!
//! The filesystem layout is one directory per entry:
//!
//! ```text
//! <root>/<fp[0..2]>/<fp>/
//!     request_headers     raw `Name: value\r\n` lines
//!     request_body
//!     response_headers
//!     response_body
//!     meta.json           stored_at, fingerprint, url, method, status, response_url
//! ```

use std::fmt::Debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::SpiderError;
use crate::request::Request;
use crate::response::Response;

/// A stored request/response pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: String,
    /// Snapshot of the request that produced the response.
    pub request: Request,
    /// Stored response, without flags or an attached request.
    pub response: Response,
    pub stored_at: SystemTime,
}

impl CacheEntry {
    pub fn new(fingerprint: impl Into<String>, request: &Request, response: &Response) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            request: request.clone(),
            response: Response {
                request: None,
                flags: Vec::new(),
                ..response.clone()
            },
            stored_at: SystemTime::now(),
        }
    }

    fn is_expired(&self, expiration: Option<Duration>, now: SystemTime) -> bool {
        match expiration {
            Some(ttl) => now
                .duration_since(self.stored_at)
                .map(|age| age > ttl)
                .unwrap_or(false),
            None => false,
        }
    }
}

/// Persistence for cached responses, keyed by request fingerprint.
#[async_trait]
pub trait CacheStorage: Send + Sync + Debug {
    async fn open(&self) -> Result<(), SpiderError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SpiderError> {
        Ok(())
    }

    /// Stored entry for `fingerprint`, `None` if absent or expired.
    async fn retrieve(&self, fingerprint: &str) -> Result<Option<CacheEntry>, SpiderError>;

    /// Stores `entry`, replacing any previous entry for its fingerprint.
    async fn store(&self, entry: CacheEntry) -> Result<(), SpiderError>;
}

/// In-process storage backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: DashMap<String, CacheEntry>,
    expiration: Option<Duration>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries older than `expiration` read as absent. Zero disables expiry.
    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = (!expiration.is_zero()).then_some(expiration);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn retrieve(&self, fingerprint: &str) -> Result<Option<CacheEntry>, SpiderError> {
        let Some(entry) = self.entries.get(fingerprint).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        if entry.is_expired(self.expiration, SystemTime::now()) {
            trace!("Memory cache entry {} expired", fingerprint);
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn store(&self, entry: CacheEntry) -> Result<(), SpiderError> {
        self.entries.insert(entry.fingerprint.clone(), entry);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    fingerprint: String,
    url: String,
    method: String,
    status: u16,
    response_url: String,
    /// Seconds since the Unix epoch.
    stored_at: f64,
}

/// On-disk storage, one directory per fingerprint.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
    expiration: Option<Duration>,
}

impl FilesystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            expiration: None,
        }
    }

    /// Storage under the platform cache directory.
    pub fn in_default_dir() -> Result<Self, SpiderError> {
        let root = dirs::cache_dir()
            .ok_or_else(|| {
                SpiderError::ConfigurationError("Could not determine cache directory".to_string())
            })?
            .join("spider-intercept")
            .join("http_cache");
        Ok(Self::new(root))
    }

    /// Entries older than `expiration` read as absent. Zero disables expiry.
    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = (!expiration.is_zero()).then_some(expiration);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the entry for `fingerprint`.
    pub fn entry_dir(&self, fingerprint: &str) -> PathBuf {
        let prefix = fingerprint.get(..2).unwrap_or(fingerprint);
        self.root.join(prefix).join(fingerprint)
    }

    async fn read_entry(&self, dir: &Path, meta: EntryMeta) -> Result<CacheEntry, SpiderError> {
        let request_headers = parse_header_block(&fs::read(dir.join("request_headers")).await?)?;
        let request_body = fs::read(dir.join("request_body")).await?;
        let response_headers = parse_header_block(&fs::read(dir.join("response_headers")).await?)?;
        let response_body = fs::read(dir.join("response_body")).await?;

        let method = Method::from_bytes(meta.method.as_bytes())
            .map_err(|e| SpiderError::SerializationError(e.to_string()))?;
        let status = StatusCode::from_u16(meta.status)
            .map_err(|e| SpiderError::SerializationError(e.to_string()))?;

        let mut request = Request::new(Url::parse(&meta.url)?)
            .with_method(method)
            .with_body(request_body);
        request.headers = request_headers;

        let response = Response::new(Url::parse(&meta.response_url)?, status)
            .with_headers(response_headers)
            .with_body(Bytes::from(response_body));

        let stored_at = Duration::try_from_secs_f64(meta.stored_at.max(0.0))
            .ok()
            .and_then(|since_epoch| UNIX_EPOCH.checked_add(since_epoch))
            .ok_or_else(|| {
                SpiderError::SerializationError(format!("invalid stored_at: {}", meta.stored_at))
            })?;

        Ok(CacheEntry {
            fingerprint: meta.fingerprint,
            request,
            response,
            stored_at,
        })
    }
}

fn write_header_block(headers: &HeaderMap) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn parse_header_block(raw: &[u8]) -> Result<HeaderMap, SpiderError> {
    let mut headers = HeaderMap::new();
    for line in raw.split(|b| *b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let Some(colon) = line.iter().position(|b| *b == b':') else {
            return Err(SpiderError::SerializationError(format!(
                "malformed header line: {}",
                String::from_utf8_lossy(line)
            )));
        };
        let name = HeaderName::from_bytes(&line[..colon])?;
        let value = line[colon + 1..].trim_ascii_start();
        headers.append(name, HeaderValue::from_bytes(value)?);
    }
    Ok(headers)
}

#[async_trait]
impl CacheStorage for FilesystemStorage {
    async fn open(&self) -> Result<(), SpiderError> {
        fs::create_dir_all(&self.root).await?;
        info!("Using filesystem cache storage at {}", self.root.display());
        Ok(())
    }

    async fn retrieve(&self, fingerprint: &str) -> Result<Option<CacheEntry>, SpiderError> {
        let dir = self.entry_dir(fingerprint);
        let raw_meta = match fs::read(dir.join("meta.json")).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let meta: EntryMeta = match serde_json::from_slice(&raw_meta) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Corrupt cache metadata in {}: {}", dir.display(), e);
                return Ok(None);
            }
        };

        let entry = match self.read_entry(&dir, meta).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Corrupt cache entry in {}: {}", dir.display(), e);
                return Ok(None);
            }
        };

        if entry.is_expired(self.expiration, SystemTime::now()) {
            trace!("Filesystem cache entry {} expired", fingerprint);
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn store(&self, entry: CacheEntry) -> Result<(), SpiderError> {
        let dir = self.entry_dir(&entry.fingerprint);
        fs::create_dir_all(&dir).await?;

        let meta = EntryMeta {
            fingerprint: entry.fingerprint.clone(),
            url: entry.request.url.to_string(),
            method: entry.request.method.to_string(),
            status: entry.response.status.as_u16(),
            response_url: entry.response.url.to_string(),
            stored_at: entry
                .stored_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        };

        fs::write(dir.join("request_headers"), write_header_block(&entry.request.headers)).await?;
        fs::write(dir.join("request_body"), &entry.request.body).await?;
        fs::write(dir.join("response_headers"), write_header_block(&entry.response.headers)).await?;
        fs::write(dir.join("response_body"), &entry.response.body).await?;
        // Written last: an entry without metadata reads as absent.
        fs::write(dir.join("meta.json"), serde_json::to_vec_pretty(&meta)?).await?;

        debug!(
            "Stored {} ({} bytes) in {}",
            entry.response.url,
            entry.response.body.len(),
            dir.display()
        );
        Ok(())
    }
}
