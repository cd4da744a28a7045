//! Transparent response decompression.
//!
//! [`HttpCompressionMiddleware`] advertises the encodings it understands and
//! decodes response bodies according to `Content-Encoding`. Stacked encodings
//! (`gzip, zstd`) are undone in reverse order. Decoded bodies larger than the
//! configured maximum size abort the request as ignored.

use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, HeaderValue};
use http::Method;
use tracing::{debug, info, warn};

use crate::error::SpiderError;
use crate::middleware::{Middleware, RequestAction, ResponseAction};
use crate::request::Request;
use crate::response::Response;
use crate::stats::StatsCollector;

/// Meta key overriding the decoded size limit for one request.
pub const DOWNLOAD_MAXSIZE: &str = "download_maxsize";

const ACCEPTED_ENCODINGS: &str = "gzip, deflate, zstd";

#[derive(Debug, Clone, Default)]
pub struct HttpCompressionMiddleware {
    /// Largest decoded body accepted, `0` for no limit.
    max_size: usize,
    stats: Option<Arc<StatsCollector>>,
}

impl HttpCompressionMiddleware {
    pub fn new() -> Self {
        let middleware = Self::default();
        info!("Initializing HttpCompressionMiddleware with config: {:?}", middleware);
        middleware
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn stats(mut self, stats: Arc<StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }
}

/// Reads at most `limit + 1` bytes so oversized bodies are detected early.
fn read_limited<R: Read>(reader: R, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    if limit == 0 {
        let mut reader = reader;
        reader.read_to_end(&mut out)?;
    } else {
        reader.take(limit as u64 + 1).read_to_end(&mut out)?;
    }
    Ok(out)
}

/// Decodes `body` encoded with a single `encoding`.
///
/// Returns `None` for encodings this middleware does not know.
pub fn decode(encoding: &str, body: &[u8], limit: usize) -> Option<std::io::Result<Vec<u8>>> {
    let decoded = match encoding {
        "gzip" | "x-gzip" => read_limited(GzDecoder::new(body), limit),
        "deflate" => {
            // Servers disagree on whether deflate means zlib-wrapped or raw.
            match read_limited(ZlibDecoder::new(body), limit) {
                Ok(decoded) => Ok(decoded),
                Err(_) => read_limited(DeflateDecoder::new(body), limit),
            }
        }
        "zstd" => zstd::stream::read::Decoder::new(body).and_then(|d| read_limited(d, limit)),
        "identity" => Ok(body.to_vec()),
        _ => return None,
    };
    Some(decoded)
}

#[async_trait]
impl Middleware for HttpCompressionMiddleware {
    fn name(&self) -> &str {
        "HttpCompressionMiddleware"
    }

    async fn process_request(&self, mut request: Request) -> Result<RequestAction, SpiderError> {
        if !request.headers.contains_key(ACCEPT_ENCODING) {
            request
                .headers
                .insert(ACCEPT_ENCODING, HeaderValue::from_static(ACCEPTED_ENCODINGS));
        }
        Ok(RequestAction::Continue(request))
    }

    async fn process_response(
        &self,
        request: &Request,
        mut response: Response,
    ) -> Result<ResponseAction, SpiderError> {
        if request.method == Method::HEAD {
            return Ok(ResponseAction::Continue(response));
        }
        let Some(header) = response.header_str(CONTENT_ENCODING).map(str::to_owned) else {
            return Ok(ResponseAction::Continue(response));
        };

        let limit = request
            .meta_u64(DOWNLOAD_MAXSIZE)
            .map(|v| v as usize)
            .unwrap_or(self.max_size);

        let mut encodings: Vec<String> = header
            .split(',')
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();

        let layers = encodings.len();
        let mut body = response.body.to_vec();
        while let Some(encoding) = encodings.last() {
            match decode(encoding, &body, limit) {
                Some(Ok(decoded)) => {
                    body = decoded;
                    encodings.pop();
                }
                Some(Err(e)) => {
                    warn!("Failed to decode {} body of {}: {}", encoding, response.url, e);
                    break;
                }
                None => {
                    debug!("Leaving unsupported encoding {} on {}", encoding, response.url);
                    break;
                }
            }
            if limit > 0 && body.len() > limit {
                if let Some(stats) = &self.stats {
                    stats.inc("httpcompression/response_bytes_exceeded");
                }
                return Err(SpiderError::ignored(format!(
                    "decompressed body of {} exceeds download_maxsize ({} bytes)",
                    response.url, limit
                )));
            }
        }

        if encodings.is_empty() {
            response.headers.remove(CONTENT_ENCODING);
        } else {
            response
                .headers
                .insert(CONTENT_ENCODING, HeaderValue::from_str(&encodings.join(", "))?);
        }
        if encodings.len() != layers {
            response.headers.remove(CONTENT_LENGTH);
            if let Some(stats) = &self.stats {
                stats.inc("httpcompression/response_count");
                stats.add("httpcompression/response_bytes", body.len() as i64);
            }
            response.body = Bytes::from(body);
        }
        Ok(ResponseAction::Continue(response))
    }
}
