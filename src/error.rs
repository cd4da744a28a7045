//! Error and failure types shared by every middleware.
//!
//! [`SpiderError`] is what hooks and collaborators return. It is `Clone` so an
//! exception hook can inspect an error and hand it on unchanged. Each variant
//! belongs to one [`FailureKind`], the classification the dispatcher and the
//! retry controller reason about.
//!
//! A [`Failure`] pairs an error with the request it happened to, which is what
//! travels through the exception phase and finally reaches the errback.

use std::fmt;

use thiserror::Error;

use crate::request::Request;

/// Classifies transport-level errors for retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    /// The request did not complete within its deadline.
    Timeout,
    /// The connection could not be established.
    Connect,
    /// The connection dropped while the response was in flight.
    ConnectionLost,
    /// The host name could not be resolved.
    Dns,
    /// Any other transport error.
    Other,
}

impl TransportErrorKind {
    /// Kinds retried by default.
    pub const RETRYABLE: [TransportErrorKind; 4] = [
        TransportErrorKind::Timeout,
        TransportErrorKind::Connect,
        TransportErrorKind::ConnectionLost,
        TransportErrorKind::Dns,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::ConnectionLost => "connection_lost",
            TransportErrorKind::Dns => "dns",
            TransportErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Explicit abort raised by a hook. Dropped quietly when nobody handles it.
    Ignored,
    /// Network level failure reported by the transport.
    Transport(TransportErrorKind),
    /// Malformed redirect target, redirect loop and similar. Terminal.
    ProtocolViolation,
    /// Invalid settings. Fatal at startup, never retried.
    Configuration,
    /// I/O, header or URL errors surfaced from helpers.
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Ignored => "ignored",
            FailureKind::Transport(kind) => kind.as_str(),
            FailureKind::ProtocolViolation => "protocol_violation",
            FailureKind::Configuration => "configuration",
            FailureKind::Internal => "internal",
        }
    }
}

/// The error type produced by middlewares, storages and transports.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpiderError {
    #[error("request ignored: {0}")]
    Ignored(String),

    #[error("transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("invalid header value: {0}")]
    HeaderValueError(String),

    #[error("invalid URL: {0}")]
    UrlParseError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl SpiderError {
    /// Shorthand for an [`SpiderError::Ignored`] with the given reason.
    pub fn ignored(reason: impl Into<String>) -> Self {
        SpiderError::Ignored(reason.into())
    }

    /// Shorthand for a transport error.
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        SpiderError::Transport {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            SpiderError::Ignored(_) => FailureKind::Ignored,
            SpiderError::Transport { kind, .. } => FailureKind::Transport(*kind),
            SpiderError::ProtocolViolation(_) => FailureKind::ProtocolViolation,
            SpiderError::ConfigurationError(_) => FailureKind::Configuration,
            SpiderError::IoError(_)
            | SpiderError::HeaderValueError(_)
            | SpiderError::UrlParseError(_)
            | SpiderError::SerializationError(_) => FailureKind::Internal,
        }
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, SpiderError::Ignored(_))
    }
}

impl From<std::io::Error> for SpiderError {
    fn from(err: std::io::Error) -> Self {
        SpiderError::IoError(err.to_string())
    }
}

impl From<url::ParseError> for SpiderError {
    fn from(err: url::ParseError) -> Self {
        SpiderError::UrlParseError(err.to_string())
    }
}

impl From<http::header::InvalidHeaderValue> for SpiderError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        SpiderError::HeaderValueError(err.to_string())
    }
}

impl From<http::header::InvalidHeaderName> for SpiderError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        SpiderError::HeaderValueError(err.to_string())
    }
}

impl From<serde_json::Error> for SpiderError {
    fn from(err: serde_json::Error) -> Self {
        SpiderError::SerializationError(err.to_string())
    }
}

#[cfg(feature = "reqwest-transport")]
impl From<reqwest::Error> for SpiderError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_body() || err.is_decode() {
            TransportErrorKind::ConnectionLost
        } else {
            TransportErrorKind::Other
        };
        SpiderError::transport(kind, err.to_string())
    }
}

/// An error together with the request it happened to.
#[derive(Debug, Clone)]
pub struct Failure {
    pub error: SpiderError,
    pub request: Request,
}

impl Failure {
    pub fn new(error: SpiderError, request: Request) -> Self {
        Self { error, request }
    }

    pub fn kind(&self) -> FailureKind {
        self.error.kind()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{} {}>", self.error, self.request.method, self.request.url)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
