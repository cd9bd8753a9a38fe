//! Error types for both halves of the crate.
//!
//! Recoverable categories travel as variants with a kind tag and auxiliary
//! data rather than as stringly-typed exceptions; see the per-enum docs for
//! the HTTP mapping.

use std::time::Duration;
use thiserror::Error;

/// Error for invalid HTTP header configuration.
#[derive(Debug, Clone, Error)]
pub enum InvalidHeaderError {
    #[error("invalid header name: {0}")]
    InvalidName(String),
    #[error("invalid header value: {0}")]
    InvalidValue(String),
}

/// Main error type for client-side stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream not found: {url}")]
    NotFound { url: String },

    #[error("stream already exists with different configuration")]
    Conflict,

    #[error("stream is closed")]
    StreamClosed,

    #[error("sequence conflict")]
    SeqConflict,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("invalid request: {message}")]
    BadRequest { message: String },

    #[error("server error: {status} - {message}")]
    ServerError { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("timeout")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("json error: {0}")]
    Json(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("empty append not allowed")]
    EmptyAppend,

    #[error("iterator closed")]
    IteratorClosed,
}

impl StreamError {
    /// Create error from HTTP status code
    pub fn from_status(status: u16, url: &str) -> Self {
        match status {
            400 => StreamError::BadRequest {
                message: "Bad request".to_string(),
            },
            401 => StreamError::Unauthorized,
            403 => StreamError::Forbidden,
            404 => StreamError::NotFound {
                url: url.to_string(),
            },
            409 => StreamError::Conflict,
            429 => StreamError::RateLimited { retry_after: None },
            _ if status >= 500 => StreamError::ServerError {
                status,
                message: format!("Server error {}", status),
            },
            _ => StreamError::ServerError {
                status,
                message: format!("Unexpected status {}", status),
            },
        }
    }

    /// Whether this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::RateLimited { .. } => true,
            StreamError::ServerError { status, .. } => *status >= 500,
            StreamError::Network(_) => true,
            StreamError::Timeout => true,
            _ => false,
        }
    }

    /// HTTP status code if applicable
    pub fn status_code(&self) -> Option<u16> {
        match self {
            StreamError::NotFound { .. } => Some(404),
            StreamError::Conflict => Some(409),
            StreamError::StreamClosed => Some(409),
            StreamError::SeqConflict => Some(409),
            StreamError::Unauthorized => Some(401),
            StreamError::Forbidden => Some(403),
            StreamError::RateLimited { .. } => Some(429),
            StreamError::BadRequest { .. } => Some(400),
            StreamError::ServerError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Stable error-kind string, as surfaced to embedders.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::NotFound { .. } => "NOT_FOUND",
            StreamError::Conflict => "CONFLICT_EXISTS",
            StreamError::StreamClosed => "STREAM_CLOSED",
            StreamError::SeqConflict => "CONFLICT_SEQ",
            StreamError::BadRequest { .. } => "BAD_REQUEST",
            StreamError::ParseError(_) => "PARSE_ERROR",
            StreamError::Network(_) => "NETWORK_ERROR",
            StreamError::Timeout => "TIMEOUT",
            StreamError::Cancelled => "CANCELLED",
            StreamError::Unauthorized => "UNAUTHORIZED",
            StreamError::Forbidden => "FORBIDDEN",
            _ => "UNEXPECTED_STATUS",
        }
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StreamError::Timeout
        } else {
            StreamError::Network(err)
        }
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Json(err.to_string())
    }
}

/// Producer-specific errors.
#[derive(Debug, Clone, Error)]
pub enum ProducerError {
    #[error("producer is closed")]
    Closed,

    #[error("stale epoch: server has epoch {server_epoch}, we have {our_epoch}")]
    StaleEpoch { server_epoch: u64, our_epoch: u64 },

    #[error("sequence gap: expected {expected}, received {received}")]
    SequenceGap { expected: u64, received: u64 },

    #[error("stream error: {message}")]
    Stream { message: String },

    #[error("mixed append types in JSON mode")]
    MixedAppendTypes,
}

impl From<reqwest::Error> for ProducerError {
    fn from(err: reqwest::Error) -> Self {
        ProducerError::Stream {
            message: StreamError::from(err).to_string(),
        }
    }
}

impl From<StreamError> for ProducerError {
    fn from(err: StreamError) -> Self {
        ProducerError::Stream {
            message: err.to_string(),
        }
    }
}

/// Error types for server-side store operations.
///
/// HTTP mapping: `NotFound` 404; `ConflictExists`, `ContentTypeMismatch`,
/// `StreamClosed`, `SequenceConflict` 409; `Fenced`, `StaleEpoch` 403; the
/// rest 400.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stream not found: {0}")]
    NotFound(String),

    #[error("stream already exists with different configuration")]
    ConflictExists,

    #[error("content-type mismatch: expected {expected}, got {actual}")]
    ContentTypeMismatch { expected: String, actual: String },

    #[error("stream is closed")]
    StreamClosed,

    #[error("producer sequence gap: expected {expected}")]
    SequenceConflict { expected: u64 },

    #[error("producer fenced: current epoch is {current_epoch}")]
    Fenced { current_epoch: u64 },

    #[error("stale producer epoch: current epoch is {current_epoch}")]
    StaleEpoch { current_epoch: u64 },

    #[error("invalid offset: {0}")]
    InvalidOffset(String),

    #[error("empty body not allowed")]
    EmptyBody,

    #[error("empty arrays not allowed on append")]
    EmptyArrayNotAllowed,

    #[error("malformed JSON body: {0}")]
    InvalidJson(String),

    #[error("cannot specify both TTL and Expires-At")]
    TtlConflict,

    #[error("invalid TTL value")]
    InvalidTtl,

    #[error("invalid Expires-At timestamp")]
    InvalidExpiresAt,
}

/// Errors raised while building a router definition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterBuildError {
    #[error("reserved path parameter name: {0}")]
    ReservedParam(String),

    #[error("invalid path template: {0}")]
    InvalidTemplate(String),

    #[error("duplicate route name: {0}")]
    DuplicateRoute(String),

    #[error("duplicate collection event type {event_type} in stream {stream}")]
    DuplicateCollectionType { stream: String, event_type: String },
}

/// Error surfaced by a procedure handler.
///
/// Dispatch maps `NotFound` to 404, `Invalid` to 400, `Internal` to 500.
#[derive(Debug, Error)]
pub enum ProcedureError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("{0}")]
    Internal(String),
}

/// Errors surfaced by the typed RPC client.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no route named {0}")]
    RouteNotFound(String),

    #[error("route {0} is not a procedure")]
    NotAProcedure(String),

    #[error("route {0} is not a stream")]
    NotAStream(String),

    #[error("no collection {collection} in stream {stream}")]
    CollectionNotFound { stream: String, collection: String },

    #[error("missing path parameter: {0}")]
    MissingParam(String),

    #[error("invalid change event: {0}")]
    InvalidEvent(String),

    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("unexpected status {status}: {message}")]
    Status { status: u16, message: String },

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("json error: {0}")]
    Json(String),

    #[error("timed out waiting for txid {0}")]
    TxidTimeout(String),
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        RpcError::Stream(StreamError::from(err))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json(err.to_string())
    }
}
