//! Core types shared by the server core and the client.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stream position specification.
///
/// Offsets are:
/// - Opaque: Do not parse or interpret offset structure
/// - Lexicographically sortable: Compare offsets to determine ordering
/// - Persistent: Valid for the stream's lifetime
/// - Unique: Each position has exactly one offset
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Offset {
    /// Start from the beginning of the stream (sentinel "-1")
    Beginning,
    /// Start from the current tail (only future data, sentinel "now")
    Now,
    /// Start from a specific offset token
    At(String),
}

impl Offset {
    /// Create an offset at a specific position.
    pub fn at(s: impl Into<String>) -> Self {
        Offset::At(s.into())
    }

    /// Parse from protocol string
    pub fn parse(s: &str) -> Self {
        match s {
            "-1" => Offset::Beginning,
            "now" => Offset::Now,
            "" => Offset::Beginning,
            other => Offset::At(other.to_string()),
        }
    }

    /// Convert to query parameter value
    pub fn to_query_value(&self) -> &str {
        match self {
            Offset::Beginning => "-1",
            Offset::Now => "now",
            Offset::At(s) => s.as_str(),
        }
    }

    /// Check if this is the beginning sentinel
    pub fn is_beginning(&self) -> bool {
        matches!(self, Offset::Beginning)
    }

    /// Check if this is the now sentinel
    pub fn is_now(&self) -> bool {
        matches!(self, Offset::Now)
    }

    /// Get the protocol string for this offset
    pub fn as_str(&self) -> &str {
        match self {
            Offset::Beginning => "-1",
            Offset::Now => "now",
            Offset::At(s) => s.as_str(),
        }
    }
}

impl Default for Offset {
    fn default() -> Self {
        Offset::Beginning
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_query_value())
    }
}

impl From<String> for Offset {
    fn from(s: String) -> Self {
        Offset::parse(&s)
    }
}

impl From<&str> for Offset {
    fn from(s: &str) -> Self {
        Offset::parse(s)
    }
}

impl PartialOrd for Offset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Offset::At(a), Offset::At(b)) => Some(a.cmp(b)), // Lexicographic
            (Offset::Beginning, Offset::Beginning) => Some(Ordering::Equal),
            (Offset::Now, Offset::Now) => Some(Ordering::Equal),
            (Offset::Beginning, Offset::At(_)) => Some(Ordering::Less),
            (Offset::At(_), Offset::Beginning) => Some(Ordering::Greater),
            _ => None, // Now is not comparable with other offsets
        }
    }
}

/// Live tailing mode for stream consumption.
///
/// ## `LiveMode::Auto` Fallback Behavior
///
/// When `Auto` is selected:
///
/// 1. **Catch-up first**: Regular HTTP reads until `up_to_date`
/// 2. **SSE after catch-up**: Attempts SSE connection for live tailing
/// 3. **Fallback to long-poll**: If SSE fails (400 or wrong content type)
///
/// The fallback is transparent to the user - iteration continues seamlessly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum LiveMode {
    /// No live tailing - stop after catching up (first `up_to_date`)
    #[default]
    Off,
    /// Automatic selection: SSE preferred, falls back to long-poll on failure.
    Auto,
    /// Explicit long-polling for live updates
    LongPoll,
    /// Explicit Server-Sent Events for live updates.
    Sse,
}

impl LiveMode {
    /// Convert to query parameter value (if any)
    pub fn to_query_value(&self) -> Option<&str> {
        match self {
            LiveMode::Off => None,
            LiveMode::Auto => Some("sse"), // Try SSE first
            LiveMode::LongPoll => Some("long-poll"),
            LiveMode::Sse => Some("sse"),
        }
    }

    /// Check if this mode involves live tailing
    pub fn is_live(&self) -> bool {
        !matches!(self, LiveMode::Off)
    }
}

/// Sentinel for an empty stream: no message has been appended yet.
pub const OFFSET_BEGINNING: &str = "-1";

/// Format a concrete offset from a generation and a message sequence number.
///
/// Both components are 16-digit zero-padded so that string comparison
/// agrees with numeric comparison.
pub fn format_offset(generation: u64, seq: u64) -> String {
    format!("{:016}_{:016}", generation, seq)
}

/// Parse a concrete offset into (generation, seq). `None` for sentinels
/// and malformed tokens.
pub fn parse_offset(offset: &str) -> Option<(u64, u64)> {
    let (generation, seq) = offset.split_once('_')?;
    if generation.len() != 16 || seq.len() != 16 {
        return None;
    }
    Some((generation.parse().ok()?, seq.parse().ok()?))
}

/// Compare two offset strings. The `-1` sentinel sorts before every
/// concrete offset; concrete offsets compare lexicographically.
pub fn compare_offsets(a: &str, b: &str) -> Ordering {
    a.cmp(b)
}

/// Normalize a content type by stripping charset and parameters.
pub fn normalize_content_type(content_type: &str) -> &str {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
}

/// A message stored in a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Raw message bytes. In JSON mode these end with the single trailing
    /// comma the store uses as a record separator.
    pub data: Vec<u8>,
    /// Concrete offset assigned to this message ("generation_seq")
    pub offset: String,
    /// Timestamp when the message was appended (milliseconds since epoch)
    pub timestamp: i64,
}

/// Stream metadata and messages.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// URL path identifying the stream
    pub path: String,
    /// MIME type of the stream content
    pub content_type: Option<String>,
    /// Messages stored in the stream
    pub messages: Vec<StreamMessage>,
    /// Offset of the last appended message, or "-1" when empty
    pub current_offset: String,
    /// Offset generation; advances when the path is recreated after deletion
    pub generation: u64,
    /// Sequence number of the last appended message (0 when empty)
    pub seq: u64,
    /// Once true the log never grows again
    pub closed: bool,
    /// Time-to-live in seconds (relative TTL)
    pub ttl_seconds: Option<u64>,
    /// Absolute expiration timestamp
    pub expires_at: Option<DateTime<Utc>>,
    /// Creation timestamp (milliseconds since epoch)
    pub created_at: i64,
}

impl StreamEntry {
    /// Create a new stream with the given path and offset generation.
    pub fn new(path: String, generation: u64) -> Self {
        Self {
            path,
            content_type: None,
            messages: Vec::new(),
            current_offset: OFFSET_BEGINNING.to_string(),
            generation,
            seq: 0,
            closed: false,
            ttl_seconds: None,
            expires_at: None,
            created_at: Utc::now().timestamp_millis(),
        }
    }

    /// Check if the stream has expired.
    pub fn is_expired(&self) -> bool {
        if let Some(expires_at) = self.expires_at {
            return Utc::now() >= expires_at;
        }
        if let Some(ttl_seconds) = self.ttl_seconds {
            let expiry = self.created_at + (ttl_seconds as i64 * 1000);
            return Utc::now().timestamp_millis() >= expiry;
        }
        false
    }

    /// Check if this stream uses JSON content type.
    pub fn is_json(&self) -> bool {
        self.content_type
            .as_ref()
            .map(|ct| normalize_content_type(ct) == "application/json")
            .unwrap_or(false)
    }
}

/// Configuration for creating a stream.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    pub content_type: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub initial_data: Option<Vec<u8>>,
    /// Create the stream already closed (seed body, then freeze).
    pub closed: bool,
}

/// Snapshot of a stream's metadata, as served by HEAD.
#[derive(Debug, Clone)]
pub struct StreamHead {
    pub current_offset: String,
    pub content_type: Option<String>,
    pub closed: bool,
}

/// Result of reading from a stream.
#[derive(Debug, Clone)]
pub struct ReadResult {
    /// Messages strictly newer than the requested offset
    pub messages: Vec<StreamMessage>,
    /// Offset of the last returned message, or the stream's current offset
    /// when the slice is empty
    pub offset: String,
    /// Whether the caller is caught up to the tail
    pub up_to_date: bool,
    /// Whether the stream is closed (regardless of caller position)
    pub closed: bool,
}

/// Outcome of a blocking read. Waiter wakes are one-shot: each call
/// resolves exactly once with one of these.
#[derive(Debug, Clone)]
pub enum WaitOutcome {
    /// New messages arrived past the requested offset.
    Messages(ReadResult),
    /// The timeout elapsed with no new data.
    TimedOut { offset: String },
    /// The stream was closed or deleted while waiting.
    StreamClosed { offset: String },
}

/// Server configuration options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Port to listen on (0 for auto-assign)
    pub port: u16,
    /// Host to bind to
    pub host: String,
    /// Long-poll timeout in milliseconds
    pub long_poll_timeout_ms: u64,
    /// Maximum accepted append/seed body size in bytes
    pub max_append_bytes: usize,
    /// Cursor interval in seconds
    pub cursor_interval_seconds: u64,
    /// Cursor epoch for interval calculation
    pub cursor_epoch: DateTime<Utc>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 4437,
            host: "127.0.0.1".to_string(),
            long_poll_timeout_ms: 30_000,
            max_append_bytes: 4 * 1024 * 1024,
            cursor_interval_seconds: 20,
            cursor_epoch: DateTime::parse_from_rfc3339("2024-10-09T00:00:00Z")
                .expect("static epoch")
                .with_timezone(&Utc),
        }
    }
}
