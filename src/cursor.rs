//! Cursor tokens for CDN cache collision prevention.
//!
//! Time is divided into fixed intervals; the cursor is the interval count
//! since a configured epoch. A client echoing a cursor at or ahead of the
//! current interval gets a jittered bump so the token still advances, which
//! keeps collapsed long-poll requests from looping on a cached response.

use chrono::{DateTime, Utc};
use rand::Rng;

/// Options for cursor calculation.
#[derive(Debug, Clone)]
pub struct CursorOptions {
    /// Interval duration in seconds
    pub interval_seconds: u64,
    /// Epoch for interval calculation
    pub epoch: DateTime<Utc>,
}

impl Default for CursorOptions {
    fn default() -> Self {
        Self {
            interval_seconds: 20,
            epoch: DateTime::parse_from_rfc3339("2024-10-09T00:00:00Z")
                .expect("static epoch")
                .with_timezone(&Utc),
        }
    }
}

/// Number of whole intervals elapsed since the epoch.
pub fn interval_cursor(options: &CursorOptions) -> u64 {
    let elapsed = Utc::now()
        .signed_duration_since(options.epoch)
        .num_seconds()
        .max(0) as u64;
    elapsed / options.interval_seconds.max(1)
}

/// Produce the cursor to return for a response, guaranteed `>=` the cursor
/// the client sent (monotone per client).
pub fn next_cursor(client_cursor: Option<u64>, options: &CursorOptions) -> u64 {
    let current = interval_cursor(options);

    match client_cursor {
        Some(cursor) if cursor >= current => {
            // Client is at or ahead of the current interval; jitter forward
            // so the token still changes.
            let jitter_seconds: u64 = rand::thread_rng().gen_range(1..=3600);
            let jitter_intervals = jitter_seconds / options.interval_seconds.max(1);
            cursor + jitter_intervals.max(1)
        }
        Some(cursor) => current.max(cursor),
        None => current,
    }
}

/// Parse a cursor query value.
pub fn parse_cursor(cursor: &str) -> Option<u64> {
    cursor.parse().ok()
}
