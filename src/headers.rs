//! Protocol header names, shared by the server handlers and the client.
//!
//! Input matching is case-insensitive (the http crate normalizes to
//! lowercase); these are the canonical wire names.

pub const STREAM_OFFSET: &str = "stream-offset";
pub const STREAM_UP_TO_DATE: &str = "stream-up-to-date";
pub const STREAM_CLOSED: &str = "stream-closed";
pub const STREAM_CURSOR: &str = "stream-cursor";
pub const STREAM_TTL: &str = "stream-ttl";
pub const STREAM_EXPIRES_AT: &str = "stream-expires-at";
pub const STREAM_SSE_DATA_ENCODING: &str = "stream-sse-data-encoding";

pub const PRODUCER_ID: &str = "producer-id";
pub const PRODUCER_EPOCH: &str = "producer-epoch";
pub const PRODUCER_SEQ: &str = "producer-seq";
pub const PRODUCER_AUTO_CLAIM: &str = "producer-auto-claim";
pub const PRODUCER_EXPECTED_SEQ: &str = "producer-expected-seq";
pub const PRODUCER_RECEIVED_SEQ: &str = "producer-received-seq";
