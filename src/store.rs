//! In-memory stream storage.
//!
//! Thread-safe registry of append-only logs with long-poll coordination.
//! Mutations (append, close, delete) run under the registry write lock;
//! waiters are woken through a broadcast channel and re-check state outside
//! the lock, so wakes are one-shot and carry no stale snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::codec;
use crate::error::StoreError;
use crate::producers::{ProducerAppend, ProducerDecision, ProducerTable};
use crate::types::{
    compare_offsets, format_offset, normalize_content_type, parse_offset, ReadResult, StreamConfig,
    StreamEntry, StreamHead, StreamMessage, WaitOutcome, OFFSET_BEGINNING,
};

/// Notification fanned out to blocked readers.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub path: String,
    pub kind: StreamEventKind,
}

#[derive(Debug, Clone)]
pub enum StreamEventKind {
    Appended { offset: String },
    Closed,
    Deleted,
}

/// Outcome of an append.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    /// Offset of the last record this request put on the log, or the
    /// previously assigned offset for an idempotent replay.
    pub offset: String,
    /// True when this was a producer replay and nothing was appended.
    pub duplicate: bool,
    /// The producer row's last acknowledged sequence, on replay.
    pub received_seq: Option<u64>,
}

struct Registry {
    streams: HashMap<String, StreamEntry>,
    /// Offset generation for the next incarnation of a deleted path.
    tombstones: HashMap<String, u64>,
}

/// In-memory stream store with long-poll support.
pub struct StreamStore {
    registry: RwLock<Registry>,
    notify_tx: broadcast::Sender<StreamEvent>,
    producers: ProducerTable,
}

impl StreamStore {
    /// Create a new empty stream store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to stream events (appends, closes, deletes).
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.notify_tx.subscribe()
    }

    /// Check if a stream exists (and is not expired).
    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Get a snapshot of a stream by path, evicting it first if expired.
    pub fn get(&self, path: &str) -> Option<StreamEntry> {
        let mut registry = self.registry.write();
        if self.evict_if_expired(&mut registry, path) {
            return None;
        }
        registry.streams.get(path).cloned()
    }

    /// Metadata snapshot for HEAD.
    pub fn head(&self, path: &str) -> Option<StreamHead> {
        self.get(path).map(|s| StreamHead {
            current_offset: s.current_offset.clone(),
            content_type: s.content_type.clone(),
            closed: s.closed,
        })
    }

    /// Offset of the last appended message, or "-1" for an empty stream.
    pub fn current_offset(&self, path: &str) -> Option<String> {
        self.get(path).map(|s| s.current_offset)
    }

    /// Create a new stream.
    ///
    /// Idempotent: returns Ok(true) if created, Ok(false) if it already
    /// exists with the same content type, and `ConflictExists` otherwise.
    /// Recreating a previously deleted path starts a fresh offset
    /// generation.
    pub fn create(&self, path: &str, config: StreamConfig) -> Result<bool, StoreError> {
        if config.ttl_seconds.is_some() && config.expires_at.is_some() {
            return Err(StoreError::TtlConflict);
        }

        let mut registry = self.registry.write();
        self.evict_if_expired(&mut registry, path);

        if let Some(existing) = registry.streams.get(path) {
            let existing_ct = existing.content_type.as_deref().map(normalize_content_type);
            let new_ct = config.content_type.as_deref().map(normalize_content_type);
            if existing_ct != new_ct {
                return Err(StoreError::ConflictExists);
            }
            return Ok(false);
        }

        let generation = registry.tombstones.remove(path).unwrap_or(0);
        let mut stream = StreamEntry::new(path.to_string(), generation);
        stream.content_type = config.content_type.clone();
        stream.ttl_seconds = config.ttl_seconds;
        stream.expires_at = config.expires_at;

        if let Some(data) = config.initial_data {
            if !data.is_empty() {
                append_records(&mut stream, data)?;
            }
        }
        stream.closed = config.closed;

        info!(path = %path, generation, "created stream");
        registry.streams.insert(path.to_string(), stream);
        Ok(true)
    }

    /// Append data to a stream.
    ///
    /// In JSON mode a body that is a JSON array appends one record per
    /// element; any other body is a single record. With producer headers
    /// the append is deduplicated and fenced through the producer table.
    pub fn append(
        &self,
        path: &str,
        data: Vec<u8>,
        content_type: Option<&str>,
        producer: Option<&ProducerAppend>,
    ) -> Result<AppendOutcome, StoreError> {
        if data.is_empty() {
            return Err(StoreError::EmptyBody);
        }

        let mut registry = self.registry.write();
        if self.evict_if_expired(&mut registry, path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        let stream = registry
            .streams
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        if stream.closed {
            return Err(StoreError::StreamClosed);
        }

        if let Some(ct) = content_type {
            if let Some(ref stream_ct) = stream.content_type {
                if normalize_content_type(ct) != normalize_content_type(stream_ct) {
                    return Err(StoreError::ContentTypeMismatch {
                        expected: stream_ct.clone(),
                        actual: ct.to_string(),
                    });
                }
            }
        }

        if let Some(req) = producer {
            match self.producers.check(path, req)? {
                ProducerDecision::Append => {}
                ProducerDecision::Duplicate { offset, last_seq } => {
                    debug!(path = %path, producer = %req.producer_id, seq = req.seq,
                        "idempotent replay");
                    return Ok(AppendOutcome {
                        offset,
                        duplicate: true,
                        received_seq: Some(last_seq),
                    });
                }
            }
        }

        let offset = append_records(stream, data)?;
        if let Some(req) = producer {
            self.producers.commit(path, req, &offset);
        }

        debug!(path = %path, offset = %offset, "appended to stream");
        let _ = self.notify_tx.send(StreamEvent {
            path: path.to_string(),
            kind: StreamEventKind::Appended {
                offset: offset.clone(),
            },
        });

        Ok(AppendOutcome {
            offset,
            duplicate: false,
            received_seq: None,
        })
    }

    /// Close a stream: append the trailing body (if any), freeze the log,
    /// and wake all waiters. Returns the final offset.
    ///
    /// Closing an already-closed stream without a body is idempotent;
    /// with a body it is rejected.
    pub fn close(&self, path: &str, trailing: Option<Vec<u8>>) -> Result<String, StoreError> {
        let final_offset = {
            let mut registry = self.registry.write();
            if self.evict_if_expired(&mut registry, path) {
                return Err(StoreError::NotFound(path.to_string()));
            }
            let stream = registry
                .streams
                .get_mut(path)
                .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

            let trailing = trailing.filter(|t| !t.is_empty());
            if stream.closed {
                if trailing.is_some() {
                    return Err(StoreError::StreamClosed);
                }
                return Ok(stream.current_offset.clone());
            }

            if let Some(data) = trailing {
                append_records(stream, data)?;
            }
            stream.closed = true;
            stream.current_offset.clone()
        };

        info!(path = %path, offset = %final_offset, "closed stream");
        let _ = self.notify_tx.send(StreamEvent {
            path: path.to_string(),
            kind: StreamEventKind::Closed,
        });
        Ok(final_offset)
    }

    /// Delete a stream, waking all waiters and recording the next offset
    /// generation for this path.
    pub fn delete(&self, path: &str) -> bool {
        let removed = {
            let mut registry = self.registry.write();
            match registry.streams.remove(path) {
                Some(stream) => {
                    registry
                        .tombstones
                        .insert(path.to_string(), stream.generation + 1);
                    true
                }
                None => false,
            }
        };

        if removed {
            self.producers.drop_path(path);
            info!(path = %path, "deleted stream");
            let _ = self.notify_tx.send(StreamEvent {
                path: path.to_string(),
                kind: StreamEventKind::Deleted,
            });
        }
        removed
    }

    /// Read messages strictly newer than the given offset.
    ///
    /// `-1` reads the whole log; `now` resolves to the current tail and
    /// returns an empty, up-to-date slice. A concrete offset from a
    /// different generation is rejected.
    pub fn read(&self, path: &str, offset: &str) -> Result<ReadResult, StoreError> {
        let stream = self
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        let from = match offset {
            "now" => stream.current_offset.clone(),
            other => other.to_string(),
        };

        if from != OFFSET_BEGINNING {
            let (generation, _) =
                parse_offset(&from).ok_or_else(|| StoreError::InvalidOffset(from.clone()))?;
            if generation != stream.generation {
                return Err(StoreError::InvalidOffset(from.clone()));
            }
        }

        let messages: Vec<StreamMessage> = if from == OFFSET_BEGINNING {
            stream.messages.clone()
        } else {
            stream
                .messages
                .iter()
                .filter(|m| compare_offsets(&m.offset, &from) == std::cmp::Ordering::Greater)
                .cloned()
                .collect()
        };

        let (offset, up_to_date) = match messages.last() {
            Some(last) => (
                last.offset.clone(),
                last.offset == stream.current_offset,
            ),
            None => (
                stream.current_offset.clone(),
                compare_offsets(&from, &stream.current_offset) != std::cmp::Ordering::Less,
            ),
        };

        Ok(ReadResult {
            messages,
            offset,
            up_to_date,
            closed: stream.closed,
        })
    }

    /// Block until messages newer than `offset` exist, the stream closes or
    /// is deleted, or the timeout elapses. Returns immediately when data is
    /// already available. Cancellation is cooperative: dropping the future
    /// deregisters the waiter with no side effect.
    pub async fn wait_for_messages(
        &self,
        path: &str,
        offset: &str,
        timeout: Duration,
    ) -> Result<WaitOutcome, StoreError> {
        // Subscribe before the first check so an append between check and
        // wait cannot be missed.
        let mut rx = self.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut waited = false;
        let mut last_offset = offset.to_string();

        loop {
            match self.read(path, offset) {
                Ok(result) => {
                    if !result.messages.is_empty() {
                        return Ok(WaitOutcome::Messages(result));
                    }
                    if result.closed {
                        return Ok(WaitOutcome::StreamClosed {
                            offset: result.offset,
                        });
                    }
                    last_offset = result.offset;
                }
                // Deleted (or already recreated under a fresh generation)
                // while we were waiting: the waiter is told the stream it
                // was following is gone, not handed an error.
                Err(StoreError::NotFound(_)) | Err(StoreError::InvalidOffset(_)) if waited => {
                    return Ok(WaitOutcome::StreamClosed {
                        offset: last_offset,
                    });
                }
                Err(e) => return Err(e),
            }
            waited = true;

            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return Ok(WaitOutcome::TimedOut {
                        offset: last_offset,
                    });
                }
                match tokio::time::timeout(remaining, rx.recv()).await {
                    Ok(Ok(event)) if event.path == path => break,
                    Ok(Ok(_)) => continue,
                    Ok(Err(broadcast::error::RecvError::Lagged(_))) => break,
                    Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                        return Ok(WaitOutcome::TimedOut {
                            offset: last_offset,
                        });
                    }
                }
            }
        }
    }

    /// Format a read response based on the stream's content type.
    pub fn format_response(&self, path: &str, messages: &[StreamMessage]) -> Vec<u8> {
        match self.get(path) {
            Some(stream) if stream.is_json() => codec::format_json_response(messages),
            _ => codec::format_binary_response(messages),
        }
    }

    /// List all non-expired stream paths.
    pub fn list(&self) -> Vec<String> {
        let registry = self.registry.read();
        registry
            .streams
            .iter()
            .filter(|(_, s)| !s.is_expired())
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Drop all streams and tombstones.
    pub fn clear(&self) {
        let mut registry = self.registry.write();
        registry.streams.clear();
        registry.tombstones.clear();
    }

    /// Evict an expired entry, leaving a tombstone so the next incarnation
    /// starts a fresh generation. Returns true when an eviction happened.
    fn evict_if_expired(&self, registry: &mut Registry, path: &str) -> bool {
        let expired = registry
            .streams
            .get(path)
            .map(|s| s.is_expired())
            .unwrap_or(false);
        if expired {
            if let Some(stream) = registry.streams.remove(path) {
                registry
                    .tombstones
                    .insert(path.to_string(), stream.generation + 1);
                self.producers.drop_path(path);
                info!(path = %path, "evicted expired stream");
                let _ = self.notify_tx.send(StreamEvent {
                    path: path.to_string(),
                    kind: StreamEventKind::Deleted,
                });
            }
        }
        expired
    }
}

impl Default for StreamStore {
    fn default() -> Self {
        let (notify_tx, _) = broadcast::channel(1024);
        Self {
            registry: RwLock::new(Registry {
                streams: HashMap::new(),
                tombstones: HashMap::new(),
            }),
            notify_tx,
            producers: ProducerTable::new(),
        }
    }
}

/// Append a request body to the log, splitting JSON arrays into one record
/// per element. Returns the offset of the last record written.
fn append_records(stream: &mut StreamEntry, data: Vec<u8>) -> Result<String, StoreError> {
    let records: Vec<Vec<u8>> = if stream.is_json() {
        // Producers of individual records must not include their own
        // record separator; tolerate one by stripping trailing commas
        // before parsing.
        let mut trimmed: &[u8] = &data;
        while let Some((b',', rest)) = split_last_non_space(trimmed) {
            trimmed = rest;
        }
        let value: serde_json::Value = serde_json::from_slice(trimmed)
            .map_err(|e| StoreError::InvalidJson(e.to_string()))?;
        match value {
            serde_json::Value::Array(items) => {
                if items.is_empty() {
                    return Err(StoreError::EmptyArrayNotAllowed);
                }
                items
                    .iter()
                    .map(|item| {
                        codec::json_encode_message(item)
                            .map_err(|e| StoreError::InvalidJson(e.to_string()))
                    })
                    .collect::<Result<_, _>>()?
            }
            other => vec![codec::json_encode_message(&other)
                .map_err(|e| StoreError::InvalidJson(e.to_string()))?],
        }
    } else {
        vec![data]
    };

    let now = Utc::now().timestamp_millis();
    let mut offset = stream.current_offset.clone();
    for record in records {
        stream.seq += 1;
        offset = format_offset(stream.generation, stream.seq);
        stream.messages.push(StreamMessage {
            data: record,
            offset: offset.clone(),
            timestamp: now,
        });
    }
    stream.current_offset = offset.clone();
    Ok(offset)
}

/// Last non-whitespace byte of a body plus everything before it.
fn split_last_non_space(data: &[u8]) -> Option<(u8, &[u8])> {
    let end = data.iter().rposition(|b| !b.is_ascii_whitespace())?;
    Some((data[end], &data[..end]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::format_offset;

    fn json_config() -> StreamConfig {
        StreamConfig {
            content_type: Some("application/json".to_string()),
            ..Default::default()
        }
    }

    fn text_config() -> StreamConfig {
        StreamConfig {
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_get_stream() {
        let store = StreamStore::new();
        assert!(store.create("/t", text_config()).unwrap());

        let stream = store.get("/t").unwrap();
        assert_eq!(stream.path, "/t");
        assert_eq!(stream.current_offset, OFFSET_BEGINNING);
        assert!(!stream.closed);
    }

    #[test]
    fn test_create_idempotent_and_conflicting() {
        let store = StreamStore::new();
        assert!(store.create("/t", text_config()).unwrap());
        assert!(!store.create("/t", text_config()).unwrap());
        assert!(matches!(
            store.create("/t", json_config()),
            Err(StoreError::ConflictExists)
        ));
    }

    #[test]
    fn test_append_offsets_strictly_increase() {
        let store = StreamStore::new();
        store.create("/t", text_config()).unwrap();

        let o1 = store.append("/t", b"a".to_vec(), None, None).unwrap().offset;
        let o2 = store.append("/t", b"b".to_vec(), None, None).unwrap().offset;
        let o3 = store.append("/t", b"c".to_vec(), None, None).unwrap().offset;
        assert!(o1 < o2 && o2 < o3);

        let all = store.read("/t", OFFSET_BEGINNING).unwrap();
        let offsets: Vec<&str> = all.messages.iter().map(|m| m.offset.as_str()).collect();
        assert_eq!(offsets, vec![o1.as_str(), o2.as_str(), o3.as_str()]);
        assert!(all.up_to_date);
    }

    #[test]
    fn test_read_after_offset_is_strict() {
        let store = StreamStore::new();
        store.create("/t", text_config()).unwrap();
        let o1 = store.append("/t", b"m1".to_vec(), None, None).unwrap().offset;
        store.append("/t", b"m2".to_vec(), None, None).unwrap();

        let result = store.read("/t", &o1).unwrap();
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].data, b"m2");
        assert!(result.up_to_date);
    }

    #[test]
    fn test_read_at_tail_is_empty_and_up_to_date() {
        let store = StreamStore::new();
        store.create("/t", text_config()).unwrap();
        let tail = store.append("/t", b"x".to_vec(), None, None).unwrap().offset;

        let result = store.read("/t", &tail).unwrap();
        assert!(result.messages.is_empty());
        assert!(result.up_to_date);
        assert_eq!(result.offset, tail);
    }

    #[test]
    fn test_read_now_resolves_to_tail() {
        let store = StreamStore::new();
        store.create("/t", text_config()).unwrap();
        store.append("/t", b"x".to_vec(), None, None).unwrap();

        let result = store.read("/t", "now").unwrap();
        assert!(result.messages.is_empty());
        assert!(result.up_to_date);
    }

    #[test]
    fn test_empty_stream_read_from_beginning() {
        let store = StreamStore::new();
        store.create("/t", text_config()).unwrap();
        let result = store.read("/t", OFFSET_BEGINNING).unwrap();
        assert!(result.messages.is_empty());
        assert!(result.up_to_date);
        assert_eq!(result.offset, OFFSET_BEGINNING);
    }

    #[test]
    fn test_json_array_appends_per_element() {
        let store = StreamStore::new();
        store.create("/j", json_config()).unwrap();
        store
            .append("/j", b"[{\"a\":1},{\"a\":2}]".to_vec(), None, None)
            .unwrap();

        let result = store.read("/j", OFFSET_BEGINNING).unwrap();
        assert_eq!(result.messages.len(), 2);
        let body = store.format_response("/j", &result.messages);
        assert_eq!(body, b"[{\"a\":1},{\"a\":2}]");
    }

    #[test]
    fn test_json_empty_array_rejected() {
        let store = StreamStore::new();
        store.create("/j", json_config()).unwrap();
        assert!(matches!(
            store.append("/j", b"[]".to_vec(), None, None),
            Err(StoreError::EmptyArrayNotAllowed)
        ));
    }

    #[test]
    fn test_json_trailing_separator_stripped() {
        let store = StreamStore::new();
        store.create("/j", json_config()).unwrap();
        store
            .append("/j", b"{\"a\":1},".to_vec(), None, None)
            .unwrap();

        let result = store.read("/j", OFFSET_BEGINNING).unwrap();
        assert_eq!(
            store.format_response("/j", &result.messages),
            b"[{\"a\":1}]"
        );
    }

    #[test]
    fn test_json_invalid_body_rejected() {
        let store = StreamStore::new();
        store.create("/j", json_config()).unwrap();
        assert!(matches!(
            store.append("/j", b"{nope".to_vec(), None, None),
            Err(StoreError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_append_content_type_mismatch() {
        let store = StreamStore::new();
        store.create("/t", text_config()).unwrap();
        assert!(matches!(
            store.append("/t", b"x".to_vec(), Some("application/json"), None),
            Err(StoreError::ContentTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_close_freezes_log() {
        let store = StreamStore::new();
        store.create("/t", text_config()).unwrap();
        store.append("/t", b"a".to_vec(), None, None).unwrap();

        let final_offset = store.close("/t", Some(b"b".to_vec())).unwrap();
        assert_eq!(final_offset, format_offset(0, 2));

        let result = store.read("/t", OFFSET_BEGINNING).unwrap();
        assert_eq!(result.messages.len(), 2);
        assert!(result.closed);

        assert!(matches!(
            store.append("/t", b"c".to_vec(), None, None),
            Err(StoreError::StreamClosed)
        ));

        // Idempotent close without a body; close with a body is rejected.
        assert_eq!(store.close("/t", None).unwrap(), final_offset);
        assert!(matches!(
            store.close("/t", Some(b"d".to_vec())),
            Err(StoreError::StreamClosed)
        ));
    }

    #[test]
    fn test_delete_and_recreate_advances_generation() {
        let store = StreamStore::new();
        store.create("/t", text_config()).unwrap();
        let old = store.append("/t", b"a".to_vec(), None, None).unwrap().offset;

        assert!(store.delete("/t"));
        assert!(!store.delete("/t"));
        assert!(!store.has("/t"));

        store.create("/t", text_config()).unwrap();
        let fresh = store.append("/t", b"b".to_vec(), None, None).unwrap().offset;
        assert!(fresh > old);

        // Offsets from the previous incarnation are rejected.
        assert!(matches!(
            store.read("/t", &old),
            Err(StoreError::InvalidOffset(_))
        ));
    }

    #[test]
    fn test_producer_replay_appends_once() {
        let store = StreamStore::new();
        store.create("/t", text_config()).unwrap();
        let req = ProducerAppend {
            producer_id: "p".to_string(),
            epoch: 1,
            seq: 1,
            auto_claim: false,
        };

        let first = store.append("/t", b"x".to_vec(), None, Some(&req)).unwrap();
        assert!(!first.duplicate);

        let replay = store.append("/t", b"x".to_vec(), None, Some(&req)).unwrap();
        assert!(replay.duplicate);
        assert_eq!(replay.offset, first.offset);
        assert_eq!(replay.received_seq, Some(1));

        let log = store.read("/t", OFFSET_BEGINNING).unwrap();
        assert_eq!(log.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_data_exists() {
        let store = StreamStore::new();
        store.create("/t", text_config()).unwrap();
        store.append("/t", b"a".to_vec(), None, None).unwrap();

        let outcome = store
            .wait_for_messages("/t", OFFSET_BEGINNING, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Messages(_)));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_append() {
        let store = StreamStore::new();
        store.create("/t", text_config()).unwrap();
        let tail = store.append("/t", b"a".to_vec(), None, None).unwrap().offset;

        let waiter = {
            let store = store.clone();
            let tail = tail.clone();
            tokio::spawn(async move {
                store
                    .wait_for_messages("/t", &tail, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.append("/t", b"b".to_vec(), None, None).unwrap();

        match waiter.await.unwrap().unwrap() {
            WaitOutcome::Messages(result) => {
                assert_eq!(result.messages.len(), 1);
                assert_eq!(result.messages[0].data, b"b");
            }
            other => panic!("expected messages, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let store = StreamStore::new();
        store.create("/t", text_config()).unwrap();

        let outcome = store
            .wait_for_messages("/t", OFFSET_BEGINNING, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_wait_observes_delete() {
        let store = StreamStore::new();
        store.create("/t", text_config()).unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .wait_for_messages("/t", OFFSET_BEGINNING, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.delete("/t");

        assert!(matches!(
            waiter.await.unwrap().unwrap(),
            WaitOutcome::StreamClosed { .. }
        ));
    }

    #[tokio::test]
    async fn test_wait_observes_close() {
        let store = StreamStore::new();
        store.create("/t", text_config()).unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .wait_for_messages("/t", "now", Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.close("/t", None).unwrap();

        assert!(matches!(
            waiter.await.unwrap().unwrap(),
            WaitOutcome::StreamClosed { .. }
        ));
    }
}
