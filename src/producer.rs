//! Idempotent producer: batching, an ordered in-flight window, and
//! epoch-fenced exactly-once delivery as visible on the log.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::sleep;
use tracing::debug;

use crate::error::{ProducerError, StreamError};
use crate::headers::*;
use crate::stream::StreamHandle;
use crate::types::Offset;

/// Receipt from an acknowledged append operation.
#[derive(Debug, Clone)]
pub struct AppendReceipt {
    /// Offset of the last record this batch put on the log.
    pub offset: Offset,
    /// Whether this was a duplicate (idempotent success, data already existed).
    pub duplicate: bool,
}

/// Type alias for error callback function.
pub type OnErrorCallback = Arc<dyn Fn(ProducerError) + Send + Sync>;

/// Builder for configuring an idempotent producer.
#[must_use = "builders do nothing unless you call .build()"]
pub struct ProducerBuilder {
    stream: StreamHandle,
    producer_id: String,
    epoch: u64,
    auto_claim: bool,
    max_batch_bytes: usize,
    linger: Duration,
    max_in_flight: usize,
    content_type: Option<String>,
    on_error: Option<OnErrorCallback>,
}

impl ProducerBuilder {
    pub(crate) fn new(stream: StreamHandle, producer_id: String) -> Self {
        Self {
            stream,
            producer_id,
            epoch: 0,
            auto_claim: false,
            max_batch_bytes: 1024 * 1024,
            linger: Duration::from_millis(5),
            max_in_flight: 1,
            content_type: None,
            on_error: None,
        }
    }

    /// Set the starting epoch.
    pub fn epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    /// Enable epoch takeover when the server reports a newer epoch.
    pub fn auto_claim(mut self, enabled: bool) -> Self {
        self.auto_claim = enabled;
        self
    }

    /// Set maximum batch size in bytes.
    pub fn max_batch_bytes(mut self, bytes: usize) -> Self {
        self.max_batch_bytes = bytes;
        self
    }

    /// Set linger time before sending a batch.
    pub fn linger(mut self, duration: Duration) -> Self {
        self.linger = duration;
        self
    }

    /// Set maximum in-flight batches. The default of 1 preserves strict
    /// call-order on the log; larger windows weaken cross-batch ordering.
    pub fn max_in_flight(mut self, count: usize) -> Self {
        self.max_in_flight = count.max(1);
        self
    }

    /// Set content type for appends.
    pub fn content_type(mut self, ct: impl Into<String>) -> Self {
        self.content_type = Some(ct.into());
        self
    }

    /// Set error callback for batch failures.
    ///
    /// Following Kafka semantics, errors from batch sends are reported via
    /// this callback rather than through `flush()`. This enables
    /// fire-and-forget usage while still allowing error handling.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProducerError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Build the producer.
    pub fn build(self) -> Producer {
        let content_type = self.content_type.unwrap_or_else(|| {
            self.stream
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string())
        });

        let linger = self.linger;

        let producer = Producer {
            stream: self.stream,
            producer_id: self.producer_id,
            state: Arc::new(Mutex::new(ProducerState {
                epoch: self.epoch,
                next_seq: 1,
                pending_batch: Vec::with_capacity(1024),
                batch_bytes: 0,
                closed: false,
                epoch_claimed: !self.auto_claim,
                batch_started_at: None,
            })),
            config: Arc::new(ProducerConfig {
                auto_claim: self.auto_claim,
                max_batch_bytes: self.max_batch_bytes,
                linger,
                max_in_flight: self.max_in_flight,
                content_type,
                on_error: self.on_error,
            }),
            in_flight: Arc::new(AtomicUsize::new(0)),
        };

        // Spawn linger task if linger > 0
        if linger > Duration::ZERO {
            let producer_clone = producer.clone();
            tokio::spawn(async move {
                producer_clone.linger_task().await;
            });
        }

        producer
    }
}

struct ProducerConfig {
    auto_claim: bool,
    max_batch_bytes: usize,
    linger: Duration,
    max_in_flight: usize,
    content_type: String,
    on_error: Option<OnErrorCallback>,
}

struct ProducerState {
    epoch: u64,
    /// Sequence for the next batch; the protocol starts at 1.
    next_seq: u64,
    pending_batch: Vec<PendingEntry>,
    batch_bytes: usize,
    closed: bool,
    epoch_claimed: bool,
    /// When the first item was added to the current pending batch
    batch_started_at: Option<Instant>,
}

struct PendingEntry {
    data: Bytes,
    #[cfg(feature = "json")]
    json_data: Option<serde_json::Value>,
}

/// Idempotent producer with exactly-once semantics.
///
/// Provides high-throughput, fire-and-forget writes with automatic
/// batching, pipelining, and deduplicated delivery via producer ID, epoch,
/// and sequence numbers.
#[derive(Clone)]
pub struct Producer {
    stream: StreamHandle,
    producer_id: String,
    state: Arc<Mutex<ProducerState>>,
    config: Arc<ProducerConfig>,
    in_flight: Arc<AtomicUsize>,
}

impl Producer {
    /// Append data (fire-and-forget, batched internally).
    ///
    /// Returns immediately - data is queued for sending.
    /// Use `flush()` to wait for all data to be written.
    ///
    /// # Silent Failures
    ///
    /// This method silently ignores appends if the producer is closed.
    /// Network and server errors during batch sending are not surfaced
    /// per-append; use the `on_error` callback and `flush()`.
    #[inline]
    pub fn append(&self, data: impl Into<Bytes>) {
        let data = data.into();
        let data_len = data.len();

        let mut state = self.state.lock();
        if state.closed {
            return; // Silently ignore if closed
        }

        if state.pending_batch.is_empty() {
            state.batch_started_at = Some(Instant::now());
        }

        state.pending_batch.push(PendingEntry {
            data,
            #[cfg(feature = "json")]
            json_data: None,
        });
        state.batch_bytes += data_len;

        if state.batch_bytes >= self.config.max_batch_bytes {
            self.send_batch_locked(&mut state);
        }
    }

    /// Append JSON data (fire-and-forget).
    #[cfg(feature = "json")]
    #[inline]
    pub fn append_json<T: serde::Serialize>(&self, data: &T) {
        let json_value = match serde_json::to_value(data) {
            Ok(v) => v,
            Err(_) => return, // Silently ignore serialization errors
        };
        let json_bytes = match serde_json::to_vec(&json_value) {
            Ok(b) => b,
            Err(_) => return,
        };

        let mut state = self.state.lock();
        if state.closed {
            return;
        }

        if state.pending_batch.is_empty() {
            state.batch_started_at = Some(Instant::now());
        }

        let len = json_bytes.len();
        state.pending_batch.push(PendingEntry {
            data: Bytes::from(json_bytes),
            json_data: Some(json_value),
        });
        state.batch_bytes += len;

        if state.batch_bytes >= self.config.max_batch_bytes {
            self.send_batch_locked(&mut state);
        }
    }

    /// Flush all pending data and wait for all in-flight batches to complete.
    ///
    /// Errors are reported via the `on_error` callback (if configured), not
    /// through the return value.
    pub async fn flush(&self) -> Result<(), ProducerError> {
        loop {
            let has_pending = {
                let mut state = self.state.lock();
                if !state.pending_batch.is_empty() {
                    self.send_batch_locked(&mut state);
                }
                !state.pending_batch.is_empty()
            };

            let in_flight = self.in_flight.load(Ordering::Acquire);

            if !has_pending && in_flight == 0 {
                break;
            }

            // Yield to let in-flight requests complete
            tokio::task::yield_now().await;
        }

        Ok(())
    }

    /// Flush, then close the stream (optionally with a trailing body).
    /// Returns the final offset.
    pub async fn close(&self, body: Option<Bytes>) -> Result<Offset, ProducerError> {
        self.flush().await?;

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ProducerError::Closed);
            }
            state.closed = true;
        }

        let response = self.stream.close(body).await?;
        Ok(response.final_offset)
    }

    /// Cancel pending batches without closing the stream. In-flight
    /// requests run to completion.
    pub fn detach(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending_batch.clear();
        state.batch_bytes = 0;
        state.batch_started_at = None;
    }

    /// Get the current epoch.
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Get the next sequence number.
    pub fn next_seq(&self) -> u64 {
        self.state.lock().next_seq
    }

    /// Background task that sends batches after linger duration.
    async fn linger_task(&self) {
        let linger = self.config.linger;

        loop {
            sleep(linger).await;

            let should_send = {
                let state = self.state.lock();
                if state.closed {
                    return; // Stop the task
                }
                if let Some(started_at) = state.batch_started_at {
                    started_at.elapsed() >= linger
                } else {
                    false
                }
            };

            if should_send {
                let mut state = self.state.lock();
                if !state.pending_batch.is_empty() {
                    self.send_batch_locked(&mut state);
                }
            }
        }
    }

    /// Send the current batch in a background task.
    ///
    /// Called while holding the state lock: the batch is drained into owned
    /// data and the actual send is spawned, so the lock is never held
    /// across an await point.
    fn send_batch_locked(&self, state: &mut ProducerState) {
        if state.pending_batch.is_empty() {
            return;
        }

        let in_flight = self.in_flight.load(Ordering::Acquire);
        if in_flight >= self.config.max_in_flight {
            return;
        }

        // An unclaimed epoch must win its first ack before pipelining.
        if self.config.auto_claim && !state.epoch_claimed && in_flight > 0 {
            return;
        }

        let batch: Vec<_> = state.pending_batch.drain(..).collect();
        let seq = state.next_seq;
        let epoch = state.epoch;

        state.next_seq += 1;
        state.batch_bytes = 0;
        state.batch_started_at = None;

        self.in_flight.fetch_add(1, Ordering::AcqRel);

        let stream = self.stream.clone();
        let producer_id = self.producer_id.clone();
        let config = self.config.clone();
        let in_flight_counter = self.in_flight.clone();
        let state_arc = self.state.clone();

        tokio::spawn(async move {
            let result = send_batch(
                &stream,
                &producer_id,
                &config.content_type,
                batch,
                seq,
                epoch,
                config.auto_claim,
                &state_arc,
                0,
            )
            .await;

            match &result {
                Ok(receipt) => {
                    debug!(seq, duplicate = receipt.duplicate, "batch acknowledged");
                    let mut state = state_arc.lock();
                    if !state.epoch_claimed {
                        state.epoch_claimed = true;
                    }
                }
                Err(e) => {
                    if let Some(callback) = &config.on_error {
                        callback(e.clone());
                    }
                }
            }

            in_flight_counter.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

/// Number of 409 retries before a gap is surfaced; out-of-order arrivals
/// within the in-flight window resolve well before this.
const MAX_409_RETRIES: u32 = 10;

#[allow(clippy::too_many_arguments)]
async fn send_batch(
    stream: &StreamHandle,
    producer_id: &str,
    content_type: &str,
    batch: Vec<PendingEntry>,
    seq: u64,
    epoch: u64,
    auto_claim: bool,
    state: &Arc<Mutex<ProducerState>>,
    retry_count: u32,
) -> Result<AppendReceipt, ProducerError> {
    let is_json = content_type.to_lowercase().contains("application/json");

    // Build body
    let body = if is_json {
        #[cfg(feature = "json")]
        {
            let json_count = batch.iter().filter(|e| e.json_data.is_some()).count();
            let raw_count = batch.len() - json_count;

            if json_count > 0 && raw_count > 0 {
                // Mixed types in a JSON batch would silently drop entries
                return Err(ProducerError::MixedAppendTypes);
            }

            if json_count > 0 {
                // Wrap in an array; the server appends one record per element
                let values: Vec<serde_json::Value> =
                    batch.iter().filter_map(|e| e.json_data.clone()).collect();
                serde_json::to_vec(&values).unwrap_or_default()
            } else {
                batch
                    .iter()
                    .flat_map(|e| e.data.iter().copied())
                    .collect::<Vec<u8>>()
            }
        }
        #[cfg(not(feature = "json"))]
        {
            batch
                .iter()
                .flat_map(|e| e.data.iter().copied())
                .collect::<Vec<u8>>()
        }
    } else {
        batch
            .iter()
            .flat_map(|e| e.data.iter().copied())
            .collect::<Vec<u8>>()
    };

    let mut req = stream
        .client
        .inner
        .post(stream.url())
        .header("content-type", content_type)
        .header(PRODUCER_ID, producer_id)
        .header(PRODUCER_EPOCH, epoch.to_string())
        .header(PRODUCER_SEQ, seq.to_string());
    if auto_claim {
        req = req.header(PRODUCER_AUTO_CLAIM, "true");
    }
    for (key, value) in stream.client.get_headers().iter() {
        req = req.header(key.clone(), value.clone());
    }

    let resp = req.body(body).send().await?;
    let status = resp.status().as_u16();

    match status {
        200 | 204 => {
            let offset = resp
                .headers()
                .get(STREAM_OFFSET)
                .and_then(|v| v.to_str().ok())
                .map(Offset::parse)
                .unwrap_or(Offset::Beginning);
            let duplicate = resp.headers().contains_key(PRODUCER_RECEIVED_SEQ);

            Ok(AppendReceipt { offset, duplicate })
        }
        403 => {
            // Fenced: the server knows a newer (or same-id, newer-epoch)
            // producer.
            let server_epoch = resp
                .headers()
                .get(PRODUCER_EPOCH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(epoch);

            if auto_claim {
                // Take over with a fresh epoch; the sequence restarts at 1.
                let new_epoch = server_epoch + 1;
                {
                    let mut s = state.lock();
                    s.epoch = new_epoch;
                    s.next_seq = 2; // This batch re-sends as seq 1
                    s.epoch_claimed = false;
                }
                return Box::pin(send_batch(
                    stream,
                    producer_id,
                    content_type,
                    batch,
                    1,
                    new_epoch,
                    auto_claim,
                    state,
                    0,
                ))
                .await;
            }

            Err(ProducerError::StaleEpoch {
                server_epoch,
                our_epoch: epoch,
            })
        }
        409 => {
            // The server already has this sequence: idempotent success.
            let received = resp
                .headers()
                .get(PRODUCER_RECEIVED_SEQ)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            if let Some(received) = received {
                if received >= seq {
                    return Ok(AppendReceipt {
                        offset: Offset::Beginning,
                        duplicate: true,
                    });
                }
            }

            // Sequence gap - requests can arrive out of order within the
            // in-flight window; retry with backoff so earlier sequences
            // complete first.
            if retry_count < MAX_409_RETRIES {
                let delay_ms = 10 * (1 << retry_count.min(6)); // 10ms .. 640ms
                sleep(Duration::from_millis(delay_ms)).await;

                return Box::pin(send_batch(
                    stream,
                    producer_id,
                    content_type,
                    batch,
                    seq,
                    epoch,
                    auto_claim,
                    state,
                    retry_count + 1,
                ))
                .await;
            }

            let expected = resp
                .headers()
                .get(PRODUCER_EXPECTED_SEQ)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);

            Err(ProducerError::SequenceGap {
                expected,
                received: seq,
            })
        }
        _ => Err(ProducerError::Stream {
            message: StreamError::from_status(status, stream.url()).to_string(),
        }),
    }
}
