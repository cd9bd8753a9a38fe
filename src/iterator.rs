//! Stream consumption: catch-up paging, long-poll continuation, SSE
//! tailing, and back-pressured batch subscriptions.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;

use crate::error::StreamError;
use crate::headers::*;
use crate::sse::{SseDecoder, SseEvent};
use crate::stream::StreamHandle;
use crate::types::{LiveMode, Offset};

/// A chunk of data from the stream.
///
/// ## Chunk Semantics
///
/// A `Chunk` represents **one unit of data delivery** from the stream:
///
/// | Mode | What `data` contains |
/// |------|---------------------|
/// | **Catch-up** | One HTTP response body |
/// | **Long-poll** | One HTTP response body (data that arrived during poll) |
/// | **SSE** | One SSE data event payload |
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Chunk {
    /// The raw data bytes for this chunk.
    pub data: Bytes,
    /// Offset to resume from (for checkpointing).
    pub offset: Offset,
    /// Whether this chunk represents the current tail of the stream.
    pub up_to_date: bool,
    /// Whether the stream is closed and fully consumed.
    pub stream_closed: bool,
    /// Cursor for CDN request collapsing.
    pub cursor: Option<String>,
    /// HTTP status code from the response, if applicable.
    ///
    /// Common values:
    /// - `Some(200)`: Success with data
    /// - `Some(204)`: No content (long-poll timeout or stream closed)
    /// - `Some(304)`: Not modified
    /// - `None`: SSE connection closed, reconnect happens on next iteration
    pub status_code: Option<u16>,
}

/// A delivered batch, as seen by subscription handlers.
#[derive(Debug, Clone)]
pub struct Batch {
    pub data: Bytes,
    pub offset: Offset,
    pub up_to_date: bool,
    pub stream_closed: bool,
}

/// Refreshed request state returned by an [`OnError`] hook.
#[derive(Debug, Clone, Default)]
pub struct RetryDirective {
    pub headers: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
}

/// Recovery hook called once per surfaced connection error. Returning a
/// directive (e.g. a refreshed token header) retries the request; returning
/// `None` is an explicit "give up" and the error propagates.
pub type OnError = Arc<dyn Fn(&StreamError) -> Option<RetryDirective> + Send + Sync>;

/// Builder for configuring stream reads.
#[must_use = "builders do nothing unless you call .build()"]
pub struct ReadBuilder {
    stream: StreamHandle,
    offset: Offset,
    live: LiveMode,
    timeout: Duration,
    headers: Vec<(String, String)>,
    params: Vec<(String, String)>,
    cursor: Option<String>,
    on_error: Option<OnError>,
}

impl ReadBuilder {
    pub(crate) fn new(stream: StreamHandle) -> Self {
        Self {
            stream,
            offset: Offset::Beginning,
            live: LiveMode::Off,
            timeout: Duration::from_secs(30),
            headers: Vec::new(),
            params: Vec::new(),
            cursor: None,
            on_error: None,
        }
    }

    /// Set the starting offset.
    pub fn offset(mut self, offset: impl Into<Offset>) -> Self {
        self.offset = offset.into();
        self
    }

    /// Set the live mode.
    pub fn live(mut self, mode: LiveMode) -> Self {
        self.live = mode;
        self
    }

    /// Set the timeout for long-poll operations.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a custom header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Add a custom query parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Set initial cursor for CDN collapsing.
    pub fn cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    /// Set the connection-error recovery hook.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StreamError) -> Option<RetryDirective> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Build the ChunkIterator.
    ///
    /// No network request is made until `next_chunk()` is called.
    pub fn build(self) -> ChunkIterator {
        ChunkIterator {
            stream: self.stream,
            offset: self.offset,
            live: self.live,
            timeout: self.timeout,
            headers: self.headers,
            params: self.params,
            cursor: self.cursor,
            on_error: self.on_error,
            up_to_date: false,
            stream_closed: false,
            done: false,
            closed: false,
            resuming_from_pause: false,
            sse: None,
            sse_reconnects: 0,
        }
    }
}

struct SseState {
    response: reqwest::Response,
    decoder: SseDecoder,
    base64: bool,
}

/// Iterator for reading chunks from a stream.
pub struct ChunkIterator {
    stream: StreamHandle,
    offset: Offset,
    live: LiveMode,
    timeout: Duration,
    headers: Vec<(String, String)>,
    params: Vec<(String, String)>,
    cursor: Option<String>,
    on_error: Option<OnError>,
    up_to_date: bool,
    stream_closed: bool,
    done: bool,
    closed: bool,
    resuming_from_pause: bool,
    sse: Option<SseState>,
    sse_reconnects: u32,
}

impl ChunkIterator {
    /// Get the current offset.
    pub fn offset(&self) -> &Offset {
        &self.offset
    }

    /// Check if we've caught up to the stream tail.
    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date
    }

    /// Whether the stream was observed closed at its tail.
    pub fn is_stream_closed(&self) -> bool {
        self.stream_closed
    }

    /// Get the current cursor.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Cancel the session and release resources.
    pub fn cancel(&mut self) {
        self.closed = true;
        self.sse = None;
    }

    /// Pause the session (e.g. on a visibility change): drops any live
    /// connection; the next `next_chunk` requests an immediate page rather
    /// than a long-poll wait.
    pub fn pause(&mut self) {
        self.sse = None;
        self.resuming_from_pause = true;
    }

    /// Fetch the next chunk.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, StreamError> {
        if self.closed {
            return Err(StreamError::IteratorClosed);
        }
        if self.done {
            return Ok(None);
        }

        if self.sse.is_some() {
            return self.next_sse_chunk().await;
        }

        if self.resuming_from_pause {
            self.resuming_from_pause = false;
            return self.next_http(None).await;
        }

        match self.live {
            LiveMode::Sse => self.establish_sse_and_read().await,
            LiveMode::Auto => {
                if self.up_to_date {
                    // After catching up, try SSE
                    self.establish_sse_and_read().await
                } else {
                    self.next_http(None).await
                }
            }
            LiveMode::LongPoll => self.next_http(Some("long-poll")).await,
            LiveMode::Off => self.next_http(None).await,
        }
    }

    /// One-shot catch-up: read until the first up-to-date response and
    /// return the concatenated bytes.
    pub async fn body(&mut self) -> Result<Bytes, StreamError> {
        let mut out = Vec::new();
        loop {
            match self.next_chunk().await? {
                Some(chunk) => {
                    out.extend_from_slice(&chunk.data);
                    if chunk.up_to_date || chunk.stream_closed {
                        return Ok(Bytes::from(out));
                    }
                }
                None => return Ok(Bytes::from(out)),
            }
        }
    }

    /// One-shot catch-up for JSON streams: parse every batch and return the
    /// items in log order.
    pub async fn json_items<T: serde::de::DeserializeOwned>(
        &mut self,
    ) -> Result<Vec<T>, StreamError> {
        let mut items = Vec::new();
        loop {
            match self.next_chunk().await? {
                Some(chunk) => {
                    items.extend(parse_items::<T>(&chunk.data)?);
                    if chunk.up_to_date || chunk.stream_closed {
                        return Ok(items);
                    }
                }
                None => return Ok(items),
            }
        }
    }

    /// Live subscription: the handler is invoked per batch and awaited, so
    /// a slow handler back-pressures the reader loop. Terminates when the
    /// stream closes, the iterator is cancelled, or an unrecoverable error
    /// surfaces.
    pub async fn subscribe<F, Fut>(&mut self, mut handler: F) -> Result<(), StreamError>
    where
        F: FnMut(Batch) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            match self.next_chunk().await? {
                Some(chunk) => {
                    let stream_closed = chunk.stream_closed;
                    handler(Batch {
                        data: chunk.data,
                        offset: chunk.offset,
                        up_to_date: chunk.up_to_date,
                        stream_closed,
                    })
                    .await;
                    if stream_closed {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }

    /// Live JSON subscription: batches are parsed into items before
    /// delivery; empty keep-alive batches are skipped unless they carry a
    /// state change.
    pub async fn subscribe_json<T, F, Fut>(&mut self, mut handler: F) -> Result<(), StreamError>
    where
        T: serde::de::DeserializeOwned,
        F: FnMut(Vec<T>, Batch) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            match self.next_chunk().await? {
                Some(chunk) => {
                    let stream_closed = chunk.stream_closed;
                    let items = parse_items::<T>(&chunk.data)?;
                    if !items.is_empty() || chunk.up_to_date || stream_closed {
                        handler(
                            items,
                            Batch {
                                data: chunk.data,
                                offset: chunk.offset,
                                up_to_date: chunk.up_to_date,
                                stream_closed,
                            },
                        )
                        .await;
                    }
                    if stream_closed {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }

    async fn next_http(&mut self, live_param: Option<&str>) -> Result<Option<Chunk>, StreamError> {
        let retry = self.stream.client.retry.clone();
        let mut attempt = 0;
        let mut hook_spent = false;

        loop {
            match self.fetch_http(live_param).await {
                Ok(chunk) => return Ok(chunk),
                Err(e) if e.is_retryable() && retry.allows(attempt) => {
                    tokio::time::sleep(retry.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    // The hook runs once per surfaced error; `None` is an
                    // explicit give-up.
                    if !hook_spent {
                        if let Some(hook) = self.on_error.clone() {
                            hook_spent = true;
                            if let Some(directive) = hook(&e) {
                                self.apply_directive(directive);
                                attempt = 0;
                                continue;
                            }
                        }
                    }
                    return Err(e);
                }
            }
        }
    }

    fn apply_directive(&mut self, directive: RetryDirective) {
        for (key, value) in directive.headers {
            self.headers.retain(|(k, _)| *k != key);
            self.headers.push((key, value));
        }
        for (key, value) in directive.params {
            self.params.retain(|(k, _)| *k != key);
            self.params.push((key, value));
        }
    }

    async fn fetch_http(&mut self, live_param: Option<&str>) -> Result<Option<Chunk>, StreamError> {
        let url = self.stream.build_read_url(
            &self.offset,
            live_param,
            self.cursor.as_deref(),
            &self.params,
        );

        let mut req = self.stream.client.inner.get(&url);
        for (key, value) in self.stream.client.get_headers().iter() {
            req = req.header(key.clone(), value.clone());
        }
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        // The long-poll request may sleep server-side; give it headroom
        // beyond the server's own timeout.
        if live_param == Some("long-poll") {
            req = req.timeout(self.timeout + Duration::from_secs(5));
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                // Timeout in long-poll means up-to-date
                self.up_to_date = true;
                if self.live == LiveMode::Off {
                    self.done = true;
                    return Ok(None);
                }
                return Ok(Some(self.empty_chunk(Some(204))));
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status().as_u16();

        match status {
            200 => {
                let offset = header_value(&resp, STREAM_OFFSET)
                    .map(|s| Offset::parse(&s))
                    .unwrap_or_else(|| self.offset.clone());
                let cursor = header_value(&resp, STREAM_CURSOR);
                let up_to_date = header_value(&resp, STREAM_UP_TO_DATE).as_deref() == Some("true");
                let stream_closed = header_value(&resp, STREAM_CLOSED).as_deref() == Some("true");

                let data = resp.bytes().await?;

                self.offset = offset.clone();
                self.cursor = cursor.clone();
                self.up_to_date = up_to_date;
                self.stream_closed = stream_closed;

                if stream_closed || (up_to_date && self.live == LiveMode::Off) {
                    self.done = true;
                }

                Ok(Some(Chunk {
                    data,
                    offset,
                    up_to_date,
                    stream_closed,
                    cursor,
                    status_code: Some(200),
                }))
            }
            204 => {
                // No content: long-poll timeout, or closure while waiting.
                if let Some(offset) = header_value(&resp, STREAM_OFFSET) {
                    self.offset = Offset::parse(&offset);
                }
                if let Some(cursor) = header_value(&resp, STREAM_CURSOR) {
                    self.cursor = Some(cursor);
                }
                self.up_to_date = true;
                if header_value(&resp, STREAM_CLOSED).as_deref() == Some("true") {
                    self.stream_closed = true;
                    self.done = true;
                    return Ok(Some(self.empty_chunk(Some(204))));
                }

                if self.live == LiveMode::Off {
                    self.done = true;
                    return Ok(None);
                }
                Ok(Some(self.empty_chunk(Some(204))))
            }
            304 => {
                // Not modified - just advance cursor
                if let Some(cursor) = header_value(&resp, STREAM_CURSOR) {
                    self.cursor = Some(cursor);
                }
                Ok(Some(self.empty_chunk(Some(304))))
            }
            404 => Err(StreamError::NotFound {
                url: self.stream.url().to_string(),
            }),
            _ => Err(StreamError::from_status(status, self.stream.url())),
        }
    }

    fn empty_chunk(&self, status_code: Option<u16>) -> Chunk {
        Chunk {
            data: Bytes::new(),
            offset: self.offset.clone(),
            up_to_date: self.up_to_date,
            stream_closed: self.stream_closed,
            cursor: self.cursor.clone(),
            status_code,
        }
    }

    async fn establish_sse_and_read(&mut self) -> Result<Option<Chunk>, StreamError> {
        // Bounded reconnect backoff; reset once a connection yields events.
        if self.sse_reconnects > 0 {
            let retry = &self.stream.client.retry;
            if !retry.allows(self.sse_reconnects) {
                return Err(StreamError::ServerError {
                    status: 0,
                    message: "SSE reconnect attempts exhausted".to_string(),
                });
            }
            tokio::time::sleep(retry.backoff(self.sse_reconnects - 1)).await;
        }

        let url =
            self.stream
                .build_read_url(&self.offset, Some("sse"), self.cursor.as_deref(), &self.params);

        let mut req = self
            .stream
            .client
            .inner
            .get(&url)
            .header("Accept", "text/event-stream");
        for (key, value) in self.stream.client.get_headers().iter() {
            req = req.header(key.clone(), value.clone());
        }
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                self.sse_reconnects += 1;
                return Err(e.into());
            }
        };
        let status = resp.status().as_u16();

        match status {
            200 => {
                let content_type = header_value(&resp, "content-type").unwrap_or_default();
                if !content_type.contains("text/event-stream") {
                    // Fall back to long-poll
                    self.live = LiveMode::LongPoll;
                    return self.next_http(Some("long-poll")).await;
                }

                let base64 =
                    header_value(&resp, STREAM_SSE_DATA_ENCODING).as_deref() == Some("base64");
                self.sse = Some(SseState {
                    response: resp,
                    decoder: SseDecoder::new(),
                    base64,
                });
                self.next_sse_chunk().await
            }
            400 => {
                // SSE not supported - fall back to long-poll
                self.live = LiveMode::LongPoll;
                self.next_http(Some("long-poll")).await
            }
            404 => Err(StreamError::NotFound {
                url: self.stream.url().to_string(),
            }),
            _ => Err(StreamError::from_status(status, self.stream.url())),
        }
    }

    async fn next_sse_chunk(&mut self) -> Result<Option<Chunk>, StreamError> {
        loop {
            // Drain the decoder first; the field borrow must end before we
            // touch the rest of self.
            let event = self.sse.as_mut().and_then(|s| s.decoder.next_event());
            if let Some(event) = event {
                self.sse_reconnects = 0;
                match event {
                    SseEvent::Data(payload) => {
                        let base64 = self.sse.as_ref().map(|s| s.base64).unwrap_or(false);
                        let data = if base64 {
                            match base64::engine::general_purpose::STANDARD.decode(&payload) {
                                Ok(bytes) => Bytes::from(bytes),
                                Err(e) => {
                                    return Err(StreamError::ParseError(format!(
                                        "bad base64 SSE payload: {}",
                                        e
                                    )))
                                }
                            }
                        } else {
                            Bytes::from(payload)
                        };
                        return Ok(Some(Chunk {
                            data,
                            offset: self.offset.clone(),
                            up_to_date: self.up_to_date,
                            stream_closed: false,
                            cursor: self.cursor.clone(),
                            status_code: Some(200),
                        }));
                    }
                    SseEvent::Control(frame) => {
                        self.offset = Offset::parse(&frame.offset);
                        if let Some(cursor) = frame.cursor {
                            self.cursor = Some(cursor);
                        }
                        self.up_to_date = frame.up_to_date || frame.closed;

                        if frame.closed {
                            self.stream_closed = true;
                            self.done = true;
                            self.sse = None;
                            return Ok(Some(self.empty_chunk(Some(200))));
                        }
                        if frame.up_to_date {
                            return Ok(Some(self.empty_chunk(Some(200))));
                        }
                        continue;
                    }
                }
            }

            // Need more bytes from the transport.
            let read = match self.sse.as_mut() {
                Some(state) => state.response.chunk().await,
                None => {
                    // Connection was dropped; pull a page while the next
                    // call re-establishes SSE from the last offset.
                    return self.next_http(Some("long-poll")).await;
                }
            };

            match read {
                Ok(Some(bytes)) => {
                    if let Some(state) = self.sse.as_mut() {
                        state.decoder.push(&bytes);
                    }
                }
                Ok(None) => {
                    // Connection closed cleanly
                    self.sse = None;
                    if self.live.is_live() {
                        self.sse_reconnects += 1;
                        return Ok(Some(self.empty_chunk(None)));
                    }
                    self.done = true;
                    return Ok(None);
                }
                Err(e) => {
                    self.sse = None;
                    self.sse_reconnects += 1;
                    if self.live.is_live() {
                        // Transport failure: signal an empty chunk so the
                        // driver loop reconnects from the last offset.
                        return Ok(Some(self.empty_chunk(None)));
                    }
                    return Err(e.into());
                }
            }
        }
    }
}

fn header_value(resp: &reqwest::Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Parse a delivered payload into items: an HTTP batch is a JSON array,
/// an SSE data event is a single JSON value.
fn parse_items<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<Vec<T>, StreamError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let value: serde_json::Value = serde_json::from_slice(data)
        .map_err(|e| StreamError::ParseError(format!("bad JSON batch: {}", e)))?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };
    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item)
                .map_err(|e| StreamError::ParseError(format!("bad JSON item: {}", e)))
        })
        .collect()
}
