//! HTTP server implementing the durable streams protocol.
//!
//! One wildcard route per verb; every handler works through the shared
//! [`ServerContext`]. Procedure routes are tried first on GET, POST, PATCH
//! and DELETE; when no procedure matches, the request falls through to the
//! stream state machine.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, head, patch, post, put},
    Router,
};
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::cursor::{next_cursor, parse_cursor, CursorOptions};
use crate::error::StoreError;
use crate::fault::{corrupt, FaultDirective, FaultInjector};
use crate::headers::*;
use crate::producers::ProducerAppend;
use crate::router::RpcRouter;
use crate::store::{StreamEvent, StreamStore};
use crate::types::{
    normalize_content_type, parse_offset, ReadResult, ServerOptions, StreamConfig, StreamEntry,
    WaitOutcome, OFFSET_BEGINNING,
};
use crate::codec;

/// Shared server state: the store, the fault map, the active-reader
/// registry, and the shutdown signal. Owned by the server instance and
/// passed explicitly; there is no module-global state.
pub struct ServerContext {
    pub store: Arc<StreamStore>,
    pub options: ServerOptions,
    pub faults: FaultInjector,
    rpc: Option<RpcRouter>,
    active_readers: Mutex<HashSet<u64>>,
    next_reader_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl ServerContext {
    pub fn new(options: ServerOptions) -> Arc<Self> {
        Self::build(options, None)
    }

    /// Context with a procedure router mounted in front of the stream
    /// handlers.
    pub fn with_rpc(options: ServerOptions, rpc: RpcRouter) -> Arc<Self> {
        Self::build(options, Some(rpc))
    }

    fn build(options: ServerOptions, rpc: Option<RpcRouter>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            store: StreamStore::new(),
            options,
            faults: FaultInjector::new(),
            rpc,
            active_readers: Mutex::new(HashSet::new()),
            next_reader_id: AtomicU64::new(1),
            shutdown,
        })
    }

    /// Signal every live response to terminate and stop accepting new
    /// requests.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Number of live SSE readers.
    pub fn active_reader_count(&self) -> usize {
        self.active_readers.lock().len()
    }

    fn register_reader(self: &Arc<Self>) -> ReaderGuard {
        let id = self.next_reader_id.fetch_add(1, Ordering::Relaxed);
        self.active_readers.lock().insert(id);
        ReaderGuard {
            ctx: self.clone(),
            id,
        }
    }

    fn cursor_options(&self) -> CursorOptions {
        CursorOptions {
            interval_seconds: self.options.cursor_interval_seconds,
            epoch: self.options.cursor_epoch,
        }
    }
}

/// Handle for one live SSE reader; removed from the registry on any exit
/// path (completion, cancel, error) via Drop.
struct ReaderGuard {
    ctx: Arc<ServerContext>,
    id: u64,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.ctx.active_readers.lock().remove(&self.id);
    }
}

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<ServerContext>,
}

/// Query parameters accepted on stream GET requests.
#[derive(Debug, Default)]
struct ReadQuery {
    offset: Option<String>,
    live: Option<String>,
    cursor: Option<String>,
}

fn parse_read_query(raw: Option<&str>) -> ReadQuery {
    let mut query = ReadQuery::default();
    if let Some(raw) = raw {
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            match key.as_ref() {
                "offset" => query.offset = Some(value.into_owned()),
                "live" => query.live = Some(value.into_owned()),
                "cursor" => query.cursor = Some(value.into_owned()),
                _ => {}
            }
        }
    }
    query
}

/// Create the router with all stream endpoints.
pub fn create_router(ctx: Arc<ServerContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::HEAD,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/{*path}", put(handle_create))
        .route("/{*path}", head(handle_head))
        .route("/{*path}", get(handle_read))
        .route("/{*path}", post(handle_append))
        .route("/{*path}", delete(handle_delete))
        .route("/{*path}", patch(handle_patch))
        .layer(cors)
        .with_state(AppState { ctx })
}

/// PUT - Create a new stream
async fn handle_create(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let ctx = &state.ctx;
    if ctx.is_shutting_down() {
        return plain(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
    }
    let path = format!("/{}", path);
    debug!(path = %path, "creating stream");

    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str()).map(String::from);

    let ttl_seconds = match parse_ttl_header(&headers) {
        Ok(ttl) => ttl,
        Err(e) => return store_error_response(&e),
    };
    let expires_at = match parse_expires_at_header(&headers) {
        Ok(e) => e,
        Err(e) => return store_error_response(&e),
    };
    let closed = header_str(&headers, STREAM_CLOSED) == Some("true");

    let body_bytes = match read_body(body, ctx.options.max_append_bytes).await {
        Ok(bytes) => bytes,
        Err(resp) => return resp,
    };

    let config = StreamConfig {
        content_type: content_type.clone(),
        ttl_seconds,
        expires_at,
        initial_data: (!body_bytes.is_empty()).then(|| body_bytes.to_vec()),
        closed,
    };

    match ctx.store.create(&path, config) {
        Ok(created) => {
            let offset = ctx
                .store
                .current_offset(&path)
                .unwrap_or_else(|| OFFSET_BEGINNING.to_string());
            let mut response = Response::builder()
                .status(if created {
                    StatusCode::CREATED
                } else {
                    StatusCode::OK
                })
                .header(STREAM_OFFSET, &offset)
                .header(header::LOCATION, &path);
            if let Some(ct) = content_type {
                response = response.header(header::CONTENT_TYPE, ct);
            }
            response.body(Body::empty()).unwrap()
        }
        Err(e) => store_error_response(&e),
    }
}

/// HEAD - Stream metadata
async fn handle_head(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let ctx = &state.ctx;
    let path = format!("/{}", path);
    let query = parse_read_query(raw_query.as_deref());

    let head = match ctx.store.head(&path) {
        Some(h) => h,
        None => return plain(StatusCode::NOT_FOUND, "stream not found"),
    };

    let start = query.offset.as_deref().unwrap_or(OFFSET_BEGINNING);
    let etag = make_etag(&path, start, &head.current_offset, head.closed);
    let cursor = next_cursor(
        query.cursor.as_deref().and_then(parse_cursor),
        &ctx.cursor_options(),
    );

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(STREAM_OFFSET, &head.current_offset)
        .header(STREAM_CURSOR, cursor.to_string())
        .header(header::ETAG, etag);
    if head.closed {
        response = response.header(STREAM_CLOSED, "true");
    }
    if let Some(ct) = &head.content_type {
        response = response.header(header::CONTENT_TYPE, ct.as_str());
    }
    response.body(Body::empty()).unwrap()
}

/// GET - Read from stream (catch-up, long-poll, or SSE), or dispatch a GET
/// procedure.
async fn handle_read(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let ctx = &state.ctx;
    let path = format!("/{}", path);

    if let Some(rpc) = &ctx.rpc {
        if let Some(response) = rpc
            .dispatch(&Method::GET, &path, raw_query.as_deref(), b"")
            .await
        {
            return response;
        }
    }
    if ctx.is_shutting_down() {
        return plain(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
    }

    let query = parse_read_query(raw_query.as_deref());

    let fault = ctx.faults.take(&path);
    if let Some(f) = &fault {
        if let Some(delay) = f.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = f.status {
            return plain(
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                "injected fault",
            );
        }
    }

    let stream = match ctx.store.get(&path) {
        Some(s) => s,
        None => return plain(StatusCode::NOT_FOUND, "stream not found"),
    };

    let offset_param = query.offset.as_deref().unwrap_or(OFFSET_BEGINNING);
    if offset_param.is_empty() {
        return plain(StatusCode::BAD_REQUEST, "empty offset parameter");
    }
    // Resolve "now" to the tail at request time; validate concrete offsets
    // against this incarnation's generation.
    let from = if offset_param == "now" {
        stream.current_offset.clone()
    } else {
        offset_param.to_string()
    };
    if from != OFFSET_BEGINNING {
        match parse_offset(&from) {
            Some((generation, _)) if generation == stream.generation => {}
            _ => return plain(StatusCode::BAD_REQUEST, "invalid offset"),
        }
    }

    let client_cursor = query.cursor.as_deref().and_then(parse_cursor);

    match query.live.as_deref() {
        Some("sse") => handle_sse(state.clone(), path, from, client_cursor, stream, fault),
        Some("long-poll") => {
            handle_long_poll(state.clone(), path, from, client_cursor, fault).await
        }
        Some(other) => plain(
            StatusCode::BAD_REQUEST,
            &format!("unknown live mode: {}", other),
        ),
        None => handle_catch_up(state.clone(), path, from, client_cursor, &headers, fault).await,
    }
}

/// Build a 200 read response with the full header contract.
fn read_response(
    ctx: &ServerContext,
    path: &str,
    start: &str,
    result: &ReadResult,
    client_cursor: Option<u64>,
    fault: Option<&FaultDirective>,
) -> Response {
    let closed_header = result.closed && result.up_to_date;
    let etag = make_etag(path, start, &result.offset, closed_header);
    let cursor = next_cursor(client_cursor, &ctx.cursor_options());

    let mut body = ctx.store.format_response(path, &result.messages);
    if let Some(f) = fault {
        if f.corrupt_body {
            corrupt(&mut body);
        }
    }

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(STREAM_OFFSET, &result.offset)
        .header(STREAM_UP_TO_DATE, result.up_to_date.to_string())
        .header(STREAM_CURSOR, cursor.to_string())
        .header(header::ETAG, &etag);
    if closed_header {
        response = response.header(STREAM_CLOSED, "true");
    }
    if let Some(ct) = ctx.store.get(path).and_then(|s| s.content_type) {
        response = response.header(header::CONTENT_TYPE, ct);
    }

    if fault.map(|f| f.drop_connection).unwrap_or(false) {
        return response.body(dropped_body(body)).unwrap();
    }
    response.body(Body::from(body)).unwrap()
}

/// Body that yields a prefix of the payload and then aborts the connection.
fn dropped_body(body: Vec<u8>) -> Body {
    let half = body.len() / 2;
    let prefix = Bytes::from(body[..half].to_vec());
    Body::from_stream(futures::stream::iter(vec![
        Ok::<Bytes, std::io::Error>(prefix),
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "injected connection drop",
        )),
    ]))
}

/// Handle catch-up read (immediate response)
async fn handle_catch_up(
    state: AppState,
    path: String,
    from: String,
    client_cursor: Option<u64>,
    headers: &HeaderMap,
    fault: Option<FaultDirective>,
) -> Response {
    let ctx = &state.ctx;
    let result = match ctx.store.read(&path, &from) {
        Ok(r) => r,
        Err(e) => return store_error_response(&e),
    };

    // Conditional request: identical (path, start, end, closedness) means an
    // identical response, so the cached body is still valid.
    let closed_header = result.closed && result.up_to_date;
    let etag = make_etag(&path, &from, &result.offset, closed_header);
    if header_str(headers, header::IF_NONE_MATCH.as_str()) == Some(etag.as_str()) {
        let cursor = next_cursor(client_cursor, &ctx.cursor_options());
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, &etag)
            .header(STREAM_CURSOR, cursor.to_string())
            .body(Body::empty())
            .unwrap();
    }

    read_response(ctx, &path, &from, &result, client_cursor, fault.as_ref())
}

/// Handle long-poll read (wait for new data)
async fn handle_long_poll(
    state: AppState,
    path: String,
    from: String,
    client_cursor: Option<u64>,
    fault: Option<FaultDirective>,
) -> Response {
    let ctx = &state.ctx;

    let result = match ctx.store.read(&path, &from) {
        Ok(r) => r,
        Err(e) => return store_error_response(&e),
    };
    if !result.messages.is_empty() || result.closed {
        return read_response(ctx, &path, &from, &result, client_cursor, fault.as_ref());
    }

    let timeout = Duration::from_millis(ctx.options.long_poll_timeout_ms);
    let mut shutdown = ctx.shutdown_rx();

    let outcome = tokio::select! {
        outcome = ctx.store.wait_for_messages(&path, &from, timeout) => outcome,
        _ = shutdown.changed() => {
            return no_content(ctx, &result.offset, client_cursor, true);
        }
    };

    match outcome {
        Ok(WaitOutcome::Messages(result)) => {
            read_response(ctx, &path, &from, &result, client_cursor, fault.as_ref())
        }
        // Timeout: 204 with fresh cursor so the client can poll again
        // immediately.
        Ok(WaitOutcome::TimedOut { offset }) => no_content(ctx, &offset, client_cursor, false),
        Ok(WaitOutcome::StreamClosed { offset }) => no_content(ctx, &offset, client_cursor, true),
        Err(e) => store_error_response(&e),
    }
}

fn no_content(
    ctx: &ServerContext,
    offset: &str,
    client_cursor: Option<u64>,
    closed: bool,
) -> Response {
    let cursor = next_cursor(client_cursor, &ctx.cursor_options());
    let mut response = Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(STREAM_OFFSET, offset)
        .header(STREAM_UP_TO_DATE, "true")
        .header(STREAM_CURSOR, cursor.to_string());
    if closed {
        response = response.header(STREAM_CLOSED, "true");
    }
    response.body(Body::empty()).unwrap()
}

/// How SSE data-event payloads are encoded for a stream.
#[derive(Clone, Copy, PartialEq)]
enum SsePayload {
    Json,
    Text,
    Base64,
}

impl SsePayload {
    fn for_stream(stream: &StreamEntry) -> Self {
        match stream.content_type.as_deref().map(normalize_content_type) {
            Some("application/json") => SsePayload::Json,
            Some(ct) if ct.starts_with("text/") => SsePayload::Text,
            _ => SsePayload::Base64,
        }
    }

    fn encode(&self, data: &[u8]) -> String {
        match self {
            // Stored JSON records carry the trailing record separator.
            SsePayload::Json => {
                let trimmed = data.strip_suffix(b",").unwrap_or(data);
                String::from_utf8_lossy(trimmed).into_owned()
            }
            SsePayload::Text => String::from_utf8_lossy(data).into_owned(),
            SsePayload::Base64 => base64::engine::general_purpose::STANDARD.encode(data),
        }
    }
}

/// Handle SSE streaming: data events per message, control events per batch,
/// keep-alive controls between wakes, and a terminal closed control.
fn handle_sse(
    state: AppState,
    path: String,
    from: String,
    client_cursor: Option<u64>,
    stream: StreamEntry,
    fault: Option<FaultDirective>,
) -> Response {
    let ctx = state.ctx.clone();
    let payload_mode = SsePayload::for_stream(&stream);
    let guard = ctx.register_reader();
    let keep_alive = Duration::from_millis((ctx.options.long_poll_timeout_ms / 2).max(1));

    let events = async_stream::stream! {
        let _guard = guard;
        let mut shutdown = ctx.shutdown_rx();
        let mut rx = ctx.store.subscribe();
        let mut offset = from;
        let mut cursor = client_cursor;

        if let Some(payload) = fault.as_ref().and_then(|f| f.inject_sse_event.clone()) {
            yield Ok::<Bytes, Infallible>(frame("data", &payload));
        }

        'live: loop {
            match ctx.store.read(&path, &offset) {
                Ok(result) => {
                    for msg in &result.messages {
                        yield Ok(frame("data", &payload_mode.encode(&msg.data)));
                    }
                    offset = result.offset.clone();
                    let next = next_cursor(cursor, &ctx.cursor_options());
                    cursor = Some(next);
                    yield Ok(frame("control", &serde_json::json!({
                        "offset": offset,
                        "cursor": next.to_string(),
                        "upToDate": result.up_to_date,
                    }).to_string()));

                    if result.closed && result.up_to_date {
                        yield Ok(closed_frame(&offset));
                        break 'live;
                    }
                }
                Err(_) => {
                    // Deleted (or foreign generation after recreate): tell
                    // the reader the stream it was following is gone.
                    yield Ok(closed_frame(&offset));
                    break 'live;
                }
            }

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        yield Ok(closed_frame(&offset));
                        break 'live;
                    }
                    event = tokio::time::timeout(keep_alive, rx.recv()) => match event {
                        Ok(Ok(StreamEvent { path: p, .. })) if p == path => continue 'live,
                        Ok(Ok(_)) => continue,
                        Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => continue 'live,
                        Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => break 'live,
                        Err(_) => {
                            // Keep-alive: refresh the cursor so proxies see
                            // progress even without data.
                            let next = next_cursor(cursor, &ctx.cursor_options());
                            cursor = Some(next);
                            yield Ok(frame("control", &serde_json::json!({
                                "offset": offset,
                                "cursor": next.to_string(),
                                "upToDate": true,
                            }).to_string()));
                        }
                    }
                }
            }
        }
    };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache");
    if payload_mode == SsePayload::Base64 {
        response = response.header(STREAM_SSE_DATA_ENCODING, "base64");
    }
    response.body(Body::from_stream(events)).unwrap()
}

fn frame(event: &str, payload: &str) -> Bytes {
    Bytes::from(codec::sse_frame(event, payload))
}

fn closed_frame(offset: &str) -> Bytes {
    frame(
        "control",
        &serde_json::json!({ "offset": offset, "closed": true }).to_string(),
    )
}

/// POST - Append data (or close the stream, or dispatch a POST procedure)
async fn handle_append(
    State(state): State<AppState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let ctx = &state.ctx;
    let path = format!("/{}", path);

    let body_bytes = match read_body(body, ctx.options.max_append_bytes).await {
        Ok(bytes) => bytes,
        Err(resp) => return resp,
    };

    if let Some(rpc) = &ctx.rpc {
        if let Some(response) = rpc.dispatch(&Method::POST, &path, None, &body_bytes).await {
            return response;
        }
    }
    if ctx.is_shutting_down() {
        return plain(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
    }

    if let Some(f) = ctx.faults.take(&path) {
        if let Some(delay) = f.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = f.status {
            return plain(
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                "injected fault",
            );
        }
    }

    let content_type = header_str(&headers, header::CONTENT_TYPE.as_str());
    let producer = match parse_producer_headers(&headers) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    // Close request: append the trailing body (if any), freeze, wake all
    // waiters, answer with the final offset.
    if header_str(&headers, STREAM_CLOSED) == Some("true") {
        let trailing = (!body_bytes.is_empty()).then(|| body_bytes.to_vec());
        return match ctx.store.close(&path, trailing) {
            Ok(final_offset) => Response::builder()
                .status(StatusCode::NO_CONTENT)
                .header(STREAM_OFFSET, final_offset)
                .header(STREAM_CLOSED, "true")
                .body(Body::empty())
                .unwrap(),
            Err(e) => store_error_response(&e),
        };
    }

    match ctx
        .store
        .append(&path, body_bytes.to_vec(), content_type, producer.as_ref())
    {
        Ok(outcome) => {
            let mut response = Response::builder()
                .status(StatusCode::OK)
                .header(STREAM_OFFSET, &outcome.offset);
            if let Some(received) = outcome.received_seq {
                response = response.header(PRODUCER_RECEIVED_SEQ, received.to_string());
            }
            response.body(Body::empty()).unwrap()
        }
        Err(e) => store_error_response(&e),
    }
}

/// DELETE - Delete a stream (or dispatch a DELETE procedure)
async fn handle_delete(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> Response {
    let ctx = &state.ctx;
    let path = format!("/{}", path);

    if let Some(rpc) = &ctx.rpc {
        if let Some(response) = rpc
            .dispatch(&Method::DELETE, &path, raw_query.as_deref(), b"")
            .await
        {
            return response;
        }
    }

    if ctx.store.delete(&path) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        plain(StatusCode::NOT_FOUND, "stream not found")
    }
}

/// PATCH - procedures only; streams have no PATCH surface.
async fn handle_patch(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(raw_query): RawQuery,
    body: Body,
) -> Response {
    let ctx = &state.ctx;
    let path = format!("/{}", path);

    let body_bytes = match read_body(body, ctx.options.max_append_bytes).await {
        Ok(bytes) => bytes,
        Err(resp) => return resp,
    };

    if let Some(rpc) = &ctx.rpc {
        if let Some(response) = rpc
            .dispatch(&Method::PATCH, &path, raw_query.as_deref(), &body_bytes)
            .await
        {
            return response;
        }
    }
    plain(StatusCode::NOT_FOUND, "no route")
}

/// Extract idempotence headers. All three of id/epoch/seq must be present
/// together; a partial set fails the protocol precondition.
fn parse_producer_headers(headers: &HeaderMap) -> Result<Option<ProducerAppend>, Response> {
    let id = header_str(headers, PRODUCER_ID);
    let epoch = header_str(headers, PRODUCER_EPOCH);
    let seq = header_str(headers, PRODUCER_SEQ);

    match (id, epoch, seq) {
        (None, None, None) => Ok(None),
        (Some(id), Some(epoch), Some(seq)) => {
            let epoch: u64 = epoch
                .parse()
                .map_err(|_| plain(StatusCode::BAD_REQUEST, "invalid producer-epoch"))?;
            let seq: u64 = seq
                .parse()
                .map_err(|_| plain(StatusCode::BAD_REQUEST, "invalid producer-seq"))?;
            Ok(Some(ProducerAppend {
                producer_id: id.to_string(),
                epoch,
                seq,
                auto_claim: header_str(headers, PRODUCER_AUTO_CLAIM) == Some("true"),
            }))
        }
        _ => Err(plain(
            StatusCode::PRECONDITION_FAILED,
            "producer-id, producer-epoch and producer-seq must be sent together",
        )),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes, Response> {
    axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| plain(StatusCode::PAYLOAD_TOO_LARGE, "body too large"))
}

fn plain(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}

/// Map a store error to its protocol status, attaching the diagnostic
/// headers fence and gap errors carry.
fn store_error_response(err: &StoreError) -> Response {
    match err {
        StoreError::NotFound(_) => plain(StatusCode::NOT_FOUND, &err.to_string()),
        StoreError::ConflictExists
        | StoreError::ContentTypeMismatch { .. }
        | StoreError::StreamClosed => plain(StatusCode::CONFLICT, &err.to_string()),
        StoreError::SequenceConflict { expected } => Response::builder()
            .status(StatusCode::CONFLICT)
            .header(PRODUCER_EXPECTED_SEQ, expected.to_string())
            .body(Body::from(err.to_string()))
            .unwrap(),
        StoreError::Fenced { current_epoch } | StoreError::StaleEpoch { current_epoch } => {
            Response::builder()
                .status(StatusCode::FORBIDDEN)
                .header(PRODUCER_EPOCH, current_epoch.to_string())
                .body(Body::from(err.to_string()))
                .unwrap()
        }
        StoreError::InvalidOffset(_)
        | StoreError::EmptyBody
        | StoreError::EmptyArrayNotAllowed
        | StoreError::InvalidJson(_)
        | StoreError::TtlConflict
        | StoreError::InvalidTtl
        | StoreError::InvalidExpiresAt => plain(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

/// Generate an ETag for a read response.
///
/// Two reads with the same (path, start, end, closedness) produce identical
/// tags; the `:c` suffix distinguishes the closed tail from the open one.
fn make_etag(path: &str, start: &str, end: &str, closed: bool) -> String {
    let path_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(path);
    if closed {
        format!("\"{}:{}:{}:c\"", path_b64, start, end)
    } else {
        format!("\"{}:{}:{}\"", path_b64, start, end)
    }
}

fn parse_ttl_header(headers: &HeaderMap) -> Result<Option<u64>, StoreError> {
    match header_str(headers, STREAM_TTL) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| StoreError::InvalidTtl),
    }
}

fn parse_expires_at_header(headers: &HeaderMap) -> Result<Option<DateTime<Utc>>, StoreError> {
    match header_str(headers, STREAM_EXPIRES_AT) {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| StoreError::InvalidExpiresAt),
    }
}

/// Start the server and serve until shutdown.
pub async fn start_server(options: ServerOptions) -> std::io::Result<()> {
    let ctx = ServerContext::new(options);
    serve(ctx).await
}

/// Serve an already-built context (lets the caller keep a handle for
/// fault injection and shutdown).
pub async fn serve(ctx: Arc<ServerContext>) -> std::io::Result<()> {
    let addr = format!("{}:{}", ctx.options.host, ctx.options.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %listener.local_addr()?, "starting durable streams server");

    let router = create_router(ctx.clone());
    let mut shutdown = ctx.shutdown_rx();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            warn!("server shutting down");
        })
        .await
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;
    use crate::types::format_offset;

    fn test_ctx() -> Arc<ServerContext> {
        ServerContext::new(ServerOptions {
            long_poll_timeout_ms: 200,
            ..Default::default()
        })
    }

    async fn send(app: &Router, req: Request<Body>) -> axum::http::Response<Body> {
        app.clone().oneshot(req).await.unwrap()
    }

    fn put(uri: &str, ct: &str) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header("Content-Type", ct)
            .body(Body::empty())
            .unwrap()
    }

    fn post(uri: &str, ct: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", ct)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: axum::http::Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn header<'a>(response: &'a axum::http::Response<Body>, name: &str) -> Option<&'a str> {
        response.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[tokio::test]
    async fn test_create_then_idempotent_then_conflict() {
        let app = create_router(test_ctx());

        let r = send(&app, put("/t1", "application/json")).await;
        assert_eq!(r.status(), StatusCode::CREATED);
        assert_eq!(header(&r, STREAM_OFFSET), Some(OFFSET_BEGINNING));

        let r = send(&app, put("/t1", "application/json")).await;
        assert_eq!(r.status(), StatusCode::OK);

        let r = send(&app, put("/t1", "text/plain")).await;
        assert_eq!(r.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_append_and_catch_up_read() {
        let app = create_router(test_ctx());
        send(&app, put("/t1", "application/json")).await;

        let r = send(&app, post("/t1", "application/json", "{\"a\":1}")).await;
        assert_eq!(r.status(), StatusCode::OK);
        assert_eq!(header(&r, STREAM_OFFSET), Some(format_offset(0, 1).as_str()));

        send(&app, post("/t1", "application/json", "{\"a\":2}")).await;

        let r = send(&app, get("/t1?offset=-1")).await;
        assert_eq!(r.status(), StatusCode::OK);
        assert_eq!(header(&r, STREAM_UP_TO_DATE), Some("true"));
        assert_eq!(header(&r, STREAM_OFFSET), Some(format_offset(0, 2).as_str()));
        assert_eq!(body_string(r).await, "[{\"a\":1},{\"a\":2}]");
    }

    #[tokio::test]
    async fn test_read_missing_stream_is_404() {
        let app = create_router(test_ctx());
        let r = send(&app, get("/nope?offset=-1")).await;
        assert_eq!(r.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_read_foreign_generation_offset_is_400() {
        let app = create_router(test_ctx());
        send(&app, put("/t1", "text/plain")).await;
        send(&app, post("/t1", "text/plain", "a")).await;

        let r = send(&app, get(&format!("/t1?offset={}", format_offset(7, 1)))).await;
        assert_eq!(r.status(), StatusCode::BAD_REQUEST);

        let r = send(&app, get("/t1?offset=garbage")).await;
        assert_eq!(r.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_head_reports_offset_and_content_type() {
        let app = create_router(test_ctx());
        send(&app, put("/t1", "text/plain")).await;
        send(&app, post("/t1", "text/plain", "abc")).await;

        let r = send(
            &app,
            Request::builder()
                .method("HEAD")
                .uri("/t1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(r.status(), StatusCode::OK);
        assert_eq!(header(&r, STREAM_OFFSET), Some(format_offset(0, 1).as_str()));
        assert_eq!(header(&r, "content-type"), Some("text/plain"));
        assert!(header(&r, "etag").is_some());
    }

    #[tokio::test]
    async fn test_etag_round_trip_304() {
        let app = create_router(test_ctx());
        send(&app, put("/t1", "application/json")).await;
        send(&app, post("/t1", "application/json", "1")).await;

        let r = send(&app, get("/t1?offset=-1")).await;
        let etag = header(&r, "etag").unwrap().to_string();

        let r = send(
            &app,
            Request::builder()
                .method("GET")
                .uri("/t1?offset=-1")
                .header("If-None-Match", &etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(r.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(body_string(r).await, "");
    }

    #[tokio::test]
    async fn test_idempotent_producer_replay_and_gap() {
        let app = create_router(test_ctx());
        send(&app, put("/t1", "application/json")).await;

        let producer_post = |seq: &str, body: &str| {
            Request::builder()
                .method("POST")
                .uri("/t1")
                .header("Content-Type", "application/json")
                .header(PRODUCER_ID, "p")
                .header(PRODUCER_EPOCH, "1")
                .header(PRODUCER_SEQ, seq)
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let r = send(&app, producer_post("1", "\"x\"")).await;
        assert_eq!(r.status(), StatusCode::OK);
        let o1 = header(&r, STREAM_OFFSET).unwrap().to_string();

        // Replay: same offset, log unchanged, received-seq diagnostic.
        let r = send(&app, producer_post("1", "\"x\"")).await;
        assert_eq!(r.status(), StatusCode::OK);
        assert_eq!(header(&r, STREAM_OFFSET), Some(o1.as_str()));
        assert_eq!(header(&r, PRODUCER_RECEIVED_SEQ), Some("1"));

        let r = send(&app, producer_post("2", "\"y\"")).await;
        assert_eq!(r.status(), StatusCode::OK);
        assert!(header(&r, STREAM_OFFSET).unwrap() > o1.as_str());

        let r = send(&app, producer_post("4", "\"z\"")).await;
        assert_eq!(r.status(), StatusCode::CONFLICT);
        assert_eq!(header(&r, PRODUCER_EXPECTED_SEQ), Some("3"));

        let r = send(&app, get("/t1?offset=-1")).await;
        assert_eq!(body_string(r).await, "[\"x\",\"y\"]");
    }

    #[tokio::test]
    async fn test_partial_producer_headers_are_412() {
        let app = create_router(test_ctx());
        send(&app, put("/t1", "application/json")).await;

        let r = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/t1")
                .header("Content-Type", "application/json")
                .header(PRODUCER_ID, "p")
                .body(Body::from("1"))
                .unwrap(),
        )
        .await;
        assert_eq!(r.status(), StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn test_epoch_fencing() {
        let app = create_router(test_ctx());
        send(&app, put("/t1", "application/json")).await;

        let producer_post = |epoch: &str, seq: &str, claim: bool| {
            let mut b = Request::builder()
                .method("POST")
                .uri("/t1")
                .header("Content-Type", "application/json")
                .header(PRODUCER_ID, "p")
                .header(PRODUCER_EPOCH, epoch)
                .header(PRODUCER_SEQ, seq);
            if claim {
                b = b.header(PRODUCER_AUTO_CLAIM, "true");
            }
            b.body(Body::from("1")).unwrap()
        };

        send(&app, producer_post("5", "1", false)).await;

        // Older epoch is fenced.
        let r = send(&app, producer_post("4", "2", false)).await;
        assert_eq!(r.status(), StatusCode::FORBIDDEN);
        assert_eq!(header(&r, PRODUCER_EPOCH), Some("5"));

        // Newer epoch without opt-in is rejected too.
        let r = send(&app, producer_post("6", "1", false)).await;
        assert_eq!(r.status(), StatusCode::FORBIDDEN);

        // With the opt-in it takes over.
        let r = send(&app, producer_post("6", "1", true)).await;
        assert_eq!(r.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_close_and_observe() {
        let app = create_router(test_ctx());
        send(&app, put("/t1", "application/json")).await;
        send(&app, post("/t1", "application/json", "\"a\"")).await;
        send(&app, post("/t1", "application/json", "\"b\"")).await;

        let r = send(
            &app,
            Request::builder()
                .method("POST")
                .uri("/t1")
                .header("Content-Type", "application/json")
                .header(STREAM_CLOSED, "true")
                .body(Body::from("\"c\""))
                .unwrap(),
        )
        .await;
        assert_eq!(r.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&r, STREAM_OFFSET), Some(format_offset(0, 3).as_str()));

        let r = send(&app, get("/t1?offset=-1")).await;
        assert_eq!(header(&r, STREAM_CLOSED), Some("true"));
        assert_eq!(body_string(r).await, "[\"a\",\"b\",\"c\"]");

        let r = send(&app, post("/t1", "application/json", "\"d\"")).await;
        assert_eq!(r.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_append() {
        let ctx = test_ctx();
        let app = create_router(ctx.clone());
        send(&app, put("/t1", "application/json")).await;
        send(&app, post("/t1", "application/json", "1")).await;

        let tail = format_offset(0, 1);
        let poll = {
            let app = app.clone();
            let uri = format!("/t1?offset={}&live=long-poll", tail);
            tokio::spawn(async move { send(&app, get(&uri)).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        send(&app, post("/t1", "application/json", "2")).await;

        let r = poll.await.unwrap();
        assert_eq!(r.status(), StatusCode::OK);
        assert_eq!(body_string(r).await, "[2]");
    }

    #[tokio::test]
    async fn test_long_poll_timeout_is_204() {
        let app = create_router(test_ctx());
        send(&app, put("/t1", "application/json")).await;

        let r = send(&app, get("/t1?offset=-1&live=long-poll")).await;
        assert_eq!(r.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&r, STREAM_UP_TO_DATE), Some("true"));
        assert!(header(&r, STREAM_CURSOR).is_some());
    }

    #[tokio::test]
    async fn test_delete_wakes_long_poll_with_closed() {
        let ctx = test_ctx();
        let app = create_router(ctx.clone());
        send(&app, put("/t1", "text/plain")).await;

        let poll = {
            let app = app.clone();
            tokio::spawn(async move { send(&app, get("/t1?offset=-1&live=long-poll")).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let r = send(
            &app,
            Request::builder()
                .method("DELETE")
                .uri("/t1")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(r.status(), StatusCode::NO_CONTENT);

        let r = poll.await.unwrap();
        assert_eq!(r.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&r, STREAM_CLOSED), Some("true"));

        // Recreate starts a fresh generation.
        let r = send(&app, put("/t1", "text/plain")).await;
        assert_eq!(r.status(), StatusCode::CREATED);
        send(&app, post("/t1", "text/plain", "x")).await;
        let r = send(&app, get("/t1?offset=-1")).await;
        assert_eq!(header(&r, STREAM_OFFSET), Some(format_offset(1, 1).as_str()));
    }

    #[tokio::test]
    async fn test_fault_status_override() {
        let ctx = test_ctx();
        let app = create_router(ctx.clone());
        send(&app, put("/t1", "text/plain")).await;

        ctx.faults.install(
            "/t1",
            FaultDirective {
                status: Some(503),
                remaining: 1,
                ..Default::default()
            },
        );

        let r = send(&app, get("/t1?offset=-1")).await;
        assert_eq!(r.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Directive consumed; next read succeeds.
        let r = send(&app, get("/t1?offset=-1")).await;
        assert_eq!(r.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_payload_too_large_is_413() {
        let ctx = ServerContext::new(ServerOptions {
            max_append_bytes: 8,
            ..Default::default()
        });
        let app = create_router(ctx);
        send(&app, put("/t1", "text/plain")).await;

        let r = send(&app, post("/t1", "text/plain", "way more than eight bytes")).await;
        assert_eq!(r.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_procedure_dispatch_with_stream_fallback() {
        use crate::router::{RouterDef, RpcRouter};

        let rpc = RpcRouter::new(
            RouterDef::builder()
                .procedure("recall", Method::POST, "/banks/:bankId/recall")
                .procedure("listBanks", Method::GET, "/banks")
                .build()
                .unwrap(),
        )
        .handle("recall", |req| async move {
            Ok(Some(serde_json::json!({
                "bank": req.params["bankId"],
                "query": req.input.unwrap()["query"],
            })))
        })
        .handle("listBanks", |_| async move { Ok(None) });

        let ctx = ServerContext::with_rpc(ServerOptions::default(), rpc);
        let app = create_router(ctx);

        let r = send(&app, post("/banks/b1/recall", "application/json", "{\"query\":\"hi\"}")).await;
        assert_eq!(r.status(), StatusCode::OK);
        assert_eq!(
            body_string(r).await,
            "{\"bank\":\"b1\",\"query\":\"hi\"}"
        );

        let r = send(&app, get("/banks")).await;
        assert_eq!(r.status(), StatusCode::NO_CONTENT);

        // Non-procedure paths still reach the stream handlers.
        let r = send(&app, put("/banks/b1/stream", "application/json")).await;
        assert_eq!(r.status(), StatusCode::CREATED);
        let r = send(&app, post("/banks/b1/stream", "application/json", "1")).await;
        assert_eq!(r.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_requests() {
        let ctx = test_ctx();
        let app = create_router(ctx.clone());
        send(&app, put("/t1", "text/plain")).await;

        ctx.shutdown();
        let r = send(&app, get("/t1?offset=-1")).await;
        assert_eq!(r.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
